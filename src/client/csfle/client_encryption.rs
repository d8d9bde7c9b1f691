//! Explicit encryption and data key management.

use std::sync::Arc;

use typed_builder::TypedBuilder;

use super::options::KmsProviders;
use crate::{
    bson::{Binary, Bson, Document, Uuid},
    client::options::TlsOptions,
    coll::options::CreateCollectionOptions,
    crypt::{
        engine::Engine,
        key_broker::KeyBroker,
        key_vault::KeyVault,
        kms::KmsClient,
    },
    error::{Error, Result},
    results::DeleteResult,
    trace::ENCRYPTION_TRACING_EVENT_TARGET,
    Client,
    Cursor,
    Database,
    Namespace,
};

pub use super::options::QueryAnalysis;
pub use crate::crypt::{
    data_key::DataKey,
    engine::{Algorithm, EncryptOptions, QueryType, RangeOptions},
    key_broker::EncryptKey,
    kms::{KmsProvider, KmsProviderType, MasterKey, RetryPolicy},
};

/// A handle for explicit encryption and data key management.
///
/// ```no_run
/// # use mongodb_csfle::{bson::{doc, Binary}, client_encryption::{Algorithm, ClientEncryption, KmsProvider, MasterKey}, Client, Namespace, error::Result};
/// # async fn run(key_vault_client: Client, local_key: Binary) -> Result<()> {
/// let client_encryption = ClientEncryption::new(
///     key_vault_client,
///     Namespace::new("keyvault", "datakeys"),
///     [(KmsProvider::local(), doc! { "key": local_key }, None)],
/// )?;
/// let key_id = client_encryption
///     .create_data_key(MasterKey::local(), None)
///     .await?;
/// let encrypted = client_encryption
///     .encrypt("secret", key_id, Algorithm::Deterministic, None)
///     .await?;
/// assert_eq!(client_encryption.decrypt(&encrypted).await?, "secret".into());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ClientEncryption {
    engine: Engine,
    kms: Arc<KmsClient>,
    // The key vault only holds a weak handle.
    key_vault_client: Client,
}

/// Options for [`ClientEncryption::create_data_key`].
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DataKeyOptions {
    /// Alternate names for the new key. Each must be unused by every other key.
    pub key_alt_names: Option<Vec<String>>,

    /// 96 bytes of key material to use instead of generated material.
    pub key_material: Option<Vec<u8>>,
}

/// Options for [`ClientEncryption::rewrap_many_data_key`].
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct RewrapManyDataKeyOptions {
    /// The master key to rewrap with. Each key keeps its current master key when unset.
    pub master_key: Option<MasterKey>,
}

/// The outcome of [`ClientEncryption::rewrap_many_data_key`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct RewrapManyDataKeyResult {
    /// How many keys were rewrapped.
    pub modified_count: u64,
}

impl ClientEncryption {
    /// Creates a handle that stores keys in `key_vault_namespace` through `key_vault_client`.
    pub fn new(
        key_vault_client: Client,
        key_vault_namespace: Namespace,
        kms_providers: impl IntoIterator<Item = (KmsProvider, Document, Option<TlsOptions>)>,
    ) -> Result<Self> {
        Self::with_retry_policy(
            key_vault_client,
            key_vault_namespace,
            kms_providers,
            RetryPolicy::default(),
        )
    }

    /// Like [`ClientEncryption::new`], with a custom policy for retrying KMS requests.
    pub fn with_retry_policy(
        key_vault_client: Client,
        key_vault_namespace: Namespace,
        kms_providers: impl IntoIterator<Item = (KmsProvider, Document, Option<TlsOptions>)>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let kms = Arc::new(KmsClient::new(KmsProviders::new(kms_providers)?, retry)?);
        let vault = KeyVault::new(key_vault_client.weak(), key_vault_namespace);
        Ok(Self {
            engine: Engine::new(KeyBroker::new(vault, kms.clone())),
            kms,
            key_vault_client,
        })
    }

    fn vault(&self) -> &KeyVault {
        self.engine.keys().vault()
    }

    /// Generates a data key, wraps it with `master_key` and stores it in the key vault. Returns the
    /// new key's id.
    pub async fn create_data_key(
        &self,
        master_key: MasterKey,
        options: impl Into<Option<DataKeyOptions>>,
    ) -> Result<Uuid> {
        let options = options.into().unwrap_or_default();
        let alt_names = options.key_alt_names.unwrap_or_default();
        for (i, name) in alt_names.iter().enumerate() {
            if alt_names[..i].contains(name) {
                return Err(Error::invalid_argument(format!(
                    "key alt name {name:?} is listed twice"
                )));
            }
        }
        let key = DataKey::create(&self.kms, &master_key, alt_names, options.key_material).await?;
        let id = self.vault().insert(&key).await?;
        tracing::debug!(
            target: ENCRYPTION_TRACING_EVENT_TARGET,
            key_id = %id,
            provider = %master_key.provider(),
            "Created data key",
        );
        Ok(id)
    }

    /// Decrypts the key material of every key matching `filter` and encrypts it again, with the
    /// master key from `options` or with each key's current one.
    pub async fn rewrap_many_data_key(
        &self,
        filter: Document,
        options: impl Into<Option<RewrapManyDataKeyOptions>>,
    ) -> Result<RewrapManyDataKeyResult> {
        let master_key = options.into().and_then(|o| o.master_key);
        let keys = self.vault().find(filter).await?;
        let mut modified_count = 0;
        for key in keys {
            let set = key.rewrap(&self.kms, master_key.as_ref()).await?;
            self.vault().replace_wrapped(&key.id, set).await?;
            self.engine.keys().forget(&key.id);
            modified_count += 1;
        }
        Ok(RewrapManyDataKeyResult { modified_count })
    }

    /// Removes a key from the key vault.
    pub async fn delete_key(&self, id: &Uuid) -> Result<DeleteResult> {
        let deleted = self.vault().delete(id).await?;
        self.engine.keys().forget(id);
        Ok(DeleteResult {
            deleted_count: u64::from(deleted),
        })
    }

    /// Finds a key by id.
    pub async fn get_key(&self, id: &Uuid) -> Result<Option<DataKey>> {
        self.vault().find_by_id(id).await
    }

    /// Iterates over every key in the key vault.
    pub async fn get_keys(&self) -> Result<Cursor<DataKey>> {
        self.vault().cursor(Document::new()).await
    }

    /// Finds a key by one of its alt names.
    pub async fn get_key_by_alt_name(
        &self,
        key_alt_name: impl AsRef<str>,
    ) -> Result<Option<DataKey>> {
        self.vault().find_by_alt_name(key_alt_name.as_ref()).await
    }

    /// Adds an alt name to a key and returns the updated key, or `None` if no key has that id.
    /// Fails with [`DuplicateKeyAltName`](crate::error::ErrorKind::DuplicateKeyAltName) when
    /// another key already uses the name.
    pub async fn add_key_alt_name(
        &self,
        id: &Uuid,
        key_alt_name: impl AsRef<str>,
    ) -> Result<Option<DataKey>> {
        let updated = self.vault().add_key_alt_name(id, key_alt_name.as_ref()).await?;
        self.engine.keys().forget(id);
        Ok(updated)
    }

    /// Removes an alt name from a key and returns the key as it was before, or `None` if no key
    /// has that id.
    pub async fn remove_key_alt_name(
        &self,
        id: &Uuid,
        key_alt_name: impl AsRef<str>,
    ) -> Result<Option<DataKey>> {
        let previous = self
            .vault()
            .remove_key_alt_name(id, key_alt_name.as_ref())
            .await?;
        self.engine.keys().forget(id);
        Ok(previous)
    }

    /// Encrypts a single value.
    ///
    /// `Indexed` and `Range` need a contention factor. With a query type set, the result is a
    /// query operand rather than a value to store.
    pub async fn encrypt(
        &self,
        value: impl Into<Bson>,
        key: impl Into<EncryptKey>,
        algorithm: Algorithm,
        options: impl Into<Option<EncryptOptions>>,
    ) -> Result<Binary> {
        let options = options.into().unwrap_or_default();
        self.engine
            .encrypt_value(value.into(), key.into(), algorithm, &options)
            .await
    }

    /// Encrypts the bounds of a range query on a `Range` field. `expression` is either
    /// `{$and: [{field: {$gt: a}}, {field: {$lt: b}}]}` or its aggregate form
    /// `{$and: [{$gt: ["$field", a]}, {$lt: ["$field", b]}]}`; one bound may be left out.
    pub async fn encrypt_expression(
        &self,
        expression: Document,
        key: impl Into<EncryptKey>,
        options: EncryptOptions,
    ) -> Result<Document> {
        self.engine
            .encrypt_expression(expression, key.into(), &options)
            .await
    }

    /// Decrypts a value encrypted by [`ClientEncryption::encrypt`] or by automatic encryption.
    pub async fn decrypt(&self, value: &Binary) -> Result<Bson> {
        self.engine.decrypt_value(value).await
    }

    /// Creates a queryable encryption collection. Every `encryptedFields.fields` entry whose
    /// `keyId` is null gets a new data key wrapped with `master_key`. Returns the
    /// `encryptedFields` the collection was created with.
    pub async fn create_encrypted_collection(
        &self,
        db: &Database,
        name: impl AsRef<str>,
        master_key: MasterKey,
        options: CreateCollectionOptions,
    ) -> Result<Document> {
        let mut options = options;
        let mut encrypted_fields = options.encrypted_fields.take().ok_or_else(|| {
            Error::invalid_argument("create_encrypted_collection requires encrypted_fields")
        })?;
        if let Ok(fields) = encrypted_fields.get_array_mut("fields") {
            for field in fields {
                let Bson::Document(field) = field else {
                    continue;
                };
                if matches!(field.get("keyId"), Some(Bson::Null)) {
                    let id = self.create_data_key(master_key.clone(), None).await?;
                    field.insert("keyId", id);
                }
            }
        }
        options.encrypted_fields = Some(encrypted_fields.clone());
        db.create_collection(name, options).await?;
        Ok(encrypted_fields)
    }

    /// The client data keys are read and written through.
    pub fn key_vault_client(&self) -> &Client {
        &self.key_vault_client
    }
}
