use bson::{doc, spec::BinarySubtype, Binary, DateTime, Document, Uuid};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{
    aead::KEY_LEN,
    kms::{KmsClient, MasterKey},
};
use crate::error::{Error, Result};

/// A data key as stored in the key vault collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DataKey {
    /// The key's UUID.
    #[serde(rename = "_id")]
    pub id: Uuid,

    /// Alternate names the key can be looked up by.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_alt_names: Vec<String>,

    /// The key material, encrypted with the master key.
    pub key_material: Binary,

    /// Where the master key lives, as a `masterKey` document.
    pub master_key: Document,

    /// When the key was created.
    pub creation_date: DateTime,

    /// When the key material or master key last changed.
    pub update_date: DateTime,

    /// Reserved; always zero.
    #[serde(default)]
    pub status: i32,
}

impl DataKey {
    /// Generates key material (unless `key_material` is given), wraps it with `master_key` and
    /// returns the document to insert into the key vault.
    pub(crate) async fn create(
        kms: &KmsClient,
        master_key: &MasterKey,
        key_alt_names: Vec<String>,
        key_material: Option<Vec<u8>>,
    ) -> Result<Self> {
        let material = match key_material {
            Some(material) if material.len() != KEY_LEN => {
                return Err(Error::invalid_argument(format!(
                    "keyMaterial must be {KEY_LEN} bytes, got {}",
                    material.len()
                )))
            }
            Some(material) => material,
            None => {
                let mut material = vec![0u8; KEY_LEN];
                rand::rng().fill_bytes(&mut material);
                material
            }
        };
        let (wrapped, stored_master_key) = kms.wrap_key(master_key, &material).await?;
        let now = DateTime::now();
        Ok(Self {
            id: Uuid::new(),
            key_alt_names,
            key_material: Binary {
                subtype: BinarySubtype::Generic,
                bytes: wrapped,
            },
            master_key: stored_master_key.to_document()?,
            creation_date: now,
            update_date: now,
            status: 0,
        })
    }

    /// The parsed `masterKey`.
    pub fn master_key(&self) -> Result<MasterKey> {
        MasterKey::from_document(&self.master_key)
    }

    /// Decrypts the key material.
    pub(crate) async fn unwrap(&self, kms: &KmsClient) -> Result<Vec<u8>> {
        let material = kms
            .unwrap_key(&self.master_key()?, &self.key_material.bytes)
            .await?;
        if material.len() != KEY_LEN {
            return Err(Error::encryption(format!(
                "data key {} decrypted to {} bytes, expected {KEY_LEN}",
                self.id,
                material.len()
            )));
        }
        Ok(material)
    }

    /// Re-wraps the key material under `master_key`, or under its current master key. Returns the
    /// `$set` document for the key vault update.
    pub(crate) async fn rewrap(
        &self,
        kms: &KmsClient,
        master_key: Option<&MasterKey>,
    ) -> Result<Document> {
        let material = self.unwrap(kms).await?;
        let target = match master_key {
            Some(key) => key.clone(),
            None => self.master_key()?,
        };
        let (wrapped, stored) = kms.wrap_key(&target, &material).await?;
        Ok(doc! {
            "keyMaterial": Binary { subtype: BinarySubtype::Generic, bytes: wrapped },
            "masterKey": stored.to_document()?,
        })
    }

    pub(crate) fn from_document(doc: Document) -> Result<Self> {
        bson::from_document(doc)
            .map_err(|e| Error::invalid_response(format!("malformed key vault document: {e}")))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        client::csfle::options::KmsProviders,
        crypt::kms::{test::local_kms, KmsProvider, RetryPolicy},
    };

    #[tokio::test]
    async fn create_then_unwrap() {
        let kms = local_kms();
        let key = DataKey::create(&kms, &MasterKey::local(), vec!["alt".to_string()], None)
            .await
            .unwrap();
        assert_eq!(key.key_alt_names, vec!["alt".to_string()]);
        assert_eq!(key.master_key, doc! { "provider": "local" });
        assert_eq!(key.unwrap(&kms).await.unwrap().len(), KEY_LEN);

        let stored = bson::to_document(&key).unwrap();
        assert!(stored.get_binary_generic("keyMaterial").is_ok());
        assert_eq!(DataKey::from_document(stored).unwrap(), key);
    }

    #[tokio::test]
    async fn custom_key_material_is_preserved() {
        let kms = local_kms();
        let material = vec![7u8; KEY_LEN];
        let key = DataKey::create(&kms, &MasterKey::local(), Vec::new(), Some(material.clone()))
            .await
            .unwrap();
        assert_eq!(key.unwrap(&kms).await.unwrap(), material);

        let short = DataKey::create(&kms, &MasterKey::local(), Vec::new(), Some(vec![1; 32])).await;
        assert!(short.is_err());
    }

    #[tokio::test]
    async fn rewrap_to_another_named_provider() {
        let providers = KmsProviders::new([
            (
                KmsProvider::local(),
                doc! { "key": Binary { subtype: BinarySubtype::Generic, bytes: vec![1; KEY_LEN] } },
                None,
            ),
            (
                KmsProvider::local().with_name("second"),
                doc! { "key": Binary { subtype: BinarySubtype::Generic, bytes: vec![2; KEY_LEN] } },
                None,
            ),
        ])
        .unwrap();
        let kms = KmsClient::with_transport(
            providers,
            RetryPolicy::disabled(),
            Arc::new(crate::crypt::kms::test::MockTransport::default()),
        );
        let key = DataKey::create(&kms, &MasterKey::local(), Vec::new(), None)
            .await
            .unwrap();
        let material = key.unwrap(&kms).await.unwrap();

        let target = MasterKey::Local {
            name: Some("second".to_string()),
        };
        let set = key.rewrap(&kms, Some(&target)).await.unwrap();
        assert_eq!(
            set.get_document("masterKey").unwrap(),
            &doc! { "provider": "local:second" }
        );

        let rewrapped = DataKey {
            key_material: set.get("keyMaterial").and_then(|b| match b {
                bson::Bson::Binary(b) => Some(b.clone()),
                _ => None,
            })
            .unwrap(),
            master_key: set.get_document("masterKey").unwrap().clone(),
            ..key
        };
        assert_eq!(rewrapped.unwrap(&kms).await.unwrap(), material);
    }
}
