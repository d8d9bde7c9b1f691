use std::collections::HashMap;

use super::options::{AutoEncryptionOptions, QueryAnalysis};
use crate::{
    bson::Document,
    crypt::kms::RetryPolicy,
    error::Result,
    options::ClientOptions,
    Client,
};

/// A builder for a `Client` with automatic encryption enabled, created by
/// [`Client::encrypted_builder`].
///
/// ```no_run
/// # use mongodb_csfle::{bson::doc, client_encryption::{KmsProvider, QueryAnalysis}, Client, Namespace, options::ClientOptions, error::Result};
/// # async fn func(key_vault_client: Client, local_key: mongodb_csfle::bson::Binary) -> Result<()> {
/// let encrypted_client = Client::encrypted_builder(
///     ClientOptions::parse("mongodb://localhost:27017")?,
///     Namespace::new("keyvault", "datakeys"),
///     [(KmsProvider::local(), doc! { "key": local_key }, None)],
/// )?
/// .key_vault_client(key_vault_client)
/// .query_analysis(QueryAnalysis::Mongocryptd)
/// .build()
/// .await?;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct EncryptedClientBuilder {
    client_options: ClientOptions,
    options: AutoEncryptionOptions,
}

impl EncryptedClientBuilder {
    pub(crate) fn new(client_options: ClientOptions, options: AutoEncryptionOptions) -> Self {
        Self {
            client_options,
            options,
        }
    }

    /// Set the client used for data key queries.
    pub fn key_vault_client(mut self, client: impl Into<Option<Client>>) -> Self {
        self.options.key_vault_client = client.into();
        self
    }

    /// Specify JSON schemas locally, keyed by namespace.
    ///
    /// Supplying a `schema_map` provides more security than relying on JSON schemas obtained from
    /// the server. It protects against a malicious server advertising a false JSON schema, which
    /// could trick the client into sending unencrypted data that should be encrypted.
    pub fn schema_map(mut self, map: impl IntoIterator<Item = (String, Document)>) -> Self {
        self.options.schema_map = Some(map.into_iter().collect());
        self
    }

    /// Disable automatic encryption of outgoing commands and do not spawn mongocryptd. Replies
    /// are still decrypted. Defaults to false.
    pub fn bypass_auto_encryption(mut self, bypass: impl Into<Option<bool>>) -> Self {
        self.options.bypass_auto_encryption = bypass.into();
        self
    }

    /// Set options related to mongocryptd.
    pub fn extra_options(mut self, extra_opts: impl Into<Option<Document>>) -> Self {
        self.options.extra_options = extra_opts.into();
        self
    }

    /// Maps namespace to encrypted fields.
    pub fn encrypted_fields_map(
        mut self,
        map: impl IntoIterator<Item = (String, Document)>,
    ) -> Self {
        self.options.encrypted_fields_map = Some(map.into_iter().collect::<HashMap<_, _>>());
        self
    }

    /// Disable query analysis of encrypted indexed fields, allowing use of explicit encryption
    /// with queryable encryption.
    pub fn bypass_query_analysis(mut self, bypass: impl Into<Option<bool>>) -> Self {
        self.options.bypass_query_analysis = bypass.into();
        self
    }

    /// Choose where outgoing commands are analyzed.
    pub fn query_analysis(mut self, analysis: QueryAnalysis) -> Self {
        self.options.query_analysis = Some(analysis);
        self
    }

    /// Set how failed KMS requests are retried.
    pub fn kms_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.options.kms_retry = Some(policy);
        self
    }

    /// Constructs the `Client`. Nothing is spawned or contacted until the first operation.
    pub async fn build(self) -> Result<Client> {
        self.options.validate()?;
        let client = Client::with_options(self.client_options)?;
        let state = super::ClientState::new(&client, self.options)?;
        *client.inner.csfle.write().await = Some(std::sync::Arc::new(state));
        Ok(client)
    }
}
