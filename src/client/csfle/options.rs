use std::collections::HashMap;

use serde::Deserialize;

use crate::{
    bson::{Array, Bson, Document},
    client::options::TlsOptions,
    crypt::kms::{KmsProvider, RetryPolicy},
    error::{Error, Result},
    Namespace,
};

/// Options related to automatic encryption.
///
/// Automatic encryption only applies to operations on a collection. Commands outside the
/// supported set fail unless they are always bypassed (see
/// [`crate::client_encryption`]). To disable encryption of outgoing commands while keeping
/// automatic decryption of replies, set `bypass_auto_encryption`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct AutoEncryptionOptions {
    /// Used for data key queries. Defaults to the encrypted client itself, or to an internal
    /// client when the encrypted client has a bounded pool.
    #[serde(skip)]
    pub(crate) key_vault_client: Option<crate::Client>,
    /// The collection holding data keys.
    #[serde(default = "default_key_vault_namespace")]
    pub(crate) key_vault_namespace: Namespace,
    /// Options individual to each KMS provider.
    pub(crate) kms_providers: KmsProviders,
    /// Local JSON schemas by namespace. Local schemas take precedence over the ones advertised by
    /// the server, which protects against a malicious server advertising a false schema.
    pub(crate) schema_map: Option<HashMap<String, Document>>,
    /// Skip encryption of outgoing commands; replies are still decrypted.
    pub(crate) bypass_auto_encryption: Option<bool>,
    /// Options related to mongocryptd.
    pub(crate) extra_options: Option<Document>,
    /// Local `encryptedFields` by namespace.
    pub(crate) encrypted_fields_map: Option<HashMap<String, Document>>,
    /// Skip query analysis. Outgoing commands are sent as-is, but explicitly encrypted indexed
    /// payloads are still accompanied by the collection's `encryptionInformation`.
    pub(crate) bypass_query_analysis: Option<bool>,
    /// Which analyzer marks fields for encryption. Defaults to [`QueryAnalysis::Builtin`].
    pub(crate) query_analysis: Option<QueryAnalysis>,
    /// How failed KMS requests are retried.
    #[serde(skip)]
    pub(crate) kms_retry: Option<RetryPolicy>,
}

/// Where outgoing commands are analyzed for fields that need encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum QueryAnalysis {
    /// In process, from the resolved schema.
    Builtin,
    /// By a `mongocryptd` process, spawned on demand unless `mongocryptdBypassSpawn` is set.
    Mongocryptd,
}

fn default_key_vault_namespace() -> Namespace {
    Namespace::new("keyvault", "datakeys")
}

impl AutoEncryptionOptions {
    pub(crate) fn new(key_vault_namespace: Namespace, kms_providers: KmsProviders) -> Self {
        Self {
            key_vault_namespace,
            kms_providers,
            key_vault_client: None,
            schema_map: None,
            bypass_auto_encryption: None,
            extra_options: None,
            encrypted_fields_map: None,
            bypass_query_analysis: None,
            query_analysis: None,
            kms_retry: None,
        }
    }

    pub(crate) fn query_analysis(&self) -> QueryAnalysis {
        self.query_analysis.unwrap_or(QueryAnalysis::Builtin)
    }

    /// Whether outgoing commands are analyzed at all.
    pub(crate) fn analyzes_queries(&self) -> bool {
        self.bypass_auto_encryption != Some(true) && self.bypass_query_analysis != Some(true)
    }

    pub(crate) fn extra_option<'a, Opt: ExtraOption<'a>>(
        &'a self,
        opt: &Opt,
    ) -> Result<Option<Opt::Output>> {
        let key = opt.key();
        match self.extra_options.as_ref().and_then(|o| o.get(key)) {
            None => Ok(None),
            Some(b) => match Opt::as_type(b) {
                Some(v) => Ok(Some(v)),
                None => Err(Error::invalid_argument(format!(
                    "unexpected type for extra option {key:?}: {b:?}"
                ))),
            },
        }
    }

    /// Rejects unknown extra options and options of the wrong type before any I/O.
    pub(crate) fn validate(&self) -> Result<()> {
        const KNOWN: [&str; 6] = [
            EO_MONGOCRYPTD_URI.0,
            EO_MONGOCRYPTD_BYPASS_SPAWN.0,
            EO_MONGOCRYPTD_SPAWN_PATH.0,
            EO_MONGOCRYPTD_SPAWN_ARGS.0,
            EO_CRYPT_SHARED_LIB_PATH.0,
            EO_CRYPT_SHARED_REQUIRED.0,
        ];
        if let Some(extra) = &self.extra_options {
            if let Some(unknown) = extra.keys().find(|k| !KNOWN.contains(&k.as_str())) {
                return Err(Error::invalid_argument(format!(
                    "unknown extra option {unknown:?}"
                )));
            }
        }
        self.extra_option(&EO_MONGOCRYPTD_URI)?;
        self.extra_option(&EO_MONGOCRYPTD_BYPASS_SPAWN)?;
        self.extra_option(&EO_MONGOCRYPTD_SPAWN_PATH)?;
        self.extra_option(&EO_CRYPT_SHARED_LIB_PATH)?;
        self.extra_option(&EO_CRYPT_SHARED_REQUIRED)?;
        if let Some(args) = self.extra_option(&EO_MONGOCRYPTD_SPAWN_ARGS)? {
            if args.iter().any(|a| a.as_str().is_none()) {
                return Err(Error::invalid_argument(
                    "mongocryptdSpawnArgs must be an array of strings",
                ));
            }
        }
        for (ns, _) in self
            .schema_map
            .iter()
            .flatten()
            .chain(self.encrypted_fields_map.iter().flatten())
        {
            ns.parse::<Namespace>()?;
        }
        if let (Some(schemas), Some(fields)) = (&self.schema_map, &self.encrypted_fields_map) {
            if let Some(ns) = schemas.keys().find(|ns| fields.contains_key(*ns)) {
                return Err(Error::invalid_argument(format!(
                    "{ns} has both a schema_map entry and an encrypted_fields_map entry"
                )));
            }
        }
        Ok(())
    }
}

/// Credentials and TLS settings for each configured KMS provider.
#[derive(Deserialize, Debug, Clone)]
pub(crate) struct KmsProviders {
    #[serde(flatten)]
    credentials: HashMap<KmsProvider, Document>,
    #[serde(skip)]
    tls_options: Option<KmsProvidersTlsOptions>,
}

pub(crate) type KmsProvidersTlsOptions = HashMap<KmsProvider, TlsOptions>;

impl KmsProviders {
    pub(crate) fn new(
        providers: impl IntoIterator<Item = (KmsProvider, Document, Option<TlsOptions>)>,
    ) -> Result<Self> {
        let mut credentials = HashMap::new();
        let mut tls_options = None;
        for (provider, conf, tls) in providers {
            credentials.insert(provider.clone(), conf);
            if let Some(tls) = tls {
                tls_options
                    .get_or_insert_with(KmsProvidersTlsOptions::new)
                    .insert(provider, tls);
            }
        }
        if credentials.is_empty() {
            return Err(Error::invalid_argument("empty kms_providers"));
        }
        Ok(Self {
            credentials,
            tls_options,
        })
    }

    pub(crate) fn tls_options(&self) -> Option<&KmsProvidersTlsOptions> {
        self.tls_options.as_ref()
    }

    pub(crate) fn credentials(&self) -> &HashMap<KmsProvider, Document> {
        &self.credentials
    }
}

pub(crate) trait ExtraOption<'a> {
    type Output;
    fn key(&self) -> &'static str;
    fn as_type(input: &'a Bson) -> Option<Self::Output>;
}

pub(crate) struct ExtraOptionStr(&'static str);

impl<'a> ExtraOption<'a> for ExtraOptionStr {
    type Output = &'a str;
    fn key(&self) -> &'static str {
        self.0
    }
    fn as_type(input: &'a Bson) -> Option<&'a str> {
        input.as_str()
    }
}

pub(crate) struct ExtraOptionBool(&'static str);

impl<'a> ExtraOption<'a> for ExtraOptionBool {
    type Output = bool;
    fn key(&self) -> &'static str {
        self.0
    }
    fn as_type(input: &'a Bson) -> Option<bool> {
        input.as_bool()
    }
}

pub(crate) struct ExtraOptionArray(&'static str);

impl<'a> ExtraOption<'a> for ExtraOptionArray {
    type Output = &'a Array;
    fn key(&self) -> &'static str {
        self.0
    }
    fn as_type(input: &'a Bson) -> Option<&'a Array> {
        input.as_array()
    }
}

pub(crate) const EO_MONGOCRYPTD_URI: ExtraOptionStr = ExtraOptionStr("mongocryptdURI");
pub(crate) const EO_MONGOCRYPTD_BYPASS_SPAWN: ExtraOptionBool =
    ExtraOptionBool("mongocryptdBypassSpawn");
pub(crate) const EO_MONGOCRYPTD_SPAWN_PATH: ExtraOptionStr = ExtraOptionStr("mongocryptdSpawnPath");
pub(crate) const EO_MONGOCRYPTD_SPAWN_ARGS: ExtraOptionArray =
    ExtraOptionArray("mongocryptdSpawnArgs");
pub(crate) const EO_CRYPT_SHARED_LIB_PATH: ExtraOptionStr = ExtraOptionStr("cryptSharedLibPath");
pub(crate) const EO_CRYPT_SHARED_REQUIRED: ExtraOptionBool = ExtraOptionBool("cryptSharedRequired");

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::{doc, from_document};

    fn local_providers() -> KmsProviders {
        KmsProviders::new([(KmsProvider::local(), doc! {}, None)]).unwrap()
    }

    #[test]
    fn deserializes_camel_case_options() {
        let options: AutoEncryptionOptions = from_document(doc! {
            "keyVaultNamespace": "kv.keys",
            "kmsProviders": { "local": { "key": "AAAA" }, "aws:prod": {} },
            "bypassQueryAnalysis": true,
            "queryAnalysis": "mongocryptd",
            "extraOptions": { "mongocryptdBypassSpawn": true },
        })
        .unwrap();
        assert_eq!(options.key_vault_namespace, Namespace::new("kv", "keys"));
        assert!(options
            .kms_providers
            .credentials()
            .contains_key(&KmsProvider::aws().with_name("prod")));
        assert_eq!(options.query_analysis(), QueryAnalysis::Mongocryptd);
        assert!(!options.analyzes_queries());
        assert_eq!(
            options.extra_option(&EO_MONGOCRYPTD_BYPASS_SPAWN).unwrap(),
            Some(true)
        );
        options.validate().unwrap();
    }

    #[test]
    fn rejects_bad_extra_options() {
        let mut options =
            AutoEncryptionOptions::new(Namespace::new("kv", "keys"), local_providers());
        options.extra_options = Some(doc! { "mongocryptdURI": 5 });
        assert!(options.validate().is_err());

        options.extra_options = Some(doc! { "mongocryptdSpawnArgs": ["--port", 1] });
        assert!(options.validate().is_err());

        options.extra_options = Some(doc! { "notAnOption": true });
        assert!(options.validate().is_err());
    }

    #[test]
    fn rejects_namespace_in_both_maps() {
        let mut options =
            AutoEncryptionOptions::new(Namespace::new("kv", "keys"), local_providers());
        options.schema_map = Some([("db.coll".to_string(), doc! {})].into());
        options.encrypted_fields_map =
            Some([("db.coll".to_string(), doc! { "fields": [] })].into());
        assert!(options.validate().is_err());
    }

    #[test]
    fn empty_providers_are_rejected() {
        assert!(KmsProviders::new(Vec::new()).is_err());
    }
}
