pub(crate) mod auto_encrypt;
pub(crate) mod client_builder;
pub mod client_encryption;
mod mongocryptd;
pub mod options;

use std::{collections::HashMap, sync::Arc};

use derive_where::derive_where;

use crate::{
    bson::Document,
    crypt::{
        engine::Engine,
        key_broker::KeyBroker,
        key_vault::KeyVault,
        kms::KmsClient,
        schema::{EncryptedFields, JsonSchema, ResolvedSchema},
    },
    error::Result,
    Client,
    Namespace,
};

use self::{
    mongocryptd::Mongocryptd,
    options::{AutoEncryptionOptions, QueryAnalysis},
};

use super::WeakClient;

/// Marks the fields of outgoing commands that need encryption.
#[derive(Debug)]
pub(crate) enum Analyzer {
    Builtin,
    Mongocryptd(Mongocryptd),
}

/// Everything a client with automatic encryption enabled needs beyond a plain client.
#[derive_where(Debug)]
pub(crate) struct ClientState {
    opts: AutoEncryptionOptions,
    engine: Engine,
    metadata_client: Option<WeakClient>,
    // Keeps the client behind the weak handles above alive.
    #[derive_where(skip)]
    internal_client: Option<Client>,
    analyzer: Option<Analyzer>,
    local_schemas: HashMap<String, ResolvedSchema>,
    remote_schemas: std::sync::Mutex<HashMap<String, ResolvedSchema>>,
}

struct AuxClients {
    key_vault_client: WeakClient,
    metadata_client: Option<WeakClient>,
    internal_client: Option<Client>,
}

impl ClientState {
    pub(super) fn new(client: &Client, opts: AutoEncryptionOptions) -> Result<Self> {
        let aux_clients = Self::make_aux_clients(client, &opts)?;
        let kms = KmsClient::new(
            opts.kms_providers.clone(),
            opts.kms_retry.clone().unwrap_or_default(),
        )?;
        let vault = KeyVault::new(
            aux_clients.key_vault_client,
            opts.key_vault_namespace.clone(),
        );
        let engine = Engine::new(KeyBroker::new(vault, Arc::new(kms)));

        let analyzer = if !opts.analyzes_queries() {
            None
        } else {
            Some(match opts.query_analysis() {
                QueryAnalysis::Builtin => Analyzer::Builtin,
                QueryAnalysis::Mongocryptd => Analyzer::Mongocryptd(Mongocryptd::new(&opts)?),
            })
        };

        Ok(Self {
            local_schemas: Self::local_schemas(&opts)?,
            remote_schemas: Default::default(),
            engine,
            metadata_client: aux_clients.metadata_client,
            internal_client: aux_clients.internal_client,
            analyzer,
            opts,
        })
    }

    pub(crate) fn opts(&self) -> &AutoEncryptionOptions {
        &self.opts
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    fn local_schemas(opts: &AutoEncryptionOptions) -> Result<HashMap<String, ResolvedSchema>> {
        let mut out = HashMap::new();
        for (ns, schema) in opts.schema_map.iter().flatten() {
            let parsed = JsonSchema::parse(schema.clone(), false)?;
            out.insert(ns.clone(), ResolvedSchema::JsonSchema(Arc::new(parsed)));
        }
        for (ns, fields) in opts.encrypted_fields_map.iter().flatten() {
            let parsed = EncryptedFields::parse(fields.clone())?;
            out.insert(ns.clone(), ResolvedSchema::EncryptedFields(Arc::new(parsed)));
        }
        Ok(out)
    }

    /// Key vault queries and `listCollections` lookups go through the encrypted client itself
    /// when its pool is unbounded, and through a separate internal client otherwise so they
    /// cannot starve the pool they are serving.
    fn make_aux_clients(
        client: &Client,
        auto_enc_opts: &AutoEncryptionOptions,
    ) -> Result<AuxClients> {
        let mut internal_client: Option<Client> = None;
        let mut get_internal_client = || -> Result<WeakClient> {
            if let Some(c) = &internal_client {
                return Ok(c.weak());
            }
            let mut internal_opts = client.inner.options.clone();
            internal_opts.min_pool_size = Some(0);
            let c = Client::with_options(internal_opts)?;
            internal_client = Some(c.clone());
            Ok(c.weak())
        };

        let key_vault_client = if let Some(c) = &auto_enc_opts.key_vault_client {
            c.weak()
        } else if Some(0) == client.inner.options.max_pool_size {
            client.weak()
        } else {
            get_internal_client()?
        };
        let metadata_client = if Some(true) == auto_enc_opts.bypass_auto_encryption {
            None
        } else if Some(0) == client.inner.options.max_pool_size {
            Some(client.weak())
        } else {
            Some(get_internal_client()?)
        };

        Ok(AuxClients {
            key_vault_client,
            metadata_client,
            internal_client,
        })
    }

    /// Kills a spawned `mongocryptd` and shuts down the clients this state owns.
    pub(crate) async fn shutdown(&self) {
        if let Some(Analyzer::Mongocryptd(mongocryptd)) = &self.analyzer {
            mongocryptd.shutdown().await;
        }
        if let Some(internal) = self.internal_client.clone() {
            internal.shutdown_unencrypted().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn mongocryptd_spawned(&self) -> bool {
        match &self.analyzer {
            Some(Analyzer::Mongocryptd(mongocryptd)) => mongocryptd.spawned().await,
            _ => false,
        }
    }
}

/// The state collections of a queryable encryption collection, named by `escCollection` and
/// `ecocCollection` or derived from the base collection's name.
pub(crate) fn aux_collections(
    base_ns: &Namespace,
    enc_fields: &Document,
) -> Result<Vec<Namespace>> {
    let mut out = vec![];
    for &key in &["esc", "ecoc"] {
        let coll = match enc_fields.get_str(format!("{key}Collection")) {
            Ok(s) => s.to_string(),
            Err(_) => format!("enxcol_.{}.{}", base_ns.coll, key),
        };
        out.push(Namespace {
            coll,
            ..base_ns.clone()
        });
    }
    Ok(out)
}
