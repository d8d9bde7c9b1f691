pub(crate) mod csfle;
mod executor;
pub mod options;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
    Weak,
};

use derive_where::derive_where;

pub use self::csfle::client_builder::EncryptedClientBuilder;
use crate::{
    bson::Document,
    concern::{ReadConcern, WriteConcern},
    crypt::kms::KmsProvider,
    db::Database,
    error::{ErrorKind, Result},
    hello::DEFAULT_MAX_BSON_OBJECT_SIZE,
    options::{ClientOptions, ReadPreference, SelectionCriteria, TlsOptions},
    sdam::Topology,
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
    Namespace,
};

/// This is the main entry point for the API. A `Client` is used to connect to a MongoDB cluster.
/// By default, it will monitor the topology of the cluster, keeping track of any changes, such
/// as servers being added or removed.
///
/// `Client` uses [`std::sync::Arc`] internally, so it can safely be shared across threads or
/// async tasks:
///
/// ```no_run
/// # use mongodb_csfle::{bson::doc, options::ClientOptions, Client, error::Result};
/// # async fn run() -> Result<()> {
/// let client = Client::with_options(ClientOptions::parse("mongodb://localhost:27017")?)?;
///
/// for i in 0..5 {
///     let client_ref = client.clone();
///     tokio::spawn(async move {
///         let collection = client_ref.database("items").collection(&format!("coll{i}"));
///         let _ = collection.insert_one(doc! { "x": i }, None).await;
///     });
/// }
/// # Ok(())
/// # }
/// ```
///
/// A client built with [`Client::encrypted_builder`] transparently encrypts outgoing commands
/// and decrypts replies. Call [`Client::shutdown`] to close its pools, stop its monitors and tear
/// down any `mongocryptd` process it spawned; every operation started afterwards fails.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive_where(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
    #[derive_where(skip)]
    csfle: tokio::sync::RwLock<Option<Arc<csfle::ClientState>>>,
    shutdown: AtomicBool,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `options`.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let inner = Arc::new(ClientInner {
            topology: Topology::new(options.clone())?,
            csfle: Default::default(),
            shutdown: AtomicBool::new(false),
            options,
        });
        Ok(Self { inner })
    }

    /// Creates a builder for a `Client` with automatic encryption enabled.
    ///
    /// ```no_run
    /// # use mongodb_csfle::{bson::{doc, spec::BinarySubtype, Binary}, client_encryption::KmsProvider, Client, Namespace, options::ClientOptions, error::Result};
    /// # async fn run(local_key: Vec<u8>) -> Result<()> {
    /// let client = Client::encrypted_builder(
    ///     ClientOptions::parse("mongodb://localhost:27017")?,
    ///     Namespace::new("keyvault", "datakeys"),
    ///     [(
    ///         KmsProvider::local(),
    ///         doc! { "key": Binary { subtype: BinarySubtype::Generic, bytes: local_key } },
    ///         None,
    ///     )],
    /// )?
    /// .build()
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn encrypted_builder(
        client_options: ClientOptions,
        key_vault_namespace: Namespace,
        kms_providers: impl IntoIterator<Item = (KmsProvider, Document, Option<TlsOptions>)>,
    ) -> Result<EncryptedClientBuilder> {
        Ok(EncryptedClientBuilder::new(
            client_options,
            csfle::options::AutoEncryptionOptions::new(
                key_vault_namespace,
                csfle::options::KmsProviders::new(kms_providers)?,
            ),
        ))
    }

    /// Gets a handle to the database specified by `name`. The database inherits the read and
    /// write settings of the client.
    ///
    /// This method does not send or receive anything across the wire.
    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name)
    }

    /// Gets the default selection criteria the `Client` uses for operations.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.options.selection_criteria.as_ref()
    }

    /// Gets the default read preference the `Client` uses for operations, if it was specified
    /// as a read preference rather than a predicate.
    pub fn read_preference(&self) -> Option<&ReadPreference> {
        self.selection_criteria()
            .and_then(SelectionCriteria::as_read_pref)
    }

    /// Gets the default read concern the `Client` uses for operations.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.options.read_concern.as_ref()
    }

    /// Gets the default write concern the `Client` uses for operations.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.options.write_concern.as_ref()
    }

    /// Shut down this `Client`, terminating background tasks, closing connection pools and
    /// killing any `mongocryptd` process spawned for automatic encryption.
    ///
    /// Operations started on any clone of this client after `shutdown` returns fail with
    /// [`ErrorKind::Shutdown`](crate::error::ErrorKind::Shutdown).
    pub async fn shutdown(self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target: TOPOLOGY_TRACING_EVENT_TARGET, "Client shutting down");

        let state = self.inner.csfle.write().await.take();
        if let Some(state) = state {
            state.shutdown().await;
        }
        self.inner.topology.shutdown().await;
    }

    /// Shuts down a client built without automatic encryption, such as the internal clients an
    /// encryption state owns.
    pub(crate) async fn shutdown_unencrypted(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.topology.shutdown().await;
    }

    pub(crate) fn weak(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The automatic encryption state, released from the lock so that nested operations on this
    /// client do not contend with it.
    pub(crate) async fn csfle_state(&self) -> Option<Arc<csfle::ClientState>> {
        self.inner.csfle.read().await.clone()
    }

    /// Whether outgoing commands are rewritten by automatic encryption.
    pub(crate) async fn should_auto_encrypt(&self) -> bool {
        self.csfle_state()
            .await
            .is_some_and(|state| state.opts().bypass_auto_encryption != Some(true))
    }

    /// The locally configured `encryptedFields` for `ns`, if any.
    pub(crate) async fn encrypted_fields_for(&self, ns: &Namespace) -> Option<Document> {
        self.csfle_state()
            .await?
            .opts()
            .encrypted_fields_map
            .as_ref()?
            .get(&ns.to_string())
            .cloned()
    }

    pub(crate) async fn primary_max_wire_version(&self) -> Result<Option<i32>> {
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let server = self.inner.topology.select_server(&criteria).await?;
        Ok(server.description().max_wire_version().ok().flatten())
    }

    /// The largest document the primary accepts, as of its last `hello` reply.
    pub(crate) async fn primary_max_bson_object_size(&self) -> Result<usize> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(ErrorKind::Shutdown.into());
        }
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let server = self.inner.topology.select_server(&criteria).await?;
        let max = server
            .description()
            .max_bson_object_size()
            .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE);
        Ok(usize::try_from(max).unwrap_or(usize::MAX))
    }

    #[cfg(test)]
    pub(crate) async fn mongocryptd_spawned(&self) -> bool {
        match self.csfle_state().await {
            Some(state) => state.mongocryptd_spawned().await,
            None => false,
        }
    }
}

/// A handle to a client that does not keep it alive. Used by the encryption state a client owns
/// to reach that same client without a reference cycle.
#[derive(Clone, Debug)]
pub(crate) struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    pub(crate) fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}
