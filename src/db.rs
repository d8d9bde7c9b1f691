use std::{fmt::Debug, sync::Arc};

use crate::{
    bson::{doc, Document},
    client::csfle::aux_collections,
    concern::{ReadConcern, WriteConcern},
    cursor::Cursor,
    error::{ErrorKind, Result},
    operation::{Create, ListCollections, RunCommand},
    options::{ClusteredIndex, CreateCollectionOptions},
    results::CollectionSpecification,
    selection_criteria::SelectionCriteria,
    Client,
    Collection,
    IndexModel,
    Namespace,
};

/// Queryable encryption needs MongoDB 7.0 (wire version 21) or newer.
const QUERYABLE_ENCRYPTION_MIN_WIRE_VERSION: i32 = 21;

/// `Database` is the client-side abstraction of a MongoDB database. It can be used to perform
/// database-level operations or to obtain handles to specific collections within the database. A
/// `Database` can only be obtained through a [`Client`] by calling [`Client::database`].
///
/// `Database` uses [`std::sync::Arc`] internally, so it can safely be shared across threads or
/// async tasks. For example:
///
/// ```rust
/// # use mongodb_csfle::{bson::Document, Client, error::Result};
/// # async fn start_workers(client: Client) -> Result<()> {
/// let db = client.database("items");
///
/// for i in 0..5 {
///     let db_ref = db.clone();
///
///     tokio::task::spawn(async move {
///         let collection = db_ref.collection::<Document>(&format!("coll{}", i));
///
///         // Do something with the collection
///     });
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

#[derive(Debug)]
struct DatabaseInner {
    client: Client,
    name: String,
    selection_criteria: Option<SelectionCriteria>,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                selection_criteria: client.selection_criteria().cloned(),
                read_concern: client.read_concern().cloned(),
                write_concern: client.write_concern().cloned(),
                client,
                name: name.to_string(),
            }),
        }
    }

    /// Get the `Client` that this database descended from.
    pub(crate) fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Gets the name of the `Database`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Gets the read preference of the `Database`.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria.as_ref()
    }

    /// Gets the read concern of the `Database`.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    /// Gets the write concern of the `Database`.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    /// Gets a handle to a collection in this database with the provided name. The
    /// [`Collection`] options (e.g. read preference and write concern) will default to those of
    /// this [`Database`].
    ///
    /// This method does not send or receive anything across the wire to the database, so it can be
    /// used repeatedly without incurring any costs from I/O.
    pub fn collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        Collection::new(self.clone(), name)
    }

    /// Runs a database-level command.
    ///
    /// Note that no inspection is done on `doc`, so the command will not use the database's default
    /// read concern or write concern. If specific read concern or write concern is desired, it must
    /// be specified manually. With automatic encryption enabled the command is still subject to
    /// the same rewriting as collection helpers, so commands outside the supported set fail.
    pub async fn run_command(
        &self,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let operation = RunCommand::new(
            self.name().to_string(),
            command,
            selection_criteria.into(),
        )?;
        self.client().execute_operation(operation).await
    }

    /// Gets information about each of the collections in the database. The cursor will yield a
    /// [`CollectionSpecification`] for each collection matching `filter`.
    pub async fn list_collections(
        &self,
        filter: impl Into<Option<Document>>,
    ) -> Result<Cursor<CollectionSpecification>> {
        let list_collections =
            ListCollections::new(self.name().to_string(), filter.into(), false);
        let client = self.client();
        client
            .execute_operation(list_collections)
            .await
            .map(|spec| Cursor::new(client.clone(), spec))
    }

    /// Gets the names of the collections in the database.
    pub async fn list_collection_names(
        &self,
        filter: impl Into<Option<Document>>,
    ) -> Result<Vec<String>> {
        let list_collections =
            ListCollections::new(self.name().to_string(), filter.into(), true);
        let client = self.client();
        let spec = client.execute_operation(list_collections).await?;
        let mut cursor: Cursor<Document> = Cursor::new(client.clone(), spec);

        let mut names = Vec::new();
        while cursor.advance().await? {
            if let Some(name) = cursor.current().and_then(|c| c.get_str("name").ok()) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Creates a new collection in the database with the given `name` and `options`.
    ///
    /// Note that MongoDB creates collections implicitly when data is inserted, so this method is
    /// not needed if no special options are required.
    ///
    /// When the collection has queryable encryption fields, either in `options` or in the
    /// client's `encrypted_fields_map`, its state collections and the `__safeContent__` index are
    /// created as well.
    pub async fn create_collection(
        &self,
        name: impl AsRef<str>,
        options: impl Into<Option<CreateCollectionOptions>>,
    ) -> Result<()> {
        let mut options: Option<CreateCollectionOptions> = options.into();
        resolve_options!(self, options, [write_concern]);

        let ns = Namespace::new(self.name(), name.as_ref());
        self.resolve_encrypted_fields(&ns, &mut options).await;
        self.create_aux_collections(&ns, &options).await?;
        let has_encrypted_fields = options
            .as_ref()
            .is_some_and(|o| o.encrypted_fields.is_some());

        let create = Create::new(ns.clone(), options);
        self.client().execute_operation(create).await?;

        if has_encrypted_fields {
            self.collection::<Document>(&ns.coll)
                .create_index(
                    IndexModel::builder()
                        .keys(doc! { "__safeContent__": 1 })
                        .build(),
                )
                .await?;
        }

        Ok(())
    }

    async fn resolve_encrypted_fields(
        &self,
        base_ns: &Namespace,
        options: &mut Option<CreateCollectionOptions>,
    ) {
        let has_encrypted_fields = options
            .as_ref()
            .is_some_and(|o| o.encrypted_fields.is_some());
        if has_encrypted_fields {
            return;
        }
        if let Some(fields) = self.client().encrypted_fields_for(base_ns).await {
            options.get_or_insert_with(Default::default).encrypted_fields = Some(fields);
        }
    }

    async fn create_aux_collections(
        &self,
        base_ns: &Namespace,
        options: &Option<CreateCollectionOptions>,
    ) -> Result<()> {
        let Some(opts) = options else {
            return Ok(());
        };
        let Some(ref encrypted_fields) = opts.encrypted_fields else {
            return Ok(());
        };

        if let Some(max_wire_version) = self.client().primary_max_wire_version().await? {
            if max_wire_version < QUERYABLE_ENCRYPTION_MIN_WIRE_VERSION {
                return Err(ErrorKind::InvalidArgument {
                    message: "queryable encryption requires MongoDB 7.0 or newer".to_string(),
                }
                .into());
            }
        }

        for ns in aux_collections(base_ns, encrypted_fields)? {
            let sub_opts = CreateCollectionOptions::builder()
                .clustered_index(ClusteredIndex::default())
                .write_concern(opts.write_concern.clone())
                .build();
            let create = Create::new(ns, Some(sub_opts));
            self.client().execute_operation(create).await?;
        }
        Ok(())
    }
}
