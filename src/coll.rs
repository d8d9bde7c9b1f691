pub mod options;

use std::{borrow::Borrow, collections::HashSet, fmt, fmt::Debug, str::FromStr, sync::Arc};

use serde::{de::DeserializeOwned, de::Error as DeError, Deserialize, Deserializer, Serialize};

use self::options::*;
use crate::{
    bson::{self, Bson, Document},
    client::csfle::aux_collections,
    concern::{ReadConcern, WriteConcern},
    error::{
        convert_insert_many_error,
        BulkWriteFailure,
        Error,
        ErrorKind,
        IndexedWriteError,
        InsertManyError,
        Result,
    },
    operation::{
        Aggregate,
        BulkWrite,
        Count,
        CountDocuments,
        CreateIndexes,
        Delete,
        Distinct,
        DropCollection,
        Find,
        FindAndModify,
        Insert,
        Update,
        UpdateOrReplace,
    },
    results::{
        BulkWriteResult,
        CreateIndexResult,
        DeleteResult,
        InsertManyResult,
        InsertOneResult,
        UpdateResult,
    },
    selection_criteria::SelectionCriteria,
    Client,
    Cursor,
    Database,
};

/// `Collection` is the client-side abstraction of a MongoDB Collection. It can be used to
/// perform collection-level operations such as CRUD operations. A `Collection` can be obtained
/// through a [`Database`] by calling [`Database::collection`].
///
/// A [`Collection`] can be parameterized with any type that implements the `Serialize` and
/// `Deserialize` traits from the [`serde`](https://serde.rs/) crate. The various methods that
/// accept or return instances of the documents in the collection will accept/return instances of
/// the generic parameter (e.g. [`Collection::insert_one`] accepts it as an argument,
/// [`Collection::find_one`] returns an `Option` of it).
///
/// When the owning [`Client`] was built with automatic encryption, every command issued through
/// a `Collection` is rewritten before it reaches the wire and every reply is decrypted before it
/// is deserialized, so the generic parameter always models the plaintext shape of the documents.
///
/// `Collection` uses [`std::sync::Arc`] internally, so it can safely be shared across threads or
/// async tasks.
///
/// # Example
/// ```rust
/// # use mongodb_csfle::{bson::doc, error::Result, Client};
/// # async fn run(client: Client) -> Result<()> {
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, Deserialize, Serialize)]
/// struct Patient {
///     name: String,
///     ssn: String,
/// }
///
/// let coll = client.database("medical").collection::<Patient>("patients");
/// coll.insert_one(
///     Patient {
///         name: "Jon Doe".to_string(),
///         ssn: "123-45-6789".to_string(),
///     },
///     None,
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Collection<T>
where
    T: Send + Sync,
{
    inner: Arc<CollectionInner>,
    _phantom: std::marker::PhantomData<fn() -> T>,
}

// Because derive is too conservative, derive only implements Clone if T is Clone.
// Collection<T> does not actually store any value of type T (so T does not need to be clone).
impl<T> Clone for Collection<T>
where
    T: Send + Sync,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _phantom: Default::default(),
        }
    }
}

#[derive(Debug)]
struct CollectionInner {
    client: Client,
    db: Database,
    name: String,
    selection_criteria: Option<SelectionCriteria>,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
}

impl<T> Collection<T>
where
    T: Send + Sync,
{
    pub(crate) fn new(db: Database, name: &str) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                client: db.client().clone(),
                selection_criteria: db.selection_criteria().cloned(),
                read_concern: db.read_concern().cloned(),
                write_concern: db.write_concern().cloned(),
                db,
                name: name.to_string(),
            }),
            _phantom: Default::default(),
        }
    }

    /// Gets a clone of the `Collection` with a different type `U`.
    pub fn clone_with_type<U: Send + Sync>(&self) -> Collection<U> {
        Collection {
            inner: self.inner.clone(),
            _phantom: Default::default(),
        }
    }

    /// Get the `Client` that this collection descended from.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Gets the name of the `Collection`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Gets the namespace of the `Collection`.
    ///
    /// The namespace of a MongoDB collection is the concatenation of the name of the database
    /// containing it, the '.' character, and the name of the collection itself. For example, if a
    /// collection named "bar" is created in a database named "foo", the namespace of the collection
    /// is "foo.bar".
    pub fn namespace(&self) -> Namespace {
        Namespace {
            db: self.inner.db.name().into(),
            coll: self.name().into(),
        }
    }

    /// Gets the selection criteria of the `Collection`.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria.as_ref()
    }

    /// Gets the read concern of the `Collection`.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    /// Gets the write concern of the `Collection`.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    /// Drops the collection, deleting all data and indexes stored in it.
    ///
    /// If the collection has queryable encryption fields configured, either through `options`
    /// or the client's `encrypted_fields_map`, the associated state collections are dropped too.
    pub async fn drop(&self, options: impl Into<Option<DropCollectionOptions>>) -> Result<()> {
        let mut options = options.into();
        resolve_options!(self, options, [write_concern]);
        let write_concern = options.as_ref().and_then(|o| o.write_concern.clone());

        let ns = self.namespace();
        let encrypted_fields = match options.and_then(|o| o.encrypted_fields) {
            Some(fields) => Some(fields),
            None => self.client().encrypted_fields_for(&ns).await,
        };

        if let Some(ref encrypted_fields) = encrypted_fields {
            for aux_ns in aux_collections(&ns, encrypted_fields)? {
                let drop = DropCollection::new(aux_ns, write_concern.clone());
                self.client().execute_operation(drop).await?;
            }
        }

        let drop = DropCollection::new(ns, write_concern);
        self.client().execute_operation(drop).await
    }

    /// Runs an aggregation operation.
    ///
    /// See the documentation [here](https://www.mongodb.com/docs/manual/aggregation/) for more
    /// information on aggregations.
    pub async fn aggregate(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<AggregateOptions>>,
    ) -> Result<Cursor<Document>> {
        let mut options = options.into();
        resolve_options!(
            self,
            options,
            [read_concern, write_concern, selection_criteria]
        );

        let aggregate = Aggregate::new(self.namespace(), pipeline, options);
        let client = self.client();
        client
            .execute_operation(aggregate)
            .await
            .map(|spec| Cursor::new(client.clone(), spec))
    }

    /// Estimates the number of documents in the collection using collection metadata.
    pub async fn estimated_document_count(
        &self,
        options: impl Into<Option<EstimatedDocumentCountOptions>>,
    ) -> Result<u64> {
        let mut options = options.into();
        resolve_options!(self, options, [read_concern, selection_criteria]);

        let op = Count::new(self.namespace(), options);
        self.client().execute_operation(op).await
    }

    /// Gets the number of documents matching `filter`.
    ///
    /// Note that using [`Collection::estimated_document_count`] is recommended instead of this
    /// method is most cases.
    pub async fn count_documents(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<CountOptions>>,
    ) -> Result<u64> {
        let mut options = options.into();
        resolve_options!(self, options, [read_concern, selection_criteria]);

        let op = CountDocuments::new(self.namespace(), filter.into().unwrap_or_default(), options)?;
        self.client().execute_operation(op).await
    }

    /// Finds the distinct values of the field specified by `field_name` across the collection.
    pub async fn distinct(
        &self,
        field_name: impl AsRef<str>,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<DistinctOptions>>,
    ) -> Result<Vec<Bson>> {
        let mut options = options.into();
        resolve_options!(self, options, [read_concern, selection_criteria]);

        let op = Distinct::new(
            self.namespace(),
            field_name.as_ref().to_string(),
            filter.into().unwrap_or_default(),
            options,
        );
        self.client().execute_operation(op).await
    }

    /// Creates the given index on this collection.
    pub async fn create_index(&self, index: IndexModel) -> Result<CreateIndexResult> {
        let op = CreateIndexes::new(self.namespace(), vec![index], self.write_concern().cloned());
        self.client()
            .execute_operation(op)
            .await
            .map(|result| result.into_create_index_result())
    }

    /// Deletes up to one document found matching `query`.
    ///
    /// This operation will retry once upon failure if the connection and encountered error support
    /// retryability. See the documentation
    /// [here](https://www.mongodb.com/docs/manual/core/retryable-writes/) for more information on
    /// retryable writes.
    pub async fn delete_one(
        &self,
        query: Document,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<DeleteResult> {
        let mut options = options.into();
        resolve_options!(self, options, [write_concern]);

        let delete = Delete::new(self.namespace(), query, Some(1), options);
        self.client().execute_operation(delete).await
    }

    /// Deletes all documents stored in the collection matching `query`.
    pub async fn delete_many(
        &self,
        query: Document,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<DeleteResult> {
        let mut options = options.into();
        resolve_options!(self, options, [write_concern]);

        let delete = Delete::new(self.namespace(), query, None, options);
        self.client().execute_operation(delete).await
    }

    /// Updates all documents matching `query` in the collection.
    ///
    /// Both `Document` and `Vec<Document>` implement `Into<UpdateModifications>`, so either can be
    /// passed in place of constructing the enum case. Note: pipeline updates are only supported
    /// in MongoDB 4.2+.
    pub async fn update_many(
        &self,
        query: Document,
        update: impl Into<UpdateModifications>,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        self.update_common(query, update.into().into(), true, options.into())
            .await
    }

    /// Updates up to one document matching `query` in the collection.
    ///
    /// This operation will retry once upon failure if the connection and encountered error support
    /// retryability.
    pub async fn update_one(
        &self,
        query: Document,
        update: impl Into<UpdateModifications>,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        self.update_common(query, update.into().into(), false, options.into())
            .await
    }

    async fn update_common(
        &self,
        query: Document,
        update: UpdateOrReplace,
        multi: bool,
        mut options: Option<UpdateOptions>,
    ) -> Result<UpdateResult> {
        resolve_options!(self, options, [write_concern]);

        let update = Update::new(self.namespace(), query, update, multi, options);
        self.client().execute_operation(update).await
    }

    async fn find_and_modify_common(&self, op: FindAndModify) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.client().execute_operation(op).await? {
            Some(document) => Ok(Some(bson::from_document(document)?)),
            None => Ok(None),
        }
    }

    /// Atomically finds up to one document in the collection matching `filter` and deletes it.
    ///
    /// This operation will retry once upon failure if the connection and encountered error support
    /// retryability.
    pub async fn find_one_and_delete(
        &self,
        filter: Document,
        options: impl Into<Option<FindOneAndDeleteOptions>>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let mut options = options.into();
        resolve_options!(self, options, [write_concern]);

        let op = FindAndModify::with_delete(self.namespace(), filter, options);
        self.find_and_modify_common(op).await
    }

    /// Atomically finds up to one document in the collection matching `filter` and updates it.
    /// Both `Document` and `Vec<Document>` implement `Into<UpdateModifications>`, so either can be
    /// passed in place of constructing the enum case.
    ///
    /// This operation will retry once upon failure if the connection and encountered error support
    /// retryability.
    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        options: impl Into<Option<FindOneAndUpdateOptions>>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let mut options = options.into();
        resolve_options!(self, options, [write_concern]);

        let op = FindAndModify::with_update(
            self.namespace(),
            filter,
            UpdateOrReplace::UpdateModifications(update.into()),
            options,
        );
        self.find_and_modify_common(op).await
    }

    /// Finds the documents in the collection matching `filter`.
    pub async fn find(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Cursor<T>> {
        let mut options = options.into();
        resolve_options!(self, options, [read_concern, selection_criteria]);

        let find = Find::new(self.namespace(), filter.into().unwrap_or_default(), options);
        let client = self.client();
        client
            .execute_operation(find)
            .await
            .map(|spec| Cursor::new(client.clone(), spec))
    }

    /// Finds a single document in the collection matching `filter`.
    pub async fn find_one(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOneOptions>>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let options: FindOptions = options.into().unwrap_or_default().into();
        let mut cursor = self.find(filter, options).await?;
        if cursor.advance().await? {
            Ok(Some(cursor.deserialize_current()?))
        } else {
            Ok(None)
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + Send + Sync,
{
    /// Inserts the data in `docs` into the collection.
    ///
    /// Note that this method accepts both owned and borrowed values, so the input documents
    /// do not need to be cloned in order to be passed in.
    ///
    /// The documents are split into as many `insert` commands as the server's batch limits
    /// require. With automatic encryption enabled, each command also stays under 2 MiB unless a
    /// single document alone exceeds that size. A document larger than the server's maximum BSON
    /// object size fails the whole call before anything is sent.
    ///
    /// This operation will retry once upon failure if the connection and encountered error support
    /// retryability. See the documentation
    /// [here](https://www.mongodb.com/docs/manual/core/retryable-writes/) for more information on
    /// retryable writes.
    pub async fn insert_many(
        &self,
        docs: impl IntoIterator<Item = impl Borrow<T>>,
        options: impl Into<Option<InsertManyOptions>>,
    ) -> Result<InsertManyResult> {
        let ds = docs
            .into_iter()
            .map(|d| bson::to_document(d.borrow()).map_err(Error::from))
            .collect::<Result<Vec<Document>>>()?;
        let mut options = options.into();
        resolve_options!(self, options, [write_concern]);

        if ds.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "No documents provided to insert_many".to_string(),
            }
            .into());
        }

        let max_doc_size = self.client().primary_max_bson_object_size().await?;
        for doc in &ds {
            Insert::check_document_size(doc, max_doc_size)?;
        }

        let ordered = options.as_ref().and_then(|o| o.ordered).unwrap_or(true);
        let encrypted = self.client().should_auto_encrypt().await;

        let mut cumulative_failure: Option<InsertManyError> = None;
        let mut error_labels: HashSet<String> = Default::default();
        let mut cumulative_result: Option<InsertManyResult> = None;

        let mut n_attempted = 0;

        while n_attempted < ds.len() {
            let docs: Vec<&Document> = ds.iter().skip(n_attempted).collect();
            let mut insert = Insert::new(self.namespace(), docs, options.clone(), encrypted);

            let result = self
                .client()
                .execute_operation::<Insert<'_>>(&mut insert)
                .await;
            let current_batch_size = insert.batch_len();

            match result {
                Ok(result) => {
                    let cumulative_result =
                        cumulative_result.get_or_insert_with(InsertManyResult::new);
                    for (index, id) in result.inserted_ids {
                        cumulative_result
                            .inserted_ids
                            .insert(index + n_attempted, id);
                    }
                }
                Err(e) => {
                    let labels = e.labels().clone();
                    match *e.kind {
                        ErrorKind::InsertMany(failure) => {
                            let failure_ref =
                                cumulative_failure.get_or_insert_with(InsertManyError::new);
                            for (index, id) in failure.inserted_ids {
                                failure_ref.inserted_ids.insert(index + n_attempted, id);
                            }
                            if let Some(write_errors) = failure.write_errors {
                                for err in write_errors {
                                    let index = n_attempted + err.index;

                                    failure_ref
                                        .write_errors
                                        .get_or_insert_with(Default::default)
                                        .push(IndexedWriteError { index, ..err });
                                }
                            }

                            if let Some(wc_error) = failure.write_concern_error {
                                failure_ref.write_concern_error = Some(wc_error);
                            }

                            error_labels.extend(labels);

                            if ordered {
                                if let Some(failure) = cumulative_failure {
                                    return Err(Error::new(
                                        ErrorKind::InsertMany(failure),
                                        Some(error_labels),
                                    ));
                                }
                            }
                        }
                        _ => return Err(e),
                    }
                }
            }

            n_attempted += current_batch_size;
        }

        match cumulative_failure {
            Some(failure) => Err(Error::new(
                ErrorKind::InsertMany(failure),
                Some(error_labels),
            )),
            None => Ok(cumulative_result.unwrap_or_else(InsertManyResult::new)),
        }
    }

    /// Inserts `doc` into the collection.
    ///
    /// Note that either an owned or borrowed value can be inserted here, so the input document
    /// does not need to be cloned to be passed in.
    ///
    /// This operation will retry once upon failure if the connection and encountered error support
    /// retryability.
    pub async fn insert_one(
        &self,
        doc: impl Borrow<T>,
        options: impl Into<Option<InsertOneOptions>>,
    ) -> Result<InsertOneResult> {
        let document = bson::to_document(doc.borrow())?;
        let mut options = options.into();
        resolve_options!(self, options, [write_concern]);

        let encrypted = self.client().should_auto_encrypt().await;
        let insert = Insert::new(
            self.namespace(),
            vec![&document],
            options.map(InsertManyOptions::from_insert_one_options),
            encrypted,
        );
        self.client()
            .execute_operation(insert)
            .await
            .map(InsertOneResult::from_insert_many_result)
            .map_err(convert_insert_many_error)
    }

    /// Performs the writes described by `models`.
    ///
    /// Consecutive models of the same kind share an `insert`, `update` or `delete` command, split
    /// into batches the same way as [`insert_many`](Collection::insert_many). An ordered bulk write
    /// stops at the first batch that reports a failure; an unordered one attempts every model.
    /// Indexes in the result and in any [`BulkWriteFailure`] refer to positions in `models`.
    ///
    /// Batches that contain no `UpdateMany` or `DeleteMany` model are retried once upon a
    /// retryable failure.
    pub async fn bulk_write(
        &self,
        models: impl IntoIterator<Item = WriteModel>,
        options: impl Into<Option<BulkWriteOptions>>,
    ) -> Result<BulkWriteResult> {
        let models: Vec<WriteModel> = models.into_iter().collect();
        let mut options = options.into();
        resolve_options!(self, options, [write_concern]);

        if models.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "No models provided to bulk_write".to_string(),
            }
            .into());
        }

        let max_doc_size = self.client().primary_max_bson_object_size().await?;
        for model in &models {
            if let WriteModel::InsertOne { document } = model {
                Insert::check_document_size(document, max_doc_size)?;
            }
        }

        let ordered = options.as_ref().and_then(|o| o.ordered).unwrap_or(true);
        let encrypted = self.client().should_auto_encrypt().await;

        let mut cumulative_result = BulkWriteResult::new();
        let mut cumulative_failure: Option<BulkWriteFailure> = None;
        let mut error_labels: HashSet<String> = Default::default();

        let mut n_attempted = 0;

        while n_attempted < models.len() {
            let mut bulk_write = BulkWrite::new(
                self.namespace(),
                &models[n_attempted..],
                options.clone(),
                encrypted,
            );

            let result = self
                .client()
                .execute_operation::<BulkWrite<'_>>(&mut bulk_write)
                .await;
            let current_batch_size = bulk_write.batch_len();

            match result {
                Ok(result) => cumulative_result.merge(result, n_attempted),
                Err(e) => {
                    let labels = e.labels().clone();
                    match *e.kind {
                        ErrorKind::BulkWrite(failure) => {
                            cumulative_result.merge(failure.partial_result, n_attempted);

                            let failure_ref =
                                cumulative_failure.get_or_insert_with(BulkWriteFailure::new);
                            for err in failure.write_errors.into_iter().flatten() {
                                let index = n_attempted + err.index;
                                failure_ref
                                    .write_errors
                                    .get_or_insert_with(Default::default)
                                    .push(IndexedWriteError { index, ..err });
                            }
                            if let Some(wc_error) = failure.write_concern_error {
                                failure_ref.write_concern_error = Some(wc_error);
                            }

                            error_labels.extend(labels);

                            if ordered {
                                break;
                            }
                        }
                        _ => return Err(e),
                    }
                }
            }

            n_attempted += current_batch_size;
        }

        match cumulative_failure {
            Some(mut failure) => {
                failure.partial_result = cumulative_result;
                Err(Error::new(ErrorKind::BulkWrite(failure), Some(error_labels)))
            }
            None => Ok(cumulative_result),
        }
    }

    /// Replaces up to one document matching `query` in the collection with `replacement`.
    ///
    /// This operation will retry once upon failure if the connection and encountered error support
    /// retryability.
    pub async fn replace_one(
        &self,
        query: Document,
        replacement: impl Borrow<T>,
        options: impl Into<Option<ReplaceOptions>>,
    ) -> Result<UpdateResult> {
        let replacement = bson::to_document(replacement.borrow())?;
        let options = options.into().map(UpdateOptions::from);
        self.update_common(query, UpdateOrReplace::Replacement(replacement), false, options)
            .await
    }
}

/// A struct modeling the canonical name for a collection in MongoDB.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The name of the database associated with this namespace.
    pub db: String,

    /// The name of the collection this namespace corresponds to.
    pub coll: String,
}

impl Namespace {
    /// Construct a `Namespace` with the given database and collection.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    fn parse(s: &str) -> Option<Self> {
        let (db, coll) = s.split_once('.')?;
        if db.is_empty() || coll.is_empty() {
            return None;
        }
        Some(Self::new(db, coll))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| D::Error::custom("Missing one or more fields in namespace"))
    }
}

impl Serialize for Namespace {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| {
            Error::invalid_argument(format!("Missing one or more fields in namespace {s:?}"))
        })
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::Namespace;
    use crate::bson::{doc, from_document, to_document};

    #[test]
    fn namespace_splits_on_first_dot() {
        let ns: Namespace = "keyvault.datakeys.v2".parse().unwrap();
        assert_eq!(ns, Namespace::new("keyvault", "datakeys.v2"));
        assert_eq!(ns.to_string(), "keyvault.datakeys.v2");

        assert!("keyvault".parse::<Namespace>().is_err());
        assert!(".coll".parse::<Namespace>().is_err());
        assert!("db.".parse::<Namespace>().is_err());
    }

    #[test]
    fn namespace_serializes_as_string() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrapper {
            ns: Namespace,
        }

        let doc = to_document(&Wrapper {
            ns: Namespace::new("db", "coll"),
        })
        .unwrap();
        assert_eq!(doc, doc! { "ns": "db.coll" });

        let parsed: Wrapper = from_document(doc! { "ns": "a.b" }).unwrap();
        assert_eq!(parsed.ns, Namespace::new("a", "b"));
        assert!(from_document::<Wrapper>(doc! { "ns": "ab" }).is_err());
    }
}
