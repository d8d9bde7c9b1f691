//! Contains the types of results returned by CRUD operations.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::bson::{Bson, Document};

/// The result of a [`Collection::insert_one`](crate::Collection::insert_one) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertOneResult {
    /// The `_id` field of the document inserted.
    pub inserted_id: Bson,
}

impl InsertOneResult {
    pub(crate) fn from_insert_many_result(result: InsertManyResult) -> Self {
        Self {
            inserted_id: result.inserted_ids.get(&0).cloned().unwrap_or(Bson::Null),
        }
    }
}

/// The result of a [`Collection::insert_many`](crate::Collection::insert_many) operation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertManyResult {
    /// The `_id` field of the documents inserted.
    pub inserted_ids: HashMap<usize, Bson>,
}

impl InsertManyResult {
    pub(crate) fn new() -> Self {
        InsertManyResult {
            inserted_ids: HashMap::new(),
        }
    }
}

/// The result of a [`Collection::bulk_write`](crate::Collection::bulk_write) operation. Map keys
/// are positions in the list of models passed in.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkWriteResult {
    /// The number of documents inserted.
    pub inserted_count: u64,

    /// The number of documents matched by update and replace models.
    pub matched_count: u64,

    /// The number of documents modified by update and replace models.
    pub modified_count: u64,

    /// The number of documents deleted.
    pub deleted_count: u64,

    /// The number of documents upserted.
    pub upserted_count: u64,

    /// The `_id` of each inserted document.
    pub inserted_ids: HashMap<usize, Bson>,

    /// The `_id` of each upserted document.
    pub upserted_ids: HashMap<usize, Bson>,
}

impl BulkWriteResult {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a batch's counts, shifting its indexes by `offset`.
    pub(crate) fn merge(&mut self, other: BulkWriteResult, offset: usize) {
        self.inserted_count += other.inserted_count;
        self.matched_count += other.matched_count;
        self.modified_count += other.modified_count;
        self.deleted_count += other.deleted_count;
        self.upserted_count += other.upserted_count;
        self.inserted_ids.extend(
            other
                .inserted_ids
                .into_iter()
                .map(|(index, id)| (index + offset, id)),
        );
        self.upserted_ids.extend(
            other
                .upserted_ids
                .into_iter()
                .map(|(index, id)| (index + offset, id)),
        );
    }
}

/// The result of a [`Collection::update_one`](crate::Collection::update_one) or
/// [`Collection::update_many`](crate::Collection::update_many) operation.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateResult {
    /// The number of documents that matched the filter.
    pub matched_count: u64,

    /// The number of documents that were modified by the operation.
    pub modified_count: u64,

    /// The `_id` field of the upserted document.
    pub upserted_id: Option<Bson>,
}

/// The result of a [`Collection::delete_one`](crate::Collection::delete_one) or
/// [`Collection::delete_many`](crate::Collection::delete_many) operation.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DeleteResult {
    /// The number of documents deleted by the operation.
    pub deleted_count: u64,
}

/// Information about the index created as a result of a
/// [`Collection::create_index`](crate::Collection::create_index).
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct CreateIndexResult {
    /// The name of the index created in the `createIndex` command.
    pub index_name: String,
}

/// Information about the indexes created by a `createIndexes` command.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CreateIndexesResult {
    pub(crate) index_names: Vec<String>,
}

impl CreateIndexesResult {
    pub(crate) fn into_create_index_result(self) -> CreateIndexResult {
        CreateIndexResult {
            index_name: self.index_names.into_iter().next().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GetMoreResult {
    pub(crate) batch: VecDeque<Document>,
    pub(crate) exhausted: bool,
    pub(crate) id: i64,
}

/// Describes the type of data store returned when executing
/// [`Database::list_collections`](crate::Database::list_collections).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum CollectionType {
    /// Indicates that the data store is a view.
    View,

    /// Indicates that the data store is a collection.
    Collection,

    /// Indicates that the data store is a timeseries.
    Timeseries,
}

/// Info about the collection that is contained in the `CollectionSpecification::info` field of a
/// specification returned from
/// [`Database::list_collections`](crate::Database::list_collections).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CollectionSpecification {
    /// The name of the collection.
    pub name: String,

    /// Type of the data store.
    #[serde(rename = "type")]
    pub collection_type: CollectionType,

    /// The options used to create the collection.
    #[serde(default)]
    pub options: Document,
}
