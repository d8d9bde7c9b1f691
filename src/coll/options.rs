//! Options for collection-level operations.

use serde::{Deserialize, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, Bson, Document},
    concern::{ReadConcern, WriteConcern},
    selection_criteria::SelectionCriteria,
};

/// Specifies the options to a [`Collection::insert_one`](crate::Collection::insert_one)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertOneOptions {
    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// The write concern for the operation.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies the options to a [`Collection::insert_many`](crate::Collection::insert_many)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertManyOptions {
    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// If true, when an insert fails, return without performing the remaining writes. If false,
    /// when a write fails, continue with the remaining writes, if any.
    ///
    /// Defaults to true.
    pub ordered: Option<bool>,

    /// The write concern for the operation.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

impl InsertManyOptions {
    pub(crate) fn from_insert_one_options(options: InsertOneOptions) -> Self {
        Self {
            bypass_document_validation: options.bypass_document_validation,
            ordered: None,
            write_concern: options.write_concern,
            comment: options.comment,
        }
    }
}

/// A single write performed as part of a [`Collection::bulk_write`](crate::Collection::bulk_write).
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum WriteModel {
    /// Inserts a document, generating an `_id` if it has none.
    InsertOne {
        /// The document to insert.
        document: Document,
    },

    /// Updates the first document matching the filter.
    UpdateOne {
        /// The filter selecting the document.
        filter: Document,
        /// The update to apply.
        update: UpdateModifications,
        /// If true, insert a document when none matches.
        upsert: Option<bool>,
    },

    /// Updates every document matching the filter.
    UpdateMany {
        /// The filter selecting the documents.
        filter: Document,
        /// The update to apply.
        update: UpdateModifications,
        /// If true, insert a document when none matches.
        upsert: Option<bool>,
    },

    /// Replaces the first document matching the filter.
    ReplaceOne {
        /// The filter selecting the document.
        filter: Document,
        /// The document replacing the match.
        replacement: Document,
        /// If true, insert the replacement when nothing matches.
        upsert: Option<bool>,
    },

    /// Deletes the first document matching the filter.
    DeleteOne {
        /// The filter selecting the document.
        filter: Document,
    },

    /// Deletes every document matching the filter.
    DeleteMany {
        /// The filter selecting the documents.
        filter: Document,
    },
}

impl WriteModel {
    /// The write command that carries this model.
    pub(crate) fn command_name(&self) -> &'static str {
        match self {
            Self::InsertOne { .. } => "insert",
            Self::UpdateOne { .. } | Self::UpdateMany { .. } | Self::ReplaceOne { .. } => {
                "update"
            }
            Self::DeleteOne { .. } | Self::DeleteMany { .. } => "delete",
        }
    }

    /// Whether the model may write more than one document.
    pub(crate) fn is_multi(&self) -> bool {
        matches!(self, Self::UpdateMany { .. } | Self::DeleteMany { .. })
    }
}

/// Specifies the options to a [`Collection::bulk_write`](crate::Collection::bulk_write)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkWriteOptions {
    /// Opt out of document-level validation. Ignored by delete models.
    pub bypass_document_validation: Option<bool>,

    /// If true, stop at the first model that fails. If false, attempt every model.
    ///
    /// Defaults to true.
    pub ordered: Option<bool>,

    /// The write concern for the operation.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Enum modeling the modifications to apply during an update.
/// For details, see the official MongoDB
/// [documentation](https://www.mongodb.com/docs/manual/reference/command/update/#update-command-behaviors)
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum UpdateModifications {
    /// A document that contains only update operator expressions.
    Document(Document),

    /// An aggregation pipeline.
    Pipeline(Vec<Document>),
}

impl UpdateModifications {
    pub(crate) fn to_bson(&self) -> Bson {
        match self {
            Self::Document(document) => Bson::Document(document.clone()),
            Self::Pipeline(pipeline) => crate::bson_util::to_bson_array(pipeline),
        }
    }
}

impl From<Document> for UpdateModifications {
    fn from(item: Document) -> Self {
        UpdateModifications::Document(item)
    }
}

impl From<Vec<Document>> for UpdateModifications {
    fn from(item: Vec<Document>) -> Self {
        UpdateModifications::Pipeline(item)
    }
}

/// Specifies the options to a [`Collection::update_one`](crate::Collection::update_one) or
/// [`Collection::update_many`](crate::Collection::update_many) operation.
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateOptions {
    /// A set of filters specifying to which array elements an update should apply.
    pub array_filters: Option<Vec<Document>>,

    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// If true, insert a document if no matching document is found.
    pub upsert: Option<bool>,

    /// The index to use for the operation.
    pub hint: Option<Document>,

    /// The write concern for the operation.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,

    /// Map of parameter names and values. Values must be constant or closed
    /// expressions that do not reference document fields. Parameters can then be
    /// accessed as variables in an aggregate expression context (e.g. "$$var").
    #[serde(rename = "let")]
    pub let_vars: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies the options to a [`Collection::replace_one`](crate::Collection::replace_one)
/// operation.
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReplaceOptions {
    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// If true, insert a document if no matching document is found.
    pub upsert: Option<bool>,

    /// The index to use for the operation.
    pub hint: Option<Document>,

    /// The write concern for the operation.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

impl From<ReplaceOptions> for UpdateOptions {
    fn from(options: ReplaceOptions) -> Self {
        Self {
            bypass_document_validation: options.bypass_document_validation,
            upsert: options.upsert,
            hint: options.hint,
            write_concern: options.write_concern,
            comment: options.comment,
            ..Default::default()
        }
    }
}

/// Specifies the options to a [`Collection::delete_one`](crate::Collection::delete_one) or
/// [`Collection::delete_many`](crate::Collection::delete_many) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DeleteOptions {
    /// The write concern for the operation.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,

    /// The index to use for the operation.
    #[serde(skip_serializing)]
    pub hint: Option<Document>,

    /// Map of parameter names and values.
    #[serde(rename = "let")]
    pub let_vars: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies whether a
/// [`Collection::find_one_and_update`](crate::Collection::find_one_and_update) operation should
/// return the document before or after modification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[non_exhaustive]
pub enum ReturnDocument {
    /// Return the document after modification.
    After,
    /// Return the document before modification.
    Before,
}

impl ReturnDocument {
    pub(crate) fn as_bool(&self) -> bool {
        matches!(self, ReturnDocument::After)
    }
}

/// Specifies the options to a
/// [`Collection::find_one_and_delete`](crate::Collection::find_one_and_delete) operation.
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct FindOneAndDeleteOptions {
    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// Determines which document the operation deletes if the query matches multiple documents.
    pub sort: Option<Document>,

    /// The write concern for the operation.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies the options to a
/// [`Collection::find_one_and_update`](crate::Collection::find_one_and_update) operation.
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct FindOneAndUpdateOptions {
    /// A set of filters specifying to which array elements an update should apply.
    pub array_filters: Option<Vec<Document>>,

    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// Whether the operation should return the document before or after modification.
    pub return_document: Option<ReturnDocument>,

    /// Determines which document the operation updates if the query matches multiple documents.
    pub sort: Option<Document>,

    /// If true, insert a document if no matching document is found.
    pub upsert: Option<bool>,

    /// The write concern for the operation.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies the options to a [`Collection::find`](crate::Collection::find) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct FindOptions {
    /// The number of documents the server should return per cursor batch.
    ///
    /// Note that this does not have any affect on the documents that are returned by a cursor,
    /// only the number of documents kept in memory at a given time (and by extension, the
    /// number of round trips needed to return the entire set of documents returned by the
    /// query.
    #[serde(serialize_with = "serialize_u32_option_as_i32")]
    pub batch_size: Option<u32>,

    /// The maximum number of documents to query.
    /// If a negative number is specified, the documents will be returned in a single batch and
    /// no cursor is left open on the server.
    pub limit: Option<i64>,

    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// The read concern to use for this find query.
    ///
    /// If none specified, the default set on the collection will be used.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for this find query.
    ///
    /// If none specified, the default set on the collection will be used.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The number of documents to skip before counting.
    #[serde(serialize_with = "serialize_u64_option_as_i64")]
    pub skip: Option<u64>,

    /// The order of the documents for the purposes of the operation.
    pub sort: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies the options to a [`Collection::find_one`](crate::Collection::find_one) operation.
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct FindOneOptions {
    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// The read concern to use for this find query.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for this find query.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The number of documents to skip before returning.
    pub skip: Option<u64>,

    /// The order of the documents for the purposes of the operation.
    pub sort: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

impl From<FindOneOptions> for FindOptions {
    fn from(options: FindOneOptions) -> Self {
        FindOptions {
            projection: options.projection,
            read_concern: options.read_concern,
            selection_criteria: options.selection_criteria,
            skip: options.skip,
            sort: options.sort,
            comment: options.comment,
            batch_size: None,
            limit: Some(-1),
        }
    }
}

/// Specifies the options to a [`Collection::aggregate`](crate::Collection::aggregate) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct AggregateOptions {
    /// Enables writing to temporary files.
    pub allow_disk_use: Option<bool>,

    /// The number of documents the server should return per cursor batch.
    #[serde(skip)]
    pub batch_size: Option<u32>,

    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// The read concern to use for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for this operation.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The write concern to use for the operation, used by pipelines ending in `$out` or
    /// `$merge`.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,

    /// Map of parameter names and values.
    #[serde(rename = "let")]
    pub let_vars: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies the options to a
/// [`Collection::count_documents`](crate::Collection::count_documents) operation.
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CountOptions {
    /// The maximum number of documents to count.
    pub limit: Option<u64>,

    /// The number of documents to skip before counting.
    pub skip: Option<u64>,

    /// The read concern to use for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for this operation.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies the options to a
/// [`Collection::estimated_document_count`](crate::Collection::estimated_document_count)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct EstimatedDocumentCountOptions {
    /// The read concern to use for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for this operation.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies the options to a [`Collection::distinct`](crate::Collection::distinct) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DistinctOptions {
    /// The read concern to use for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for this operation.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through the
    /// database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies the options to a [`Collection::drop`](crate::Collection::drop) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DropCollectionOptions {
    /// The write concern for the operation.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,

    /// Map of encrypted fields for the collection. When set, or when the client's
    /// `encrypted_fields_map` has an entry for the collection, the state collections created
    /// for queryable encryption are dropped too.
    #[serde(skip)]
    pub encrypted_fields: Option<Document>,
}

/// Specifies the options for an index.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct IndexOptions {
    /// The name of the index. If none is provided, the name is derived from the keys.
    pub name: Option<String>,

    /// Whether the index rejects duplicate values.
    pub unique: Option<bool>,

    /// Whether only documents that contain the indexed field are indexed.
    pub sparse: Option<bool>,

    /// Only documents matching this filter are indexed.
    pub partial_filter_expression: Option<Document>,
}

/// Specifies the fields and options for an index.
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize, PartialEq)]
#[non_exhaustive]
pub struct IndexModel {
    /// The fields to index, along with their sort order.
    #[serde(rename = "key")]
    pub keys: Document,

    /// Additional options that affect the index.
    #[builder(default, setter(strip_option))]
    #[serde(flatten)]
    pub options: Option<IndexOptions>,
}

impl IndexModel {
    /// If the client did not specify a name, generate and set it. Otherwise, do nothing.
    pub(crate) fn update_name(&mut self) {
        let has_name = self
            .options
            .as_ref()
            .is_some_and(|options| options.name.is_some());
        if !has_name {
            let key_names: Vec<String> = self
                .keys
                .iter()
                .map(|(k, v)| format!("{k}_{v}"))
                .collect();
            self.options.get_or_insert_with(Default::default).name = Some(key_names.join("_"));
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.options.as_ref().and_then(|o| o.name.as_deref())
    }
}

/// Specifies the options to a
/// [`Database::create_collection`](crate::Database::create_collection) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CreateCollectionOptions {
    /// Whether the collection should be capped.
    pub capped: Option<bool>,

    /// The maximum size (in bytes) for a capped collection.
    pub size: Option<u64>,

    /// The maximum number of documents in a capped collection.
    pub max: Option<u64>,

    /// Specifies a validator to restrict the schema of documents which can exist in the
    /// collection. A `$jsonSchema` validator with `encrypt` annotations is how a collection
    /// declares its automatically encrypted fields.
    pub validator: Option<Document>,

    /// The name of the source collection or view of a view.
    pub view_on: Option<String>,

    /// An array of aggregation pipeline stages for a view.
    pub pipeline: Option<Vec<Document>>,

    /// The fields of the collection encrypted with queryable encryption.
    pub encrypted_fields: Option<Document>,

    /// Options for clustered collections.
    pub clustered_index: Option<ClusteredIndex>,

    /// The write concern for the operation.
    #[serde(skip_deserializing)]
    pub write_concern: Option<WriteConcern>,
}

/// Specifies the clustered index of a collection.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusteredIndex {
    /// Key pattern; must be `{_id: 1}`.
    pub key: Document,

    /// Must be `true`.
    pub unique: bool,
}

impl Default for ClusteredIndex {
    fn default() -> Self {
        Self {
            key: doc! { "_id": 1 },
            unique: true,
        }
    }
}

pub(crate) fn serialize_u32_option_as_i32<S: Serializer>(
    val: &Option<u32>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(val) if { *val <= i32::MAX as u32 } => serializer.serialize_i32(*val as i32),
        None => serializer.serialize_none(),
        _ => Err(serde::ser::Error::custom("u32 specified was too large")),
    }
}

pub(crate) fn serialize_u64_option_as_i64<S: Serializer>(
    val: &Option<u64>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(ref v) => crate::bson::serde_helpers::serialize_u64_as_i64(v, serializer),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn index_names_are_derived_from_keys() {
        let mut model = IndexModel::builder()
            .keys(doc! { "keyAltNames": 1, "b": -1 })
            .build();
        model.update_name();
        assert_eq!(model.name(), Some("keyAltNames_1_b_-1"));

        let mut named = IndexModel::builder()
            .keys(doc! { "a": 1 })
            .options(IndexOptions::builder().name("custom".to_string()).build())
            .build();
        named.update_name();
        assert_eq!(named.name(), Some("custom"));
    }

    #[test]
    fn find_options_serialize_camel_case() {
        let options = FindOptions::builder()
            .batch_size(5u32)
            .skip(2u64)
            .sort(doc! { "a": 1 })
            .build();
        let serialized = crate::bson::to_document(&options).unwrap();
        assert_eq!(
            serialized,
            doc! { "batchSize": 5, "skip": 2_i64, "sort": { "a": 1 } }
        );
    }
}
