use std::collections::HashMap;

use serde::Deserialize;

use super::insert::get_or_prepend_id_field;
use crate::{
    bson::{doc, Bson, Document},
    bson_util::{self, array_entry_size_bytes},
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{BulkWriteFailure, Error, ErrorKind, Result},
    operation::{
        append_options,
        OperationWithDefaults,
        Retryability,
        UpdateOrReplace,
        WriteResponseBody,
        COMMAND_OVERHEAD_SIZE,
        MAX_ENCRYPTED_WRITE_SIZE,
    },
    options::{BulkWriteOptions, WriteModel},
    results::BulkWriteResult,
    Namespace,
};

/// Sends the longest prefix of `models` that shares one write command and fits in a single
/// batch. Callers re-issue the operation on the models that follow [`BulkWrite::batch_len`].
#[derive(Debug)]
pub(crate) struct BulkWrite<'a> {
    ns: Namespace,
    models: &'a [WriteModel],
    options: BulkWriteOptions,
    encrypted: bool,
    command_name: &'static str,
    run_len: usize,
    batch_len: usize,
    inserted_ids: Vec<Bson>,
}

impl<'a> BulkWrite<'a> {
    pub(crate) fn new(
        ns: Namespace,
        models: &'a [WriteModel],
        options: Option<BulkWriteOptions>,
        encrypted: bool,
    ) -> Self {
        let mut options = options.unwrap_or_default();
        if options.ordered.is_none() {
            options.ordered = Some(true);
        }
        if options
            .write_concern
            .as_ref()
            .is_some_and(WriteConcern::is_empty)
        {
            options.write_concern = None;
        }

        let command_name = models.first().map_or("insert", WriteModel::command_name);
        if command_name == "delete" {
            options.bypass_document_validation = None;
        }
        let run_len = models
            .iter()
            .take_while(|model| model.command_name() == command_name)
            .count();

        Self {
            ns,
            models,
            options,
            encrypted,
            command_name,
            run_len,
            batch_len: 0,
            inserted_ids: Vec::new(),
        }
    }

    /// The number of models placed in the most recently built command.
    pub(crate) fn batch_len(&self) -> usize {
        self.batch_len
    }

    fn statement(&mut self, model: &WriteModel, max_doc_size: usize) -> Result<Document> {
        match model {
            WriteModel::InsertOne { document } => {
                let (document, id) = get_or_prepend_id_field(document);
                let size = bson_util::doc_size_bytes(&document)?;
                if size > max_doc_size {
                    return Err(ErrorKind::DocumentTooLarge {
                        size,
                        max: max_doc_size,
                    }
                    .into());
                }
                self.inserted_ids.push(id);
                Ok(document)
            }
            WriteModel::UpdateOne {
                filter,
                update,
                upsert,
            }
            | WriteModel::UpdateMany {
                filter,
                update,
                upsert,
            } => {
                let update = UpdateOrReplace::from(update.clone());
                let mut statement = doc! { "q": filter.clone(), "u": update.to_bson()? };
                if let Some(upsert) = upsert {
                    statement.insert("upsert", *upsert);
                }
                if model.is_multi() {
                    statement.insert("multi", true);
                }
                Ok(statement)
            }
            WriteModel::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => {
                let replacement = UpdateOrReplace::Replacement(replacement.clone());
                let mut statement = doc! { "q": filter.clone(), "u": replacement.to_bson()? };
                if let Some(upsert) = upsert {
                    statement.insert("upsert", *upsert);
                }
                Ok(statement)
            }
            WriteModel::DeleteOne { filter } | WriteModel::DeleteMany { filter } => {
                let limit = if model.is_multi() { 0 } else { 1 };
                Ok(doc! { "q": filter.clone(), "limit": limit })
            }
        }
    }

    fn array_field(&self) -> &'static str {
        match self.command_name {
            "insert" => "documents",
            "update" => "updates",
            _ => "deletes",
        }
    }
}

impl OperationWithDefaults for BulkWrite<'_> {
    type O = BulkWriteResult;

    const NAME: &'static str = "bulkWrite";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        // A retry rebuilds the batch from scratch.
        self.inserted_ids.clear();
        self.batch_len = 0;

        let max_doc_size = usize::try_from(description.max_bson_object_size).unwrap_or(usize::MAX);
        let max_doc_sequence_size = usize::try_from(description.max_message_size_bytes)
            .unwrap_or(usize::MAX)
            .saturating_sub(COMMAND_OVERHEAD_SIZE);
        let max_batch = usize::try_from(description.max_write_batch_size).unwrap_or(usize::MAX);

        let mut statements = Vec::new();
        let mut size = 0;
        let models = self.models;

        for (i, model) in models.iter().take(self.run_len.min(max_batch)).enumerate() {
            let ids_before = self.inserted_ids.len();
            let statement = self.statement(model, max_doc_size)?;
            let statement_size = bson_util::doc_size_bytes(&statement)?;

            // The first statement always goes out, whatever its size.
            if i != 0 {
                let full = if self.encrypted {
                    size + array_entry_size_bytes(i, statement_size) as usize
                        >= MAX_ENCRYPTED_WRITE_SIZE
                } else {
                    size + statement_size > max_doc_sequence_size
                };
                if full {
                    self.inserted_ids.truncate(ids_before);
                    break;
                }
            }

            statements.push(Bson::Document(statement));
            size += statement_size;
        }
        self.batch_len = statements.len();

        let mut body = Document::new();
        body.insert(self.command_name, self.ns.coll.clone());
        body.insert(self.array_field(), statements);
        append_options(&mut body, Some(&self.options))?;

        Ok(Command::new(self.command_name, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: WriteResponseBody<BatchBody> = response.body()?;

        let mut result = BulkWriteResult::new();
        match self.command_name {
            "insert" => {
                result.inserted_count = response.n;
                if self.options.ordered == Some(true) {
                    // Only the first n of an ordered batch were attempted.
                    result.inserted_ids = self
                        .inserted_ids
                        .iter()
                        .cloned()
                        .enumerate()
                        .take(response.n as usize)
                        .collect();
                } else {
                    let mut ids: HashMap<usize, Bson> =
                        self.inserted_ids.iter().cloned().enumerate().collect();
                    for err in response.write_errors.iter().flatten() {
                        ids.remove(&err.index);
                    }
                    result.inserted_ids = ids;
                }
            }
            "update" => {
                let upserted = response.body.upserted.unwrap_or_default();
                result.upserted_count = upserted.len() as u64;
                result.matched_count = response.n.saturating_sub(result.upserted_count);
                result.modified_count = response.body.n_modified;
                result.upserted_ids = upserted.into_iter().map(|u| (u.index, u.id)).collect();
            }
            _ => result.deleted_count = response.n,
        }

        if response.write_errors.is_some() || response.write_concern_error.is_some() {
            return Err(Error::new(
                ErrorKind::BulkWrite(BulkWriteFailure {
                    write_errors: response.write_errors,
                    write_concern_error: response.write_concern_error,
                    partial_result: result,
                }),
                response.labels,
            ));
        }

        Ok(result)
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        if self.models[..self.run_len].iter().any(WriteModel::is_multi) {
            Retryability::None
        } else {
            Retryability::Write
        }
    }

    fn name(&self) -> &str {
        self.command_name
    }
}

#[derive(Deserialize)]
struct BatchBody {
    #[serde(rename = "nModified", default)]
    n_modified: u64,
    upserted: Option<Vec<Upserted>>,
}

#[derive(Deserialize)]
struct Upserted {
    index: usize,
    #[serde(rename = "_id")]
    id: Bson,
}
