use std::collections::HashMap;

use crate::{
    bson::{oid::ObjectId, Bson, Document},
    bson_util::{self, array_entry_size_bytes},
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, ErrorKind, InsertManyError, Result},
    operation::{
        append_options,
        OperationWithDefaults,
        Retryability,
        WriteResponseBody,
        COMMAND_OVERHEAD_SIZE,
        MAX_ENCRYPTED_WRITE_SIZE,
    },
    options::InsertManyOptions,
    results::InsertManyResult,
    Namespace,
};

// Element type, the "_id" cstring and an ObjectId.
const PREPENDED_ID_SIZE: usize = 1 + 4 + 12;

#[derive(Debug)]
pub(crate) struct Insert<'a> {
    ns: Namespace,
    documents: Vec<&'a Document>,
    inserted_ids: Vec<Bson>,
    options: InsertManyOptions,
    encrypted: bool,
}

impl<'a> Insert<'a> {
    pub(crate) fn new(
        ns: Namespace,
        documents: Vec<&'a Document>,
        options: Option<InsertManyOptions>,
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

        Self {
            ns,
            options,
            documents,
            inserted_ids: vec![],
            encrypted,
        }
    }
}

/// Returns the document's `_id`, generating an `ObjectId` and placing it first in the document if
/// there is none.
pub(super) fn get_or_prepend_id_field(doc: &Document) -> (Document, Bson) {
    match doc.get("_id") {
        Some(id) => (doc.clone(), id.clone()),
        None => {
            let id = Bson::ObjectId(ObjectId::new());
            let mut with_id = Document::new();
            with_id.insert("_id", id.clone());
            with_id.extend(doc.clone());
            (with_id, id)
        }
    }
}

impl Insert<'_> {
    /// Fails with `DocumentTooLarge` when `doc`, counting the `_id` an insert would prepend, is
    /// larger than `max` bytes.
    pub(crate) fn check_document_size(doc: &Document, max: usize) -> Result<()> {
        let size = bson_util::doc_size_bytes(doc)?
            + if doc.contains_key("_id") {
                0
            } else {
                PREPENDED_ID_SIZE
            };
        if size > max {
            return Err(ErrorKind::DocumentTooLarge { size, max }.into());
        }
        Ok(())
    }
}

impl OperationWithDefaults for Insert<'_> {
    type O = InsertManyResult;

    const NAME: &'static str = "insert";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        // A retry rebuilds the batch from scratch.
        self.inserted_ids.clear();

        let mut docs = Vec::new();
        let mut size = 0;

        let max_doc_size = usize::try_from(description.max_bson_object_size).unwrap_or(usize::MAX);
        let max_doc_sequence_size = usize::try_from(description.max_message_size_bytes)
            .unwrap_or(usize::MAX)
            .saturating_sub(COMMAND_OVERHEAD_SIZE);
        let max_batch = usize::try_from(description.max_write_batch_size).unwrap_or(usize::MAX);

        for (i, d) in self.documents.iter().take(max_batch).enumerate() {
            let (doc, id) = get_or_prepend_id_field(d);

            let doc_size = bson_util::doc_size_bytes(&doc)?;
            if doc_size > max_doc_size {
                return Err(ErrorKind::DocumentTooLarge {
                    size: doc_size,
                    max: max_doc_size,
                }
                .into());
            }

            // The encrypted batch limit is never applied to the first document: a single
            // document larger than 2 MiB (but within maxBsonObjectSize) is still sent on its own.
            if self.encrypted && i != 0 {
                let doc_entry_size = array_entry_size_bytes(i, doc_size) as usize;
                if size + doc_entry_size >= MAX_ENCRYPTED_WRITE_SIZE {
                    break;
                }
            } else if size + doc_size > max_doc_sequence_size {
                break;
            }

            self.inserted_ids.push(id);
            docs.push(Bson::Document(doc));
            size += doc_size;
        }

        let mut body = Document::new();
        body.insert(Self::NAME, self.ns.coll.clone());
        body.insert("documents", docs);
        append_options(&mut body, Some(&self.options))?;

        Ok(Command::new(Self::NAME, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: WriteResponseBody = response.body()?;

        let mut map = HashMap::new();
        if self.options.ordered == Some(true) {
            // in ordered inserts, only the first n were attempted.
            for (i, id) in self
                .inserted_ids
                .iter()
                .enumerate()
                .take(response.n as usize)
            {
                map.insert(i, id.clone());
            }
        } else {
            // for unordered, add all the attempted ids and then remove the ones that have
            // associated write errors.
            for (i, id) in self.inserted_ids.iter().enumerate() {
                map.insert(i, id.clone());
            }

            if let Some(write_errors) = response.write_errors.as_ref() {
                for err in write_errors {
                    map.remove(&err.index);
                }
            }
        }

        if response.write_errors.is_some() || response.write_concern_error.is_some() {
            return Err(Error::new(
                ErrorKind::InsertMany(InsertManyError {
                    write_errors: response.write_errors,
                    write_concern_error: response.write_concern_error,
                    inserted_ids: map,
                }),
                response.labels,
            ));
        }

        Ok(InsertManyResult { inserted_ids: map })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}

impl Insert<'_> {
    /// The number of documents placed in the most recently built command.
    pub(crate) fn batch_len(&self) -> usize {
        self.inserted_ids.len()
    }
}
