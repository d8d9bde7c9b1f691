use serde::Deserialize;

use crate::{
    bson::{doc, Bson, Document},
    bson_util,
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{convert_insert_many_error, Result},
    operation::{
        append_write_concern,
        remove_empty_write_concern,
        OperationWithDefaults,
        Retryability,
        WriteResponseBody,
    },
    options::{UpdateModifications, UpdateOptions},
    results::UpdateResult,
    Namespace,
};

#[derive(Clone, Debug)]
pub(crate) enum UpdateOrReplace {
    UpdateModifications(UpdateModifications),
    Replacement(Document),
}

impl UpdateOrReplace {
    pub(crate) fn to_bson(&self) -> Result<Bson> {
        match self {
            Self::UpdateModifications(update_modifications) => {
                if let UpdateModifications::Document(ref document) = update_modifications {
                    bson_util::update_document_check(document)?;
                }
                Ok(update_modifications.to_bson())
            }
            Self::Replacement(replacement) => {
                bson_util::replacement_document_check(replacement)?;
                Ok(Bson::Document(replacement.clone()))
            }
        }
    }
}

impl From<UpdateModifications> for UpdateOrReplace {
    fn from(update_modifications: UpdateModifications) -> Self {
        Self::UpdateModifications(update_modifications)
    }
}

#[derive(Debug)]
pub(crate) struct Update {
    ns: Namespace,
    filter: Document,
    update: UpdateOrReplace,
    multi: Option<bool>,
    options: Option<UpdateOptions>,
}

impl Update {
    pub(crate) fn new(
        ns: Namespace,
        filter: Document,
        update: UpdateOrReplace,
        multi: bool,
        mut options: Option<UpdateOptions>,
    ) -> Self {
        remove_empty_write_concern!(options);
        Self {
            ns,
            filter,
            update,
            multi: multi.then_some(true),
            options,
        }
    }
}

impl OperationWithDefaults for Update {
    type O = UpdateResult;

    const NAME: &'static str = "update";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };

        let mut update = doc! {
            "q": self.filter.clone(),
            "u": self.update.to_bson()?,
        };

        if let Some(ref options) = self.options {
            if let Some(upsert) = options.upsert {
                update.insert("upsert", upsert);
            }

            if let Some(ref array_filters) = options.array_filters {
                update.insert("arrayFilters", bson_util::to_bson_array(array_filters));
            }

            if let Some(ref hint) = options.hint {
                update.insert("hint", hint.clone());
            }

            if let Some(bypass_doc_validation) = options.bypass_document_validation {
                body.insert("bypassDocumentValidation", bypass_doc_validation);
            }

            append_write_concern(&mut body, options.write_concern.as_ref())?;

            if let Some(ref let_vars) = options.let_vars {
                body.insert("let", let_vars.clone());
            }

            if let Some(ref comment) = options.comment {
                body.insert("comment", comment.clone());
            }
        };

        if let Some(multi) = self.multi {
            update.insert("multi", multi);
        }

        body.insert("updates", vec![Bson::Document(update)]);
        body.insert("ordered", true);

        Ok(Command::new(Self::NAME, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: WriteResponseBody<UpdateBody> = response.body()?;
        response.validate().map_err(convert_insert_many_error)?;

        let modified_count = response.n_modified;
        let upserted_id = response
            .upserted
            .as_ref()
            .and_then(|v| v.first())
            .and_then(|doc| doc.get("_id"))
            .cloned();

        let matched_count = if upserted_id.is_some() {
            0
        } else {
            response.n
        };

        Ok(UpdateResult {
            matched_count,
            modified_count,
            upserted_id,
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|opts| opts.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        if self.multi != Some(true) {
            Retryability::Write
        } else {
            Retryability::None
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct UpdateBody {
    #[serde(rename = "nModified", default)]
    n_modified: u64,
    upserted: Option<Vec<Document>>,
}
