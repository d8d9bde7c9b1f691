use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::UpdateOrReplace;
use crate::{
    bson::{doc, Bson, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, Result},
    operation::{append_options, OperationWithDefaults, Retryability},
    options::{FindOneAndDeleteOptions, FindOneAndUpdateOptions, ReturnDocument},
    Namespace,
};

#[derive(Clone, Debug)]
enum Modification {
    Delete,
    Update(UpdateOrReplace),
}

/// The fields of a `findAndModify` command other than the namespace, query and modification.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindAndModifyOptions {
    sort: Option<Document>,
    new: Option<bool>,
    upsert: Option<bool>,
    bypass_document_validation: Option<bool>,
    write_concern: Option<WriteConcern>,
    array_filters: Option<Vec<Document>>,
    #[serde(rename = "fields")]
    projection: Option<Document>,
    comment: Option<Bson>,
}

impl From<FindOneAndDeleteOptions> for FindAndModifyOptions {
    fn from(options: FindOneAndDeleteOptions) -> Self {
        Self {
            sort: options.sort,
            write_concern: options.write_concern,
            projection: options.projection,
            comment: options.comment,
            ..Default::default()
        }
    }
}

impl From<FindOneAndUpdateOptions> for FindAndModifyOptions {
    fn from(options: FindOneAndUpdateOptions) -> Self {
        Self {
            sort: options.sort,
            new: options.return_document.as_ref().map(ReturnDocument::as_bool),
            upsert: options.upsert,
            bypass_document_validation: options.bypass_document_validation,
            write_concern: options.write_concern,
            array_filters: options.array_filters,
            projection: options.projection,
            comment: options.comment,
        }
    }
}

#[derive(Debug)]
pub(crate) struct FindAndModify {
    ns: Namespace,
    query: Document,
    modification: Modification,
    options: FindAndModifyOptions,
}

impl FindAndModify {
    pub(crate) fn with_delete(
        ns: Namespace,
        query: Document,
        options: Option<FindOneAndDeleteOptions>,
    ) -> Self {
        Self::new(
            ns,
            query,
            Modification::Delete,
            options.map(Into::into).unwrap_or_default(),
        )
    }

    pub(crate) fn with_update(
        ns: Namespace,
        query: Document,
        update: UpdateOrReplace,
        options: Option<FindOneAndUpdateOptions>,
    ) -> Self {
        Self::new(
            ns,
            query,
            Modification::Update(update),
            options.map(Into::into).unwrap_or_default(),
        )
    }

    fn new(
        ns: Namespace,
        query: Document,
        modification: Modification,
        mut options: FindAndModifyOptions,
    ) -> Self {
        if options
            .write_concern
            .as_ref()
            .is_some_and(WriteConcern::is_empty)
        {
            options.write_concern = None;
        }
        Self {
            ns,
            query,
            modification,
            options,
        }
    }
}

impl OperationWithDefaults for FindAndModify {
    type O = Option<Document>;

    const NAME: &'static str = "findAndModify";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        if let Some(ref sort) = self.options.sort {
            if sort.is_empty() {
                return Err(Error::invalid_argument("sort must not be empty"));
            }
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "query": self.query.clone(),
        };

        match self.modification {
            Modification::Delete => {
                body.insert("remove", true);
            }
            Modification::Update(ref update_or_replace) => {
                body.insert("update", update_or_replace.to_bson()?);
            }
        }

        append_options(&mut body, Some(&self.options))?;

        Ok(Command::new(Self::NAME, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        #[derive(Debug, Deserialize)]
        struct Response {
            value: Bson,
        }
        let response: Response = response.body()?;

        match response.value {
            Bson::Document(doc) => Ok(Some(doc)),
            Bson::Null => Ok(None),
            other => Err(Error::invalid_response(format!(
                "expected document for value field of findAndModify response, but instead got \
                 {:?}",
                other.element_type()
            ))),
        }
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
