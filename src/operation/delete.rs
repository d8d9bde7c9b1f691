use crate::{
    bson::{doc, Bson, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{convert_insert_many_error, Result},
    operation::{
        append_options,
        remove_empty_write_concern,
        OperationWithDefaults,
        Retryability,
        WriteResponseBody,
    },
    options::DeleteOptions,
    results::DeleteResult,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Delete {
    ns: Namespace,
    filter: Document,
    limit: i32,
    options: Option<DeleteOptions>,
}

impl Delete {
    /// A `limit` of 1 deletes a single document and 0 deletes every match.
    pub(crate) fn new(
        ns: Namespace,
        filter: Document,
        limit: Option<i32>,
        mut options: Option<DeleteOptions>,
    ) -> Self {
        remove_empty_write_concern!(options);

        Self {
            ns,
            filter,
            limit: limit.unwrap_or(0),
            options,
        }
    }
}

impl OperationWithDefaults for Delete {
    type O = DeleteResult;

    const NAME: &'static str = "delete";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut delete = doc! {
            "q": self.filter.clone(),
            "limit": self.limit,
        };

        if let Some(hint) = self.options.as_ref().and_then(|o| o.hint.as_ref()) {
            delete.insert("hint", hint.clone());
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "deletes": [Bson::Document(delete)],
            "ordered": true,
        };

        append_options(&mut body, self.options.as_ref())?;

        Ok(Command::new(Self::NAME, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: WriteResponseBody = response.body()?;
        response.validate().map_err(convert_insert_many_error)?;

        Ok(DeleteResult {
            deleted_count: response.n,
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|opts| opts.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        if self.limit == 1 {
            Retryability::Write
        } else {
            Retryability::None
        }
    }
}
