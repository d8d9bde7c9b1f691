use crate::{
    bson::{doc, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{
        append_options,
        CursorBody,
        CursorSpecification,
        OperationWithDefaults,
        Retryability,
    },
    options::FindOptions,
    selection_criteria::SelectionCriteria,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: Option<Box<FindOptions>>,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Document, options: Option<FindOptions>) -> Self {
        Self {
            ns,
            filter,
            options: options.map(Box::new),
        }
    }
}

impl OperationWithDefaults for Find {
    type O = CursorSpecification;

    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };

        let mut options = self.options.as_deref().cloned();
        if let Some(ref mut options) = options {
            // a negative limit requests a single batch of at most that many documents.
            if let Some(limit) = options.limit.filter(|limit| *limit < 0) {
                body.insert("singleBatch", true);
                options.limit = Some(-limit);
            }

            if options
                .batch_size
                .is_some_and(|batch_size| i32::try_from(batch_size).is_err())
            {
                return Err(Error::invalid_argument(
                    "the batch size must fit into a signed 32-bit integer",
                ));
            }
        }
        append_options(&mut body, options.as_ref())?;

        body.insert("filter", self.filter.clone());

        Ok(Command::new(Self::NAME, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: CursorBody = response.body()?;

        Ok(CursorSpecification::new(
            response.cursor,
            description.server_address.clone(),
            self.options.as_ref().and_then(|opts| opts.batch_size),
        ))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|opts| opts.selection_criteria.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
