use crate::{
    bson::{doc, Document},
    bson_util,
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::Result,
    operation::{
        append_options,
        remove_empty_write_concern,
        CursorBody,
        CursorSpecification,
        OperationWithDefaults,
        Retryability,
    },
    options::AggregateOptions,
    selection_criteria::SelectionCriteria,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Aggregate {
    ns: Namespace,
    pipeline: Vec<Document>,
    options: Option<AggregateOptions>,
}

impl Aggregate {
    pub(crate) fn new(
        ns: Namespace,
        pipeline: impl IntoIterator<Item = Document>,
        mut options: Option<AggregateOptions>,
    ) -> Self {
        remove_empty_write_concern!(options);

        Self {
            ns,
            pipeline: pipeline.into_iter().collect(),
            options,
        }
    }

    /// Whether this aggregation writes its results with a `$out` or `$merge` stage.
    pub(crate) fn is_out_or_merge(&self) -> bool {
        self.pipeline
            .last()
            .and_then(bson_util::first_key)
            .is_some_and(|k| k == "$out" || k == "$merge")
    }
}

impl OperationWithDefaults for Aggregate {
    type O = CursorSpecification;

    const NAME: &'static str = "aggregate";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "pipeline": bson_util::to_bson_array(&self.pipeline),
            "cursor": {},
        };
        append_options(&mut body, self.options.as_ref())?;
        if !self.is_out_or_merge() {
            body.remove("writeConcern");
        }

        if let Some(batch_size) = self.options.as_ref().and_then(|o| o.batch_size) {
            if !self.is_out_or_merge() {
                body.insert(
                    "cursor",
                    doc! { "batchSize": i32::try_from(batch_size).unwrap_or(i32::MAX) },
                );
            }
        }

        Ok(Command::new(Self::NAME, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        let cursor_response: CursorBody = response.body()?;

        Ok(CursorSpecification::new(
            cursor_response.cursor,
            description.server_address.clone(),
            self.options.as_ref().and_then(|opts| opts.batch_size),
        ))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|opts| opts.selection_criteria.as_ref())
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        if self.is_out_or_merge() {
            self.options
                .as_ref()
                .and_then(|opts| opts.write_concern.as_ref())
        } else {
            None
        }
    }

    fn retryability(&self) -> Retryability {
        if self.is_out_or_merge() {
            Retryability::None
        } else {
            Retryability::Read
        }
    }
}
