use crate::{
    bson::{doc, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    error::Result,
    operation::{CursorBody, CursorSpecification, OperationWithDefaults, Retryability},
};

#[derive(Debug)]
pub(crate) struct ListCollections {
    db: String,
    filter: Option<Document>,
    name_only: bool,
}

impl ListCollections {
    pub(crate) fn new(db: String, filter: Option<Document>, name_only: bool) -> Self {
        Self {
            db,
            filter,
            name_only,
        }
    }
}

impl OperationWithDefaults for ListCollections {
    type O = CursorSpecification;

    const NAME: &'static str = "listCollections";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
            "cursor": {},
        };

        let mut name_only = self.name_only;
        if let Some(ref filter) = self.filter {
            body.insert("filter", filter.clone());

            // nameOnly replies lack the fields such a filter would need.
            if filter.keys().any(|k| k != "name") {
                name_only = false;
            }
        }
        body.insert("nameOnly", name_only);

        Ok(Command::new(Self::NAME, &self.db, body))
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
            None,
        ))
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
