use crate::{
    bson::Document,
    bson_util,
    cmap::{Command, CommandResponse, StreamDescription},
    error::{Error, Result},
    operation::OperationWithDefaults,
    selection_criteria::SelectionCriteria,
};

/// Runs an arbitrary command document against a database.
#[derive(Debug, Clone)]
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    pub(crate) fn new(
        db: String,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::invalid_argument("an empty document cannot be a command"));
        }
        Ok(Self {
            db,
            command,
            selection_criteria,
        })
    }

    fn command_name(&self) -> Option<&str> {
        bson_util::first_key(&self.command)
    }
}

impl OperationWithDefaults for RunCommand {
    type O = Document;

    // Since we can't actually specify a string statically here, we just put a descriptive string
    // that should fail loudly if accidentally passed to the server.
    const NAME: &'static str = "$genericRunCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let command_name = self
            .command_name()
            .ok_or_else(|| Error::invalid_argument("an empty document cannot be a command"))?;

        Ok(Command::new(command_name, &self.db, self.command.clone()))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(response.into_body())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn name(&self) -> &str {
        self.command_name().unwrap_or(Self::NAME)
    }
}
