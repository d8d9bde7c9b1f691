use crate::{
    bson::doc,
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, Result},
    operation::{append_write_concern, OperationWithDefaults, WriteConcernOnlyBody},
    Namespace,
};

#[derive(Debug)]
pub(crate) struct DropCollection {
    ns: Namespace,
    write_concern: Option<WriteConcern>,
}

impl DropCollection {
    pub(crate) fn new(ns: Namespace, write_concern: Option<WriteConcern>) -> Self {
        Self {
            ns,
            write_concern: write_concern.filter(|wc| !wc.is_empty()),
        }
    }
}

impl OperationWithDefaults for DropCollection {
    type O = ();

    const NAME: &'static str = "drop";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };

        append_write_concern(&mut body, self.write_concern.as_ref())?;

        Ok(Command::new(Self::NAME, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: WriteConcernOnlyBody = response.body()?;
        response.validate()
    }

    fn handle_error(&self, error: Error) -> Result<Self::O> {
        // Dropping a collection that does not exist is not an error.
        if error.is_ns_not_found() {
            Ok(())
        } else {
            Err(error)
        }
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }
}
