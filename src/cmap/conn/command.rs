use serde::de::DeserializeOwned;

use super::wire::Message;
use crate::{
    bson::{Bson, Document},
    bson_util,
    error::{CommandError, Error, ErrorKind, Result},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// A server command with all the information needed to serialize it to a wire message.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
}

impl Command {
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
        }
    }

    /// Attaches `$readPreference` so that mongos and secondaries route the command correctly.
    /// Primary is the server default and is left implicit.
    pub(crate) fn set_read_preference(&mut self, read_pref: &ReadPreference) {
        if *read_pref != ReadPreference::Primary {
            self.body
                .insert("$readPreference", crate::bson::doc! { "mode": read_pref.mode() });
        }
    }

    pub(crate) fn into_message(self, request_id: Option<i32>) -> Message {
        let mut body = self.body;
        body.insert("$db", self.target_db);
        Message::with_body(body, request_id)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CommandResponse {
    pub(crate) source: ServerAddress,
    body: Document,
}

impl CommandResponse {
    pub(crate) fn new(source: ServerAddress, message: Message) -> Self {
        Self {
            source,
            body: message.into_command_document(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_document(source: ServerAddress, body: Document) -> Self {
        Self { source, body }
    }

    /// Returns whether this response indicates a success or not (i.e. if "ok: 1")
    pub(crate) fn is_success(&self) -> bool {
        match self.body.get("ok") {
            Some(b) => bson_util::get_int(b) == Some(1),
            None => false,
        }
    }

    /// Returns a result indicating whether this response corresponds to a command failure. The
    /// returned error carries the server's `errorLabels`.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        let command_error: CommandError =
            crate::bson::from_bson(Bson::Document(self.body.clone())).map_err(|_| {
                Error::invalid_response(format!("invalid server response: {}", self.body))
            })?;
        let labels: Option<Vec<String>> = self.body.get_array("errorLabels").ok().map(|labels| {
            labels
                .iter()
                .filter_map(|label| label.as_str().map(String::from))
                .collect()
        });
        Err(Error::new(ErrorKind::Command(command_error), labels))
    }

    /// Deserialize the body of the response.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        crate::bson::from_bson(Bson::Document(self.body.clone()))
            .map_err(|e| Error::invalid_response(e.to_string()))
    }

    pub(crate) fn raw_body(&self) -> &Document {
        &self.body
    }

    pub(crate) fn raw_body_mut(&mut self) -> &mut Document {
        &mut self.body
    }

    pub(crate) fn into_body(self) -> Document {
        self.body
    }
}
