use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, oid::ObjectId, Document},
    cmap::{Command, Connection},
    error::Result,
    options::ServerAddress,
    sdam::{ServerType, TopologyVersion},
};

/// The legacy version of the `hello` command which was deprecated in 5.0.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// Construct a hello or legacy hello command, depending on the circumstances.
///
/// If the server indicated `helloOk: true`, then `hello` will be used. Otherwise, legacy hello
/// will be used, and if it's unknown whether the server supports hello, the command will also
/// contain `helloOk: true`.
pub(crate) fn hello_command(hello_ok: Option<bool>, app_name: Option<&str>) -> Command {
    let (mut body, command_name) = if matches!(hello_ok, Some(true)) {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    if let Some(app_name) = app_name {
        body.insert(
            "client",
            doc! {
                "application": { "name": app_name },
                "driver": { "name": "mongodb-csfle", "version": env!("CARGO_PKG_VERSION") },
            },
        );
    }

    Command::new(command_name, "admin", body)
}

/// Execute a hello or legacy hello command.
pub(crate) async fn run_hello(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    let response = conn.send_command(command).await?;
    response.validate()?;
    let server_address = response.source.clone();
    let command_response: HelloCommandResponse = response.body()?;
    Ok(HelloReply {
        server_address,
        command_response,
        raw_command_response: response.into_body(),
    })
}

#[derive(Debug, Clone)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
}

/// The response to a `hello` command.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    #[serde(rename = "ismaster")]
    /// Legacy name for `is_writable_primary` field.
    pub is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead
    /// of the legacy hello command.
    pub hello_ok: Option<bool>,

    pub hosts: Option<Vec<String>>,

    pub passives: Option<Vec<String>>,

    pub arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub me: Option<String>,

    pub set_version: Option<i32>,

    pub set_name: Option<String>,

    pub hidden: Option<bool>,

    pub secondary: Option<bool>,

    pub arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    pub min_wire_version: Option<i32>,

    pub max_wire_version: Option<i32>,

    /// A unique identifier for each election.
    pub election_id: Option<ObjectId>,

    /// The address of current primary member of the replica set.
    pub primary: Option<String>,

    /// The maximum permitted size of a BSON object in bytes.
    #[serde(default = "default_max_bson_object_size")]
    pub max_bson_object_size: i64,

    /// The maximum number of write operations permitted in a write batch.
    pub max_write_batch_size: Option<i64>,

    pub topology_version: Option<TopologyVersion>,

    /// The maximum permitted size of a BSON wire protocol message.
    #[serde(default = "default_max_message_size_bytes")]
    pub max_message_size_bytes: i32,

    /// Set by mongocryptd in its hello reply.
    pub iscryptd: Option<bool>,
}

pub(crate) const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;

fn default_max_bson_object_size() -> i64 {
    DEFAULT_MAX_BSON_OBJECT_SIZE
}

fn default_max_message_size_bytes() -> i32 {
    48_000_000
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bson::from_document;

    #[test]
    fn legacy_hello_until_hello_ok() {
        let cmd = hello_command(None, None);
        assert_eq!(cmd.name, "isMaster");
        assert_eq!(cmd.body.get_bool("helloOk"), Ok(true));

        let cmd = hello_command(Some(false), None);
        assert_eq!(cmd.name, "isMaster");
        assert!(!cmd.body.contains_key("helloOk"));

        let cmd = hello_command(Some(true), Some("app"));
        assert_eq!(cmd.name, "hello");
        assert_eq!(
            cmd.body
                .get_document("client")
                .and_then(|c| c.get_document("application"))
                .and_then(|a| a.get_str("name")),
            Ok("app")
        );
    }

    #[test]
    fn server_types() {
        let parse = |d: Document| from_document::<HelloCommandResponse>(d).map(|r| r.server_type());
        assert_eq!(parse(doc! { "ok": 1, "msg": "isdbgrid" }).ok(), Some(ServerType::Mongos));
        assert_eq!(
            parse(doc! { "ismaster": true, "setName": "rs" }).ok(),
            Some(ServerType::RsPrimary)
        );
        assert_eq!(
            parse(doc! { "secondary": true, "setName": "rs", "hidden": true }).ok(),
            Some(ServerType::RsOther)
        );
        assert_eq!(
            parse(doc! { "secondary": true, "setName": "rs" }).ok(),
            Some(ServerType::RsSecondary)
        );
        assert_eq!(
            parse(doc! { "arbiterOnly": true, "setName": "rs" }).ok(),
            Some(ServerType::RsArbiter)
        );
        assert_eq!(
            parse(doc! { "isreplicaset": true }).ok(),
            Some(ServerType::RsGhost)
        );
        assert_eq!(
            parse(doc! { "ismaster": true }).ok(),
            Some(ServerType::Standalone)
        );
    }
}
