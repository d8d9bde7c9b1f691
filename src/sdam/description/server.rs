use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{oid::ObjectId, DateTime},
    cmap::StreamDescription,
    error::{Error, Result},
    hello::HelloCommandResponse,
    options::ServerAddress,
};

/// The possible types for a server.
#[derive(
    Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A load-balancing proxy between the client and the servers.
    LoadBalancer,

    /// A server that the client can't communicate with.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// Struct modeling the `topologyVersion` field included in the server's hello and legacy hello
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TopologyVersion {
    pub(crate) process_id: ObjectId,
    pub(crate) counter: i64,
}

impl TopologyVersion {
    /// Whether this version is from the same process and at least as recent as `other`.
    pub(crate) fn is_more_or_equal_to(&self, other: TopologyVersion) -> bool {
        self.process_id == other.process_id && self.counter >= other.counter
    }
}

/// A description of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
pub(crate) struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The average duration of this server's hello calls.
    pub(crate) average_round_trip_time: Option<Duration>,

    // The SDAM spec indicates that a ServerDescription needs to contain an error message if an
    // error occurred when trying to send a hello for the server's heartbeat. Additionally,
    // we need to be able to create a server description that doesn't contain either a hello
    // reply or an error, so we use a `Result<Option<...>>`.
    pub(crate) reply: Result<Option<HelloCommandResponse>>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => self_reply == other_reply,
            (Err(self_err), Err(other_err)) => self_err.to_string() == other_err.to_string(),
            _ => false,
        }
    }
}

impl ServerDescription {
    /// A description of a server that has not been checked yet.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: address.clone(),
            server_type: Default::default(),
            last_update_time: None,
            average_round_trip_time: None,
            reply: Ok(None),
        }
    }

    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloCommandResponse,
        average_rtt: Option<Duration>,
    ) -> Self {
        let server_type = reply.server_type();

        // Normalize all instances of hostnames to lowercase.
        for list in [&mut reply.hosts, &mut reply.passives, &mut reply.arbiters] {
            if let Some(hosts) = list.as_mut() {
                for host in hosts.iter_mut() {
                    *host = host.to_lowercase();
                }
            }
        }
        if let Some(me) = reply.me.as_mut() {
            *me = me.to_lowercase();
        }

        Self {
            address,
            server_type,
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: average_rtt,
            reply: Ok(Some(reply)),
        }
    }

    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: None,
            reply: Err(error),
        }
    }

    /// Whether this server is "available" as per the definition in the server selection spec.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    fn command_response(&self) -> Result<Option<&HelloCommandResponse>> {
        match self.reply {
            Ok(ref reply) => Ok(reply.as_ref()),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        Ok(self.command_response()?.and_then(|r| r.set_name.clone()))
    }

    /// Every member address this server reports (hosts, passives and arbiters).
    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let Some(response) = self.command_response()? else {
            return Ok(Vec::new());
        };

        [&response.hosts, &response.passives, &response.arbiters]
            .into_iter()
            .flatten()
            .flatten()
            .map(ServerAddress::parse)
            .collect()
    }

    /// Whether the `me` field of the reply disagrees with the address used to reach the server.
    pub(crate) fn invalid_me(&self) -> Result<bool> {
        Ok(match self.command_response()?.and_then(|r| r.me.as_ref()) {
            Some(me) => ServerAddress::parse(me)? != self.address,
            None => false,
        })
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        Ok(self.command_response()?.and_then(|r| r.set_version))
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        Ok(self.command_response()?.and_then(|r| r.election_id))
    }

    pub(crate) fn min_wire_version(&self) -> Result<Option<i32>> {
        Ok(self.command_response()?.and_then(|r| r.min_wire_version))
    }

    pub(crate) fn max_bson_object_size(&self) -> Option<i64> {
        self.command_response()
            .ok()
            .flatten()
            .map(|r| r.max_bson_object_size)
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>> {
        Ok(self.command_response()?.and_then(|r| r.max_wire_version))
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(Some(ref reply)) => reply.topology_version,
            Ok(None) => None,
            Err(ref e) => e.topology_version(),
        }
    }

    pub(crate) fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    /// The wire limits an operation routed to this server must respect.
    pub(crate) fn stream_description(&self) -> Result<StreamDescription> {
        match self.command_response()? {
            Some(response) => Ok(StreamDescription::from_command_response(
                self.address.clone(),
                response,
            )),
            None => Err(Error::internal(format!(
                "server {} has not been checked yet",
                self.address
            ))),
        }
    }
}
