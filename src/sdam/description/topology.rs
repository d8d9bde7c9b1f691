pub(crate) mod server_selection;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    bson::oid::ObjectId,
    client::options::ClientOptions,
    error::Result,
    options::ServerAddress,
    sdam::{
        description::server::{ServerDescription, ServerType},
        public::ServerInfo,
    },
};

/// The oldest server version (3.6) this client can talk to.
const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;

/// The newest wire version (8.0) this client has been written against.
const MAX_SUPPORTED_WIRE_VERSION: i32 = 25;

/// The possible types for a topology.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// A description of the most up-to-date information known about a topology.
#[derive(Debug, Clone)]
pub(crate) struct TopologyDescription {
    /// Whether or not the topology was initialized with a single seed.
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version the driver has seen by a member of the topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen by a member of the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and server with regards to the
    /// respective supported wire versions.
    pub(crate) compatibility_error: Option<String>,

    /// The amount of latency beyond that of the suitable server with the minimum latency that is
    /// acceptable for a read operation.
    pub(crate) local_threshold: Option<Duration>,

    /// The server descriptions of each member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // Since we only use TopologyDescription equality to determine whether to publish a
        // changed description, only the fields that can change during SDAM are compared.
        self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
            && self.topology_type == other.topology_type
            && self.set_name == other.set_name
            && self.max_set_version == other.max_set_version
            && self.max_election_id == other.max_election_id
    }
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address)))
            .collect();

        Self {
            single_seed: options.hosts.len() == 1,
            topology_type,
            set_name: options.repl_set_name.clone(),
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            local_threshold: options.local_threshold,
            servers,
        }
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    /// Update the topology based on the new information about the topology contained by the
    /// ServerDescription.
    pub(crate) fn update(&mut self, mut server_description: ServerDescription) -> Result<()> {
        // Ignore updates from servers not currently in the cluster.
        let Some(existing) = self.servers.get(&server_description.address) else {
            return Ok(());
        };

        // A response older than what has already been observed from the same process is stale.
        if let (Some(current), Some(incoming)) = (
            existing.topology_version(),
            server_description.topology_version(),
        ) {
            if !incoming.is_more_or_equal_to(current) && current.process_id == incoming.process_id
            {
                return Ok(());
            }
        }

        // A server reporting the wrong replica set name is treated as unknown in a single
        // topology.
        if self.topology_type == TopologyType::Single {
            if let Some(ref expected) = self.set_name {
                if server_description.is_available()
                    && server_description.set_name()?.as_ref() != Some(expected)
                {
                    server_description.server_type = ServerType::Unknown;
                }
            }
        }

        // Replace the old info about the server with the new info.
        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        match self.topology_type {
            TopologyType::Single => {}
            TopologyType::Unknown => self.update_unknown_topology(server_description)?,
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary => {
                self.update_replica_set_no_primary_topology(server_description)?
            }
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary_topology(server_description)?;
            }
        }

        self.check_compatibility();

        Ok(())
    }

    /// Check the cluster for a compatibility error, and record the error message if one is found.
    fn check_compatibility(&mut self) {
        self.compatibility_error = None;

        for server in self.servers.values() {
            let (Ok(Some(min)), Ok(Some(max))) =
                (server.min_wire_version(), server.max_wire_version())
            else {
                continue;
            };

            if min > MAX_SUPPORTED_WIRE_VERSION {
                self.compatibility_error = Some(format!(
                    "Server at {} requires wire version {}, but this version of the client only \
                     supports up to {}",
                    server.address, min, MAX_SUPPORTED_WIRE_VERSION,
                ));
            } else if max < MIN_SUPPORTED_WIRE_VERSION {
                self.compatibility_error = Some(format!(
                    "Server at {} reports wire version {}, but this version of the client \
                     requires at least {}",
                    server.address, max, MIN_SUPPORTED_WIRE_VERSION,
                ));
            }
        }
    }

    /// Update the Unknown topology description based on the server description.
    fn update_unknown_topology(&mut self, server_description: ServerDescription) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost | ServerType::LoadBalancer => {}
            ServerType::Standalone => {
                self.update_unknown_with_standalone_server(server_description)
            }
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RsPrimary => {
                self.update_rs_from_primary_server(server_description)?;
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary_server(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the Sharded topology description based on the server description.
    fn update_sharded_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::Mongos => {}
            _ => {
                self.servers.remove(&server_description.address);
            }
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the server description.
    fn update_replica_set_no_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost | ServerType::LoadBalancer => {}
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the server description.
    fn update_replica_set_with_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost | ServerType::LoadBalancer => {
                self.record_primary_state();
            }
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
                self.record_primary_state();
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_with_primary_from_member(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the Unknown topology description based on the Standalone server description.
    fn update_unknown_with_standalone_server(&mut self, server_description: ServerDescription) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&server_description.address);
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the non-primary server
    /// description.
    fn update_rs_without_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts()?);

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the non-primary server
    /// description.
    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name()? || server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        self.record_primary_state();
        Ok(())
    }

    /// Update the replica set topology description based on the RSPrimary server description.
    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        // (electionId, setVersion) tuples are compared in order; a missing value is older than
        // any present one.
        let incoming = (
            server_description.election_id()?,
            server_description.set_version()?,
        );
        let current = (self.max_election_id, self.max_set_version);
        if incoming < current {
            // Stale primary: reset it to unknown.
            self.servers.insert(
                server_description.address.clone(),
                ServerDescription::new(&server_description.address),
            );
            self.record_primary_state();
            return Ok(());
        }
        (self.max_election_id, self.max_set_version) = incoming;

        // Any other server still considered primary is demoted.
        let demoted: Vec<ServerAddress> = self
            .servers
            .values()
            .filter(|server| {
                server.server_type == ServerType::RsPrimary
                    && server.address != server_description.address
            })
            .map(|server| server.address.clone())
            .collect();
        for address in demoted {
            self.servers
                .insert(address.clone(), ServerDescription::new(&address));
        }

        let hosts = server_description.known_hosts()?;
        self.add_new_servers(hosts.iter().cloned());
        let hosts: HashSet<ServerAddress> = hosts.into_iter().collect();
        self.servers.retain(|address, _| hosts.contains(address));

        self.record_primary_state();
        Ok(())
    }

    /// Inspect the topology for a primary server, and update the topology type to
    /// ReplicaSetNoPrimary if none is found.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Create a new ServerDescription for each address and add it to the topology.
    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(&address));
        }
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {set_name}")?;
        }

        if let Some(ref compatibility_error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {compatibility_error}")?;
        }

        if !self.servers.is_empty() {
            let servers: Vec<String> = self
                .servers
                .values()
                .map(|server| ServerInfo::new(server).to_string())
                .collect();
            write!(f, ", Servers: [ {} ]", servers.join(", "))?;
        }

        write!(f, " }}")
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        bson::{doc, from_document, Document},
        hello::HelloCommandResponse,
    };

    fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn description_for(hosts: &[&str]) -> TopologyDescription {
        let options = ClientOptions::builder()
            .hosts(hosts.iter().map(|h| address(h)).collect::<Vec<_>>())
            .build();
        TopologyDescription::new(&options)
    }

    fn hello(host: &str, reply: Document) -> ServerDescription {
        let mut reply = reply;
        reply.insert("minWireVersion", 0);
        reply.insert("maxWireVersion", 21);
        let response: HelloCommandResponse = from_document(reply).unwrap();
        ServerDescription::new_from_hello_reply(
            address(host),
            response,
            Some(Duration::from_millis(1)),
        )
    }

    fn server_type(description: &TopologyDescription, host: &str) -> Option<ServerType> {
        description
            .get_server_description(&address(host))
            .map(|s| s.server_type)
    }

    #[test]
    fn single_seed_standalone() {
        let mut description = description_for(&["a:27017"]);
        description
            .update(hello("a:27017", doc! { "ismaster": true }))
            .unwrap();
        assert_eq!(description.topology_type, TopologyType::Single);
        assert_eq!(server_type(&description, "a"), Some(ServerType::Standalone));
    }

    #[test]
    fn standalone_removed_from_multi_seed() {
        let mut description = description_for(&["a:27017", "b:27017"]);
        description
            .update(hello("a:27017", doc! { "ismaster": true }))
            .unwrap();
        assert_eq!(description.topology_type, TopologyType::Unknown);
        assert_eq!(server_type(&description, "a"), None);
    }

    #[test]
    fn discovers_replica_set_from_primary() {
        let mut description = description_for(&["a:27017"]);
        description
            .update(hello(
                "a:27017",
                doc! {
                    "ismaster": true,
                    "setName": "rs",
                    "hosts": ["a:27017", "b:27017", "c:27017"],
                    "setVersion": 1,
                    "electionId": ObjectId::new(),
                },
            ))
            .unwrap();

        assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
        assert_eq!(description.set_name.as_deref(), Some("rs"));
        assert_eq!(description.servers.len(), 3);
        assert_eq!(server_type(&description, "b"), Some(ServerType::Unknown));
    }

    #[test]
    fn new_primary_demotes_old_one() {
        let mut description = description_for(&["a:27017", "b:27017"]);
        let first = ObjectId::new();
        let second = ObjectId::new();
        let members = vec!["a:27017", "b:27017"];

        description
            .update(hello(
                "a:27017",
                doc! { "ismaster": true, "setName": "rs", "hosts": members.clone(),
                       "setVersion": 1, "electionId": first },
            ))
            .unwrap();
        description
            .update(hello(
                "b:27017",
                doc! { "ismaster": true, "setName": "rs", "hosts": members.clone(),
                       "setVersion": 1, "electionId": second },
            ))
            .unwrap();

        assert_eq!(server_type(&description, "a"), Some(ServerType::Unknown));
        assert_eq!(server_type(&description, "b"), Some(ServerType::RsPrimary));
        assert_eq!(description.max_election_id, Some(second));

        // The old primary reporting its stale election is reset to unknown.
        description
            .update(hello(
                "a:27017",
                doc! { "ismaster": true, "setName": "rs", "hosts": members,
                       "setVersion": 1, "electionId": first },
            ))
            .unwrap();
        assert_eq!(server_type(&description, "a"), Some(ServerType::Unknown));
        assert_eq!(server_type(&description, "b"), Some(ServerType::RsPrimary));
        assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    }

    #[test]
    fn accepted_primary_sets_both_maxima() {
        let mut description = description_for(&["a:27017", "b:27017", "c:27017"]);
        let first = ObjectId::new();
        let second = ObjectId::new();
        let members = vec!["a:27017", "b:27017", "c:27017"];

        description
            .update(hello(
                "a:27017",
                doc! { "ismaster": true, "setName": "rs", "hosts": members.clone(),
                       "setVersion": 2, "electionId": first },
            ))
            .unwrap();
        assert_eq!(description.max_set_version, Some(2));

        description
            .update(hello(
                "b:27017",
                doc! { "ismaster": true, "setName": "rs", "hosts": members.clone(),
                       "electionId": second },
            ))
            .unwrap();
        assert_eq!(server_type(&description, "b"), Some(ServerType::RsPrimary));
        assert_eq!(description.max_election_id, Some(second));
        assert_eq!(description.max_set_version, None);

        // Same election with a set version is newer than the version-less primary.
        description
            .update(hello(
                "c:27017",
                doc! { "ismaster": true, "setName": "rs", "hosts": members,
                       "setVersion": 1, "electionId": second },
            ))
            .unwrap();
        assert_eq!(server_type(&description, "c"), Some(ServerType::RsPrimary));
        assert_eq!(server_type(&description, "b"), Some(ServerType::Unknown));
        assert_eq!(description.max_set_version, Some(1));
    }

    #[test]
    fn primary_removes_unlisted_hosts() {
        let mut description = description_for(&["a:27017", "b:27017"]);
        description
            .update(hello(
                "a:27017",
                doc! { "ismaster": true, "setName": "rs", "hosts": ["a:27017"] },
            ))
            .unwrap();
        assert_eq!(server_type(&description, "b"), None);
        assert_eq!(description.servers.len(), 1);
    }

    #[test]
    fn wrong_set_name_member_removed() {
        let mut description = description_for(&["a:27017", "b:27017"]);
        description
            .update(hello(
                "a:27017",
                doc! { "ismaster": false, "secondary": true, "setName": "rs",
                       "hosts": ["a:27017", "b:27017"] },
            ))
            .unwrap();
        assert_eq!(description.topology_type, TopologyType::ReplicaSetNoPrimary);

        description
            .update(hello(
                "b:27017",
                doc! { "ismaster": false, "secondary": true, "setName": "other" },
            ))
            .unwrap();
        assert_eq!(server_type(&description, "b"), None);
    }

    #[test]
    fn losing_primary_records_no_primary() {
        let mut description = description_for(&["a:27017"]);
        description
            .update(hello(
                "a:27017",
                doc! { "ismaster": true, "setName": "rs", "hosts": ["a:27017", "b:27017"] },
            ))
            .unwrap();
        description
            .update(ServerDescription::new_from_error(
                address("a:27017"),
                crate::error::Error::network_timeout(),
            ))
            .unwrap();
        assert_eq!(description.topology_type, TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn mongos_makes_sharded() {
        let mut description = description_for(&["a:27017", "b:27017"]);
        description
            .update(hello("a:27017", doc! { "ismaster": true, "msg": "isdbgrid" }))
            .unwrap();
        assert_eq!(description.topology_type, TopologyType::Sharded);

        description
            .update(hello("b:27017", doc! { "ismaster": true, "setName": "rs" }))
            .unwrap();
        assert_eq!(server_type(&description, "b"), None);
    }

    #[test]
    fn incompatible_wire_version_recorded() {
        let mut description = description_for(&["a:27017"]);
        let response: HelloCommandResponse =
            from_document(doc! { "ismaster": true, "minWireVersion": 0, "maxWireVersion": 2 })
                .unwrap();
        description
            .update(ServerDescription::new_from_hello_reply(
                address("a:27017"),
                response,
                None,
            ))
            .unwrap();
        assert!(description.compatibility_error().is_some());
    }
}
