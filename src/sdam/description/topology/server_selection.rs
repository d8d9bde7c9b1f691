use std::{collections::HashMap, ops::Deref, sync::Arc, time::Duration};

use rand::seq::IndexedRandom;

use super::{TopologyDescription, TopologyType};
use crate::{
    client::options::DEFAULT_LOCAL_THRESHOLD,
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::{
        description::server::{ServerDescription, ServerType},
        public::ServerInfo,
        server::InFlightOperation,
        Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// A selected server, counted as busy for as long as the selection is held.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    operation: InFlightOperation,

    /// The description the server was selected from.
    description: ServerDescription,
}

impl SelectedServer {
    fn new(server: &Arc<Server>, description: ServerDescription) -> Self {
        Self {
            operation: server.begin_operation(),
            description,
        }
    }

    pub(crate) fn description(&self) -> &ServerDescription {
        &self.description
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.operation
    }
}

/// Attempt to select a server, returning None if no server could be selected
/// that matched the provided criteria.
pub(crate) fn attempt_to_select_server(
    criteria: &SelectionCriteria,
    topology_description: &TopologyDescription,
    servers: &HashMap<ServerAddress, Arc<Server>>,
) -> Result<Option<SelectedServer>> {
    let in_window = topology_description.suitable_servers_in_latency_window(criteria)?;
    let in_window_servers = in_window
        .into_iter()
        .flat_map(|desc| servers.get(&desc.address).map(|server| (desc, server)))
        .collect();
    Ok(select_server_in_latency_window(in_window_servers)
        .map(|(description, server)| SelectedServer::new(server, description.clone())))
}

/// Choose a server from several suitable choices within the latency window: of two random
/// candidates, the one with fewer in-flight operations wins.
fn select_server_in_latency_window<'a>(
    in_window: Vec<(&'a ServerDescription, &'a Arc<Server>)>,
) -> Option<(&'a ServerDescription, &'a Arc<Server>)> {
    if in_window.len() <= 1 {
        return in_window.first().copied();
    }

    in_window
        .choose_multiple(&mut rand::rng(), 2)
        .min_by_key(|(_, server)| server.in_flight())
        .copied()
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {criteria:?}. Topology: {self}"
            )
        } else {
            format!("Server selection timeout: No available servers. Topology: {self}")
        }
    }

    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::ServerSelection {
                message: message.to_string(),
            }
            .into());
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref),
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|s| {
                    // If we're direct-connected or connected to a standalone, ignore whether the
                    // single server in the topology is data-bearing.
                    (self.topology_type == TopologyType::Single || s.server_type.is_data_bearing())
                        && filter(&ServerInfo::new(s))
                })
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        Ok(suitable_servers)
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    fn suitable_servers(&self, read_preference: &ReadPreference) -> Vec<&ServerDescription> {
        match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single => self
                .servers
                .values()
                .filter(|server| server.is_available())
                .collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)
            }
        }
    }

    fn retain_servers_within_latency_window(&self, suitable_servers: &mut Vec<&ServerDescription>) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .min();

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let Some(max_rtt_within_window) = shortest_average_rtt
            .map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX))
        else {
            return;
        };

        suitable_servers.retain(move |server_desc| {
            server_desc
                .average_round_trip_time
                .is_none_or(|server_rtt| server_rtt <= max_rtt_within_window)
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Vec<&ServerDescription> {
        match read_preference {
            ReadPreference::PrimaryPreferred => {
                let primary = self.replica_set_members_matching(&ReadPreference::Primary);
                if primary.is_empty() {
                    self.replica_set_members_matching(&ReadPreference::Secondary)
                } else {
                    primary
                }
            }
            ReadPreference::SecondaryPreferred => {
                let secondaries = self.replica_set_members_matching(&ReadPreference::Secondary);
                if secondaries.is_empty() {
                    self.replica_set_members_matching(&ReadPreference::Primary)
                } else {
                    secondaries
                }
            }
            other => self.replica_set_members_matching(other),
        }
    }

    fn replica_set_members_matching(
        &self,
        read_preference: &ReadPreference,
    ) -> Vec<&ServerDescription> {
        self.servers
            .values()
            .filter(|server| read_preference.matches_replica_set_member(server.server_type))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        bson::{doc, from_document},
        client::options::ClientOptions,
        hello::HelloCommandResponse,
    };

    fn replica_set(members: &[(&str, ServerType, u64)]) -> TopologyDescription {
        let hosts: Vec<ServerAddress> = members
            .iter()
            .map(|(host, ..)| ServerAddress::parse(host).unwrap())
            .collect();
        let mut description = TopologyDescription::new(
            &ClientOptions::builder()
                .hosts(hosts)
                .repl_set_name("rs".to_string())
                .build(),
        );

        for (host, server_type, rtt_ms) in members {
            let reply = match server_type {
                ServerType::RsPrimary => doc! { "ismaster": true },
                ServerType::RsSecondary => doc! { "ismaster": false, "secondary": true },
                _ => doc! { "ismaster": false, "arbiterOnly": true },
            };
            let mut reply = reply;
            reply.insert("setName", "rs");
            reply.insert(
                "hosts",
                members.iter().map(|(h, ..)| h.to_string()).collect::<Vec<_>>(),
            );
            let response: HelloCommandResponse = from_document(reply).unwrap();
            description
                .update(ServerDescription::new_from_hello_reply(
                    ServerAddress::parse(host).unwrap(),
                    response,
                    Some(Duration::from_millis(*rtt_ms)),
                ))
                .unwrap();
        }
        description
    }

    fn selected_hosts(
        description: &TopologyDescription,
        read_preference: ReadPreference,
    ) -> Vec<String> {
        let criteria = SelectionCriteria::ReadPreference(read_preference);
        let mut hosts: Vec<String> = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap()
            .into_iter()
            .map(|s| s.address.to_string())
            .collect();
        hosts.sort();
        hosts
    }

    #[test]
    fn read_preference_modes() {
        let description = replica_set(&[
            ("a:27017", ServerType::RsPrimary, 5),
            ("b:27017", ServerType::RsSecondary, 5),
            ("c:27017", ServerType::RsArbiter, 5),
        ]);

        assert_eq!(
            selected_hosts(&description, ReadPreference::Primary),
            vec!["a:27017"]
        );
        assert_eq!(
            selected_hosts(&description, ReadPreference::Secondary),
            vec!["b:27017"]
        );
        assert_eq!(
            selected_hosts(&description, ReadPreference::PrimaryPreferred),
            vec!["a:27017"]
        );
        assert_eq!(
            selected_hosts(&description, ReadPreference::SecondaryPreferred),
            vec!["b:27017"]
        );
        assert_eq!(
            selected_hosts(&description, ReadPreference::Nearest),
            vec!["a:27017", "b:27017"]
        );
    }

    #[test]
    fn preferred_modes_fall_back() {
        let no_secondaries = replica_set(&[("a:27017", ServerType::RsPrimary, 5)]);
        assert_eq!(
            selected_hosts(&no_secondaries, ReadPreference::SecondaryPreferred),
            vec!["a:27017"]
        );
        assert!(selected_hosts(&no_secondaries, ReadPreference::Secondary).is_empty());

        let no_primary = replica_set(&[
            ("a:27017", ServerType::RsSecondary, 5),
            ("b:27017", ServerType::RsSecondary, 5),
        ]);
        assert_eq!(
            selected_hosts(&no_primary, ReadPreference::PrimaryPreferred),
            vec!["a:27017", "b:27017"]
        );
        assert!(selected_hosts(&no_primary, ReadPreference::Primary).is_empty());
    }

    #[test]
    fn latency_window_excludes_slow_servers() {
        let description = replica_set(&[
            ("a:27017", ServerType::RsPrimary, 5),
            ("b:27017", ServerType::RsSecondary, 10),
            ("c:27017", ServerType::RsSecondary, 100),
        ]);
        assert_eq!(
            selected_hosts(&description, ReadPreference::Nearest),
            vec!["a:27017", "b:27017"]
        );
    }

    #[test]
    fn predicate_filters_servers() {
        let description = replica_set(&[
            ("a:27017", ServerType::RsPrimary, 5),
            ("b:27017", ServerType::RsSecondary, 5),
        ]);
        let target = ServerAddress::parse("b:27017").unwrap();
        let criteria = SelectionCriteria::from_address(target.clone());
        let servers = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].address, target);
    }
}
