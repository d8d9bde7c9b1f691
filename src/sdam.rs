mod description;
mod monitor;
pub mod public;
mod server;
mod topology;

pub use self::{description::server::ServerType, public::ServerInfo};
pub(crate) use self::{
    description::{
        server::{ServerDescription, TopologyVersion},
        topology::{server_selection::SelectedServer, TopologyDescription, TopologyType},
    },
    server::Server,
    topology::{HandshakePhase, Topology, TopologyUpdater, TopologyWatcher},
};
