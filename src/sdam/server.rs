use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    client::options::ClientOptions,
    cmap::{options::ConnectionPoolOptions, ConnectionEstablisher, ConnectionPool},
    options::ServerAddress,
    sdam::TopologyUpdater,
};

/// A known server and the connection pool that talks to it.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    pub(crate) pool: ConnectionPool,

    in_flight: AtomicU32,
}

impl Server {
    pub(crate) fn new(
        address: ServerAddress,
        options: &ClientOptions,
        connection_establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
    ) -> Arc<Server> {
        let pool_options = ConnectionPoolOptions::from_client_options(options);
        let pool = ConnectionPool::new(
            address.clone(),
            connection_establisher,
            topology_updater,
            Some(pool_options),
        );
        Arc::new(Self {
            address,
            pool,
            in_flight: AtomicU32::new(0),
        })
    }

    /// The number of operations currently running against this server. Server selection prefers
    /// the less busy of two candidates.
    pub(crate) fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Counts an operation against this server until the returned guard is dropped.
    pub(crate) fn begin_operation(self: &Arc<Self>) -> InFlightOperation {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightOperation {
            server: self.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct InFlightOperation {
    server: Arc<Server>,
}

impl Deref for InFlightOperation {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.server
    }
}

impl Drop for InFlightOperation {
    fn drop(&mut self) {
        self.server.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
