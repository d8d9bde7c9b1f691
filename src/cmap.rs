#[cfg(test)]
mod test;

pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod status;
mod worker;

use std::time::Duration;

pub use self::conn::ConnectionInfo;
pub(crate) use self::{
    conn::{Command, CommandResponse, Connection, StreamDescription},
    establish::ConnectionEstablisher,
    status::PoolGenerationSubscriber,
};
use self::{
    connection_requester::ConnectionRequester,
    manager::PoolManager,
    options::ConnectionPoolOptions,
    worker::ConnectionPoolWorker,
};
use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::TopologyUpdater,
    trace::CONNECTION_TRACING_EVENT_TARGET,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A pool of connections implementing the CMAP spec.
/// This type is actually a handle to task that manages the connections and is cheap to clone and
/// pass around.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    generation_subscriber: PoolGenerationSubscriber,
    wait_queue_timeout: Option<Duration>,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        connection_establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let wait_queue_timeout = options.as_ref().and_then(|opts| opts.wait_queue_timeout);
        let (manager, connection_requester, generation_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            connection_establisher,
            server_updater,
            options,
        );

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            wait_queue_timeout,
        }
    }

    /// Checks out a connection from the pool. This method will yield until this thread is at the
    /// front of the wait queue, and then will block again if no available connections are in the
    /// pool and the total number of connections is not less than the max pool size.
    pub(crate) async fn check_out(&self) -> Result<Connection> {
        tracing::trace!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            server = %self.address,
            "Connection checkout started",
        );

        let result = self.connection_requester.request(self.wait_queue_timeout).await;

        match result {
            Ok(ref conn) => tracing::trace!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                server = %self.address,
                connection_id = conn.id,
                "Connection checked out",
            ),
            Err(ref e) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                server = %self.address,
                error = %e,
                "Connection checkout failed",
            ),
        }

        result
    }

    /// Increments the generation of the pool. Rather than eagerly removing stale connections from
    /// the pool, they are left for the background thread to clean up.
    pub(crate) fn clear(&self, cause: Error) {
        self.manager.clear(cause)
    }

    /// Mark the pool as "ready", allowing connections to be created and checked out.
    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().await;
    }

    /// Close the pool. Pending and future check outs fail with `PoolClosed`.
    pub(crate) async fn close(&self) {
        self.manager.close().await;
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation_subscriber.generation()
    }

    #[cfg(test)]
    pub(crate) fn generation_subscriber(&self) -> PoolGenerationSubscriber {
        self.generation_subscriber.clone()
    }
}
