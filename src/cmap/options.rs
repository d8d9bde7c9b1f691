use std::time::Duration;

use crate::client::options::ClientOptions;

/// Contains the options for creating a connection pool.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionPoolOptions {
    /// Connections that have been ready for usage in the pool for longer than `max_idle_time` will
    /// not be used. A zero or absent value means connections are never closed for idleness.
    pub(crate) max_idle_time: Option<Duration>,

    /// The maximum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    pub(crate) max_pool_size: Option<u32>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    pub(crate) min_pool_size: Option<u32>,

    /// The amount of time a thread should block while waiting to check out a connection before
    /// returning an error.
    pub(crate) wait_queue_timeout: Option<Duration>,

    /// Whether to start the pool as "ready" or not.
    #[cfg(test)]
    pub(crate) ready: Option<bool>,

    #[cfg(test)]
    pub(crate) maintenance_frequency: Option<Duration>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_idle_time: options.max_idle_time,
            min_pool_size: options.min_pool_size,
            max_pool_size: options.max_pool_size,
            wait_queue_timeout: options.wait_queue_timeout,
            #[cfg(test)]
            ready: None,
            #[cfg(test)]
            maintenance_frequency: None,
        }
    }
}
