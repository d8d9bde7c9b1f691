use std::time::{Duration, Instant};

use super::{
    topology::{TopologyCheckRequestReceiver, TopologyUpdater, TopologyWatcher},
    ServerDescription,
};
use crate::{
    client::options::{ClientOptions, DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    cmap::{Connection, ConnectionEstablisher},
    error::{Error, Result},
    hello::{hello_command, run_hello, HelloReply},
    options::ServerAddress,
    runtime,
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
};

/// Weight given to the newest sample in the round trip time moving average.
const RTT_ALPHA: f64 = 0.2;

/// Exponentially-weighted moving average of a server's hello round trip times.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RttInfo {
    average: Option<Duration>,
}

impl RttInfo {
    pub(crate) fn add_sample(&mut self, sample: Duration) {
        self.average = Some(match self.average {
            Some(old) => old.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA),
            // The first sample is used as-is.
            None => sample,
        });
    }

    pub(crate) fn average(&self) -> Option<Duration> {
        self.average
    }

    fn reset(&mut self) {
        self.average = None;
    }
}

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    check_requests: TopologyCheckRequestReceiver,
    rtt: RttInfo,
    heartbeat_frequency: Duration,
    min_heartbeat_frequency: Duration,
}

impl Monitor {
    /// Spawn a monitor for the server at `address`. The monitor exits once the server is
    /// removed from the topology or the topology is shut down.
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        check_requests: TopologyCheckRequestReceiver,
        establisher: ConnectionEstablisher,
        options: &ClientOptions,
    ) {
        #[cfg(test)]
        let min_heartbeat_frequency = options
            .test_options
            .as_ref()
            .and_then(|test_options| test_options.heartbeat_freq)
            .unwrap_or(MIN_HEARTBEAT_FREQUENCY);
        #[cfg(not(test))]
        let min_heartbeat_frequency = MIN_HEARTBEAT_FREQUENCY;

        let monitor = Self {
            address,
            connection: None,
            establisher,
            topology_updater,
            topology_watcher,
            check_requests,
            rtt: RttInfo::default(),
            heartbeat_frequency: options
                .heartbeat_freq
                .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
            min_heartbeat_frequency,
        };
        runtime::execute(monitor.execute());
    }

    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive()
            && self
                .topology_watcher
                .server_description(&self.address)
                .is_some()
    }

    async fn execute(mut self) {
        while self.is_alive() {
            self.check_server().await;
            self.check_requests.clear_check_requests();

            let min_frequency = self.min_heartbeat_frequency;
            let remaining = self.heartbeat_frequency.saturating_sub(min_frequency);
            let watcher = &mut self.topology_watcher;
            let check_requests = &mut self.check_requests;
            tokio::select! {
                _ = watcher.wait_until_closed() => break,
                _ = async {
                    runtime::delay_for(min_frequency).await;
                    check_requests.wait_for_check_request(remaining).await;
                } => {}
            }
        }

        tracing::trace!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            server = %self.address,
            "Server monitor stopped",
        );
    }

    /// Checks the the server by running a hello command. If an I/O error occurs on a
    /// server that was previously available, the check is retried once on a new connection.
    ///
    /// Returns true if the topology has changed and false otherwise.
    async fn check_server(&mut self) -> bool {
        let mut retried = false;
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previous_description = self.topology_watcher.server_description(&self.address);
                if e.is_network_error()
                    && previous_description.is_some_and(|sd| sd.is_available())
                {
                    self.handle_error(e).await;
                    retried = true;
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                tracing::trace!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    server = %self.address,
                    rtt = ?self.rtt.average(),
                    "Server heartbeat succeeded",
                );
                let server_description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply.command_response,
                    self.rtt.average(),
                );
                self.topology_updater.update(server_description).await
            }
            Err(e) => self.handle_error(e).await || retried,
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                let hello_ok = conn
                    .stream_description()
                    .ok()
                    .map(|description| description.hello_ok);
                run_hello(conn, hello_command(hello_ok, None)).await
            }
            None => self
                .establisher
                .establish_monitoring_connection(self.address.clone())
                .await
                .map(|(connection, reply)| {
                    self.connection = Some(connection);
                    reply
                }),
        };

        match result {
            Ok(_) => self.rtt.add_sample(start.elapsed()),
            Err(_) => {
                self.connection.take();
            }
        }

        result
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            server = %self.address,
            %error,
            "Server heartbeat failed",
        );
        self.rtt.reset();
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use approx::assert_relative_eq;

    use super::RttInfo;

    #[test]
    fn first_sample_taken_verbatim() {
        let mut rtt = RttInfo::default();
        assert_eq!(rtt.average(), None);
        rtt.add_sample(Duration::from_millis(100));
        assert_eq!(rtt.average(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn moving_average_weights_new_samples() {
        let mut rtt = RttInfo::default();
        rtt.add_sample(Duration::from_millis(100));
        rtt.add_sample(Duration::from_millis(10));
        assert_relative_eq!(
            rtt.average().unwrap().as_secs_f64(),
            0.082,
            max_relative = 1e-6
        );

        rtt.add_sample(Duration::from_millis(10));
        assert_relative_eq!(
            rtt.average().unwrap().as_secs_f64(),
            0.0676,
            max_relative = 1e-6
        );
    }

    #[test]
    fn reset_forgets_history() {
        let mut rtt = RttInfo::default();
        rtt.add_sample(Duration::from_millis(50));
        rtt.reset();
        rtt.add_sample(Duration::from_millis(5));
        assert_eq!(rtt.average(), Some(Duration::from_millis(5)));
    }
}
