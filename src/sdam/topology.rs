use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{
    broadcast,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch::{self, Ref},
};

use super::{
    description::topology::server_selection::{attempt_to_select_server, SelectedServer},
    monitor::Monitor,
    Server,
    ServerDescription,
    ServerType,
    TopologyDescription,
    TopologyType,
};
use crate::{
    client::options::{ClientOptions, DEFAULT_SERVER_SELECTION_TIMEOUT},
    cmap::{Connection, ConnectionEstablisher},
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    selection_criteria::SelectionCriteria,
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
};

/// A handle to the task that owns the topology description. The task exits once
/// [`Topology::shutdown`] completes or every `Topology` handle has been dropped.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    update_requester: UpdateRequester,
    server_selection_timeout: Duration,
    _worker_handle: WorkerHandle,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Topology> {
        let establisher = ConnectionEstablisher::new(&options)?;
        let description = TopologyDescription::new(&options);
        let update_requester = UpdateRequester::new();
        let (updater, update_receiver) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();

        let servers = description
            .server_addresses()
            .map(|address| {
                (
                    address.clone(),
                    Server::new(
                        address.clone(),
                        &options,
                        establisher.clone(),
                        updater.clone(),
                    ),
                )
            })
            .collect();

        let state = TopologyState {
            description,
            servers,
        };
        let addresses: Vec<ServerAddress> = state.servers.keys().cloned().collect();
        let (watcher, broadcaster) = TopologyWatcher::channel(state);

        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            hosts = ?options.hosts,
            "Starting topology monitoring",
        );

        for address in addresses {
            Monitor::start(
                address,
                updater.clone(),
                watcher.clone(),
                update_requester.subscribe(),
                establisher.clone(),
                &options,
            );
        }

        let server_selection_timeout = options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);

        let worker = TopologyWorker {
            update_receiver,
            broadcaster,
            handle_listener,
            options,
            establisher,
            topology_watcher: watcher.clone(),
            topology_updater: updater.clone(),
            update_requester: update_requester.clone(),
        };
        worker.start();

        Ok(Topology {
            watcher,
            updater,
            update_requester,
            server_selection_timeout,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn watcher(&self) -> TopologyWatcher {
        self.watcher.clone()
    }

    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    /// Asks every monitor to check its server immediately.
    pub(crate) fn request_update(&self) {
        self.update_requester.request()
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Select a server matching `criteria`, waiting for the topology to change until the server
    /// selection timeout elapses.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<SelectedServer> {
        let mut watcher = self.watcher.clone();
        let start = Instant::now();

        loop {
            let state = watcher.observe_latest();
            if let Some(server) =
                attempt_to_select_server(criteria, &state.description, &state.servers)?
            {
                tracing::trace!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    server = %server.address,
                    ?criteria,
                    "Server selection succeeded",
                );
                return Ok(server);
            }

            self.request_update();

            let remaining = self
                .server_selection_timeout
                .checked_sub(start.elapsed())
                .unwrap_or_default();
            if remaining.is_zero() || !watcher.wait_for_update(remaining).await {
                if !watcher.is_alive() {
                    return Err(ErrorKind::Shutdown.into());
                }
                let message = watcher
                    .borrow_latest()
                    .description
                    .server_selection_timeout_error_message(criteria);
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    ?criteria,
                    error = %message,
                    "Server selection failed",
                );
                return Err(ErrorKind::ServerSelection { message }.into());
            }
        }
    }

    /// Close every connection pool and stop the monitors.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.watcher.borrow_latest().description.topology_type
    }

    #[cfg(test)]
    pub(crate) fn description(&self) -> TopologyDescription {
        self.watcher.borrow_latest().description.clone()
    }

    #[cfg(test)]
    pub(crate) fn servers(&self) -> HashMap<ServerAddress, Arc<Server>> {
        self.watcher.borrow_latest().servers.clone()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

#[derive(Debug)]
enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    Shutdown,
}

/// Owns the topology description. Every change to it is made by this task and published to the
/// watchers.
struct TopologyWorker {
    update_receiver: TopologyUpdateReceiver,
    broadcaster: TopologyBroadcaster,
    handle_listener: WorkerHandleListener,
    options: ClientOptions,
    establisher: ConnectionEstablisher,

    topology_watcher: TopologyWatcher,
    topology_updater: TopologyUpdater,
    update_requester: UpdateRequester,
}

impl TopologyWorker {
    fn start(mut self) {
        runtime::execute(async move {
            loop {
                let update = tokio::select! {
                    Some(update) = self.update_receiver.recv() => update,
                    _ = self.handle_listener.wait_for_all_handle_drops() => {
                        self.close_servers().await;
                        break;
                    }
                };

                let (update, ack) = update.into_parts();
                let changed = match update {
                    UpdateMessage::ServerUpdate(sd) => self.update_server(*sd).await,
                    UpdateMessage::MonitorError { address, error } => {
                        self.handle_monitor_error(address, error).await
                    }
                    UpdateMessage::ApplicationError {
                        address,
                        error,
                        phase,
                    } => self.handle_application_error(address, error, phase).await,
                    UpdateMessage::Shutdown => {
                        self.close_servers().await;
                        ack.acknowledge(true);
                        break;
                    }
                };
                ack.acknowledge(changed);
            }

            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                "Topology monitoring stopped",
            );
        });
    }

    async fn close_servers(&mut self) {
        let mut state = self.broadcaster.clone_latest();
        for server in state.servers.values() {
            server.pool.close().await;
        }
        state.servers.clear();
        self.broadcaster.publish_new_state(state);
    }

    /// Start monitors and pools for new members and drop the ones no longer in the topology.
    fn sync_hosts(&self, state: &mut TopologyState, hosts: HashSet<ServerAddress>) {
        state.servers.retain(|address, server| {
            let keep = hosts.contains(address);
            if !keep {
                let pool = server.pool.clone();
                runtime::execute(async move { pool.close().await });
            }
            keep
        });

        for address in hosts {
            if state.servers.contains_key(&address) {
                continue;
            }
            let server = Server::new(
                address.clone(),
                &self.options,
                self.establisher.clone(),
                self.topology_updater.clone(),
            );
            state.servers.insert(address.clone(), server);

            Monitor::start(
                address,
                self.topology_updater.clone(),
                self.topology_watcher.clone(),
                self.update_requester.subscribe(),
                self.establisher.clone(),
                &self.options,
            );
        }
    }

    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let server_type = sd.server_type;
        let server_address = sd.address.clone();

        let mut latest_state = self.broadcaster.clone_latest();
        let old_description = latest_state.description.clone();

        if let Err(error) = latest_state.description.update(sd) {
            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                server = %server_address,
                %error,
                "Ignoring invalid server description",
            );
            return false;
        }

        let hosts = latest_state
            .description
            .server_addresses()
            .cloned()
            .collect();
        self.sync_hosts(&mut latest_state, hosts);

        let topology_changed = old_description != latest_state.description;
        if topology_changed {
            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                server = %server_address,
                ?server_type,
                topology = %latest_state.description,
                "Topology description changed",
            );

            // Pools are readied before the new state is visible so that a selected server never
            // hands out a paused pool.
            if server_type.is_data_bearing()
                || (server_type != ServerType::Unknown
                    && latest_state.description.topology_type == TopologyType::Single)
            {
                if let Some(s) = latest_state.servers.get(&server_address) {
                    s.pool.mark_as_ready().await;
                }
            }
            self.broadcaster.publish_new_state(latest_state)
        }

        topology_changed
    }

    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.update_server(description).await
    }

    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let Some(server) = self.server(&address) else {
            return false;
        };

        // Errors from connections created before the last pool clear are stale.
        if phase.generation() < server.pool.generation() {
            return false;
        }

        // So are errors reporting a topology version older than the one we already have.
        if let Some(error_version) = error.topology_version() {
            let current = self
                .broadcaster
                .borrow_latest()
                .description
                .get_server_description(&address)
                .and_then(|sd| sd.topology_version());
            if current.is_some_and(|current| current.is_more_or_equal_to(error_version)) {
                return false;
            }
        }

        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            server = %address,
            %error,
            "Handling application error",
        );

        if error.is_state_change_error() {
            let updated = self
                .mark_server_as_unknown(server.address.clone(), error.clone())
                .await;

            if updated && (error.is_shutting_down() || phase.wire_version().unwrap_or(0) < 8) {
                server.pool.clear(error);
            }
            self.update_requester.request();

            updated
        } else if error.is_non_timeout_network_error()
            || (phase.is_before_completion() && (error.is_network_error() || error.is_timeout()))
        {
            let updated = self
                .mark_server_as_unknown(server.address.clone(), error.clone())
                .await;
            if updated {
                server.pool.clear(error);
            }
            updated
        } else {
            false
        }
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        match self.server(&address) {
            Some(server) => {
                let updated = self.mark_server_as_unknown(address, error.clone()).await;
                if updated {
                    server.pool.clear(error);
                }
                updated
            }
            None => false,
        }
    }

    fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.broadcaster
            .borrow_latest()
            .servers
            .get(address)
            .cloned()
    }
}

/// Handle used by monitors and pools to report what they observe to the topology worker.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    fn channel() -> (TopologyUpdater, TopologyUpdateReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();

        let updater = TopologyUpdater { sender: tx };
        let update_receiver = TopologyUpdateReceiver {
            update_receiver: rx,
        };

        (updater, update_receiver)
    }

    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    /// Report an error that occurred while establishing a connection or running an operation.
    /// Returns whether the topology changed as a result.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd)))
            .await
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

struct TopologyUpdateReceiver {
    update_receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdateReceiver {
    async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.update_receiver.recv().await
    }
}

/// Read side of the published topology state.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    fn channel(initial_state: TopologyState) -> (TopologyWatcher, TopologyBroadcaster) {
        let (tx, rx) = watch::channel(initial_state);
        let watcher = TopologyWatcher { receiver: rx };
        let broadcaster = TopologyBroadcaster { state_sender: tx };
        (watcher, broadcaster)
    }

    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// Clone the latest state, marking it as seen.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Wait for a new state to be published. Returns false on timeout or if the worker has
    /// stopped.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        matches!(
            runtime::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }

    /// Resolves once the topology worker has stopped.
    pub(crate) async fn wait_until_closed(&mut self) {
        while self.receiver.changed().await.is_ok() {}
    }

    pub(crate) fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.receiver.borrow()
    }
}

struct TopologyBroadcaster {
    state_sender: watch::Sender<TopologyState>,
}

impl TopologyBroadcaster {
    fn clone_latest(&self) -> TopologyState {
        self.borrow_latest().clone()
    }

    fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.state_sender.borrow()
    }

    fn publish_new_state(&self, state: TopologyState) {
        self.state_sender.send_replace(state);
    }
}

#[derive(Clone, Debug)]
struct UpdateRequester {
    sender: broadcast::Sender<()>,
}

impl UpdateRequester {
    fn new() -> UpdateRequester {
        let (sender, _) = broadcast::channel(1);
        UpdateRequester { sender }
    }

    fn request(&self) {
        let _ = self.sender.send(());
    }

    fn subscribe(&self) -> TopologyCheckRequestReceiver {
        TopologyCheckRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receives requests for an immediate server check.
pub(crate) struct TopologyCheckRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyCheckRequestReceiver {
    pub(crate) async fn wait_for_check_request(&mut self, timeout: Duration) {
        let _: std::result::Result<_, _> = runtime::timeout(timeout, self.receiver.recv()).await;
    }

    pub(crate) fn clear_check_requests(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// Enum describing a point in time during an operation's execution relative to when the MongoDB
/// handshake for the connection being used in that operation.
///
/// This is used to determine the error handling semantics for certain error types.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// Describes a point that occurred before the initial hello completed (e.g. when opening the
    /// socket).
    PreHello { generation: u32 },

    /// Describes a point in time after the handshake completed (e.g. when the command was sent to
    /// the server).
    AfterCompletion {
        generation: u32,
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(handshaked_connection: &Connection) -> Self {
        Self::AfterCompletion {
            generation: handshaked_connection.generation,
            // given that this is a handshaked connection, the stream description should
            // always be available, so 0 should never actually be returned here.
            max_wire_version: handshaked_connection
                .stream_description()
                .ok()
                .and_then(|sd| sd.max_wire_version)
                .unwrap_or(0),
        }
    }

    fn generation(&self) -> u32 {
        match self {
            HandshakePhase::PreHello { generation }
            | HandshakePhase::AfterCompletion { generation, .. } => *generation,
        }
    }

    /// Whether this phase is before the handshake completed or not.
    fn is_before_completion(&self) -> bool {
        !matches!(self, HandshakePhase::AfterCompletion { .. })
    }

    /// The wire version of the server as reported by the handshake. If the handshake did not
    /// complete, this returns `None`.
    fn wire_version(&self) -> Option<i32> {
        match self {
            HandshakePhase::AfterCompletion {
                max_wire_version, ..
            } => Some(*max_wire_version),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{HandshakePhase, Topology};
    use crate::{
        error::{Error, ErrorKind},
        options::ServerAddress,
        selection_criteria::{ReadPreference, SelectionCriteria},
        test::MockDeployment,
    };

    fn connection_reset() -> Error {
        ErrorKind::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).into()
    }

    async fn discovered(mock: &MockDeployment) -> Topology {
        let topology = Topology::new(mock.client_options()).unwrap();
        topology
            .select_server(&SelectionCriteria::ReadPreference(ReadPreference::Primary))
            .await
            .unwrap();
        topology
    }

    #[tokio::test]
    async fn network_error_marks_server_unknown_and_clears_pool() {
        let mock = MockDeployment::standalone();
        let topology = discovered(&mock).await;
        let address = ServerAddress::default();
        let server = topology.servers()[&address].clone();
        let mut subscriber = server.pool.generation_subscriber();
        assert_eq!(server.pool.generation(), 0);

        let phase = HandshakePhase::AfterCompletion {
            generation: 0,
            max_wire_version: 21,
        };
        let changed = topology
            .handle_application_error(address.clone(), connection_reset(), phase)
            .await;
        assert!(changed);
        assert_eq!(
            subscriber
                .wait_for_generation_change(Duration::from_secs(1))
                .await,
            Some(1)
        );
        assert_eq!(server.pool.generation(), 1);
    }

    #[tokio::test]
    async fn errors_from_an_older_generation_are_ignored() {
        let mock = MockDeployment::standalone();
        let topology = discovered(&mock).await;
        let address = ServerAddress::default();
        let server = topology.servers()[&address].clone();
        let mut subscriber = server.pool.generation_subscriber();

        server.pool.clear(Error::internal("reset"));
        assert_eq!(
            subscriber
                .wait_for_generation_change(Duration::from_secs(1))
                .await,
            Some(1)
        );

        let stale = HandshakePhase::AfterCompletion {
            generation: 0,
            max_wire_version: 21,
        };
        let changed = topology
            .handle_application_error(address.clone(), connection_reset(), stale)
            .await;
        assert!(!changed);
        assert_eq!(
            subscriber
                .wait_for_generation_change(Duration::from_millis(100))
                .await,
            None
        );
        assert_eq!(server.pool.generation(), 1);
    }
}
