mod command;
mod stream_description;
pub(crate) mod wire;

use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufStream};

use self::wire::{next_request_id, Message};
use super::manager::PoolManager;
use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::AsyncStream,
};
pub(crate) use command::{Command, CommandResponse};
pub(crate) use stream_description::StreamDescription;

/// User-facing information about a connection to the database.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection.
    pub id: u32,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// A wrapper around the stream that contains all the CMAP information needed to maintain a
/// connection.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// Marks the time when the connection was last checked into the pool. This is used
    /// to detect if the connection is idle.
    ready_and_available_time: Option<Instant>,

    /// A handle to the pool the connection is checked out of. A connection that is checked in
    /// (or not pooled, like monitoring connections) has none.
    pool_manager: Option<PoolManager>,

    /// The first error encountered on this connection. Errored connections are closed instead of
    /// being returned to the pool.
    error: Option<Error>,

    stream: BufStream<AsyncStream>,
}

impl Connection {
    pub(crate) fn new(
        id: u32,
        address: ServerAddress,
        generation: u32,
        stream: AsyncStream,
    ) -> Self {
        Self {
            id,
            address,
            generation,
            stream_description: None,
            ready_and_available_time: None,
            pool_manager: None,
            error: None,
            stream: BufStream::new(stream),
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Helper to mark the time that the connection was checked into the pool for the purpose of
    /// detecting when it becomes idle.
    pub(super) fn mark_as_available(&mut self) {
        self.pool_manager.take();
        self.ready_and_available_time = Some(Instant::now());
    }

    /// Helper to mark that the connection has been checked out of the pool. This ensures that the
    /// connection is not marked as idle based on the time that it's checked out and that it has a
    /// handle to the pool.
    pub(super) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
        self.ready_and_available_time.take();
    }

    /// Checks if the connection is idle.
    pub(super) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    /// Checks if the connection is stale.
    pub(super) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    /// Whether an error has been encountered on this connection.
    pub(super) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Executes a `Command` and returns a `CommandResponse` containing the result from the server.
    ///
    /// An `Ok(...)` result simply means the server received the command and that the driver
    /// received the response; it does not imply anything about the success of the command
    /// itself.
    pub(crate) async fn send_command(&mut self, command: Command) -> Result<CommandResponse> {
        let result = self.send_message(command.into_message(Some(next_request_id()))).await;
        if let Err(ref e) = result {
            self.error = Some(e.clone());
        }
        result
    }

    async fn send_message(&mut self, message: Message) -> Result<CommandResponse> {
        if let Some(ref error) = self.error {
            return Err(ErrorKind::Internal {
                message: format!("connection {} previously errored: {}", self.id, error),
            }
            .into());
        }
        message.write_to(&mut self.stream).await?;
        self.stream.flush().await?;

        let max_message_size = self
            .stream_description
            .as_ref()
            .map(|description| description.max_message_size_bytes);
        let response = Message::read_from(&mut self.stream, max_message_size).await?;
        Ok(CommandResponse::new(self.address.clone(), response))
    }

    /// Gets the connection's StreamDescription.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description
            .as_ref()
            .ok_or_else(|| Error::internal("Stream checked out but not handshaked"))
    }

    /// Close this connection, logging the supplied reason.
    pub(super) fn close_and_drop(mut self, reason: &'static str) {
        self.pool_manager.take();
        tracing::debug!(
            target: crate::trace::CONNECTION_TRACING_EVENT_TARGET,
            server = %self.address,
            connection_id = self.id,
            reason,
            "Connection closed",
        );
    }

    /// Nullify the inner state and return it in a new `Connection` for checking back in to
    /// the pool.
    fn take(&mut self) -> Connection {
        Connection {
            id: self.id,
            address: self.address.clone(),
            generation: self.generation,
            stream_description: self.stream_description.take(),
            ready_and_available_time: None,
            pool_manager: None,
            error: self.error.take(),
            stream: std::mem::replace(&mut self.stream, BufStream::new(AsyncStream::Null)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A connection that still holds a pool manager is being dropped while checked out, so it
        // returns itself to the pool. If the pool has already gone away, it is closed instead.
        if let Some(manager) = self.pool_manager.take() {
            let dropped = self.take();
            if let Err(connection) = manager.check_in(dropped) {
                connection.close_and_drop("pool closed");
            }
        }
    }
}

/// A connection that has been created by the pool but not yet established.
#[derive(Debug, Clone)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
}
