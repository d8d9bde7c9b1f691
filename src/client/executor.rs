use std::{
    borrow::BorrowMut,
    sync::atomic::Ordering,
    time::Instant,
};

use super::Client;
use crate::{
    cmap::{Command, CommandResponse, Connection},
    error::{Error, ErrorKind, Result, RETRYABLE_WRITE_ERROR},
    operation::{Operation, Retryability},
    sdam::{HandshakePhase, SelectedServer},
    selection_criteria::{ReadPreference, SelectionCriteria},
    trace::{TracingRepresentation, COMMAND_TRACING_EVENT_TARGET},
    BoxFuture,
};

impl Client {
    /// Execute the given operation.
    ///
    /// Server selection will performed using the criteria specified on the operation, if any.
    /// Commands pass through automatic encryption before they are sent and replies are decrypted
    /// before the operation sees them.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        mut op: impl BorrowMut<T>,
    ) -> Result<T::O> {
        self.execute_operation_boxed(op.borrow_mut()).await
    }

    // Key vault and metadata lookups made while encrypting a command go back through this path,
    // so the future has to be boxed to give it a finite size.
    fn execute_operation_boxed<'a, T: Operation>(
        &'a self,
        op: &'a mut T,
    ) -> BoxFuture<'a, Result<T::O>> {
        Box::pin(async move {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return Err(ErrorKind::Shutdown.into());
            }
            self.execute_operation_with_retry(op).await
        })
    }

    async fn execute_operation_with_retry<T: Operation>(&self, op: &mut T) -> Result<T::O> {
        let mut first_error: Option<Error> = None;

        loop {
            let criteria = op
                .selection_criteria()
                .cloned()
                .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary));

            let server = match self.inner.topology.select_server(&criteria).await {
                Ok(server) => server,
                Err(error) => return Err(first_error.unwrap_or(error)),
            };

            let retryability = self.get_retryability(op, &server)?;

            let mut conn = match server.pool.check_out().await {
                Ok(conn) => conn,
                Err(error) => {
                    // Errors establishing a connection are reported to SDAM by the pool itself.
                    if first_error.is_none() && retryability.can_retry_error(&error) {
                        first_error = Some(error);
                        continue;
                    }
                    return Err(first_error.unwrap_or(error));
                }
            };

            match self
                .execute_operation_on_connection(op, &mut conn, &criteria)
                .await
            {
                Ok(output) => return Ok(output),
                Err(mut error) => {
                    let max_wire_version = conn
                        .stream_description()
                        .ok()
                        .and_then(|sd| sd.max_wire_version)
                        .unwrap_or(0);
                    if retryability == Retryability::Write
                        && error.should_add_retryable_write_label(max_wire_version)
                    {
                        error.add_label(RETRYABLE_WRITE_ERROR);
                    }

                    if error.is_server_error() || error.is_network_error() {
                        self.inner
                            .topology
                            .handle_application_error(
                                server.address.clone(),
                                error.clone(),
                                HandshakePhase::after_completion(&conn),
                            )
                            .await;
                    }
                    drop(conn);
                    drop(server);

                    if first_error.is_none() && retryability.can_retry_error(&error) {
                        tracing::debug!(
                            target: COMMAND_TRACING_EVENT_TARGET,
                            command_name = op.name(),
                            %error,
                            "Retrying operation after a retryable error",
                        );
                        first_error = Some(error);
                        continue;
                    }

                    // A retry that fails for a reason unrelated to the original failure still
                    // reports the original error.
                    let error = match first_error {
                        Some(first) if !error.is_server_error() && !error.is_network_error() => {
                            first
                        }
                        _ => error,
                    };
                    return op.handle_error(error);
                }
            }
        }
    }

    fn get_retryability<T: Operation>(
        &self,
        op: &T,
        server: &SelectedServer,
    ) -> Result<Retryability> {
        let options = &self.inner.options;
        Ok(match op.retryability() {
            Retryability::Read if options.retry_reads != Some(false) => Retryability::Read,
            Retryability::Write
                if options.retry_writes != Some(false)
                    && op.is_acknowledged()
                    && server
                        .description()
                        .stream_description()?
                        .supports_retryable_writes() =>
            {
                Retryability::Write
            }
            _ => Retryability::None,
        })
    }

    async fn execute_operation_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut Connection,
        criteria: &SelectionCriteria,
    ) -> Result<T::O> {
        let stream_description = connection.stream_description()?.clone();
        let mut cmd = op.build(&stream_description)?;
        self.auto_encrypt(&mut cmd).await?;
        if let Some(read_pref) = criteria.as_read_pref() {
            if op.retryability() == Retryability::Read {
                cmd.set_read_preference(read_pref);
            }
        }

        let command_name = cmd.name.clone();
        let request_start = Instant::now();
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command_name = %command_name,
            database_name = %cmd.target_db,
            server = %connection.address(),
            command = %cmd.body.tracing_representation(),
            "Command started",
        );

        let result = connection.send_command(cmd).await.and_then(|response| {
            response.validate()?;
            Ok(response)
        });
        let duration = request_start.elapsed();

        let mut response = match result {
            Ok(response) => {
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    command_name = %command_name,
                    server = %connection.address(),
                    duration_ms = duration.as_millis() as u64,
                    reply = %response.raw_body().tracing_representation(),
                    "Command succeeded",
                );
                response
            }
            Err(error) => {
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    command_name = %command_name,
                    server = %connection.address(),
                    duration_ms = duration.as_millis() as u64,
                    failure = %error.tracing_representation(),
                    "Command failed",
                );
                return Err(error);
            }
        };

        self.auto_decrypt(&mut response).await?;
        op.handle_response(response, &stream_description)
    }

    fn auto_encrypt<'a>(&'a self, cmd: &'a mut Command) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(state) = self.csfle_state().await {
                let body = std::mem::take(&mut cmd.body);
                cmd.body = state.encrypt_command(&cmd.target_db, body).await?;
            }
            Ok(())
        })
    }

    fn auto_decrypt<'a>(&'a self, response: &'a mut CommandResponse) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(state) = self.csfle_state().await {
                let body = std::mem::take(response.raw_body_mut());
                *response.raw_body_mut() = state.decrypt_reply(body).await?;
            }
            Ok(())
        })
    }
}

impl Retryability {
    fn can_retry_error(&self, error: &Error) -> bool {
        match self {
            Retryability::Read => error.is_read_retryable(),
            Retryability::Write => error.is_write_retryable(),
            Retryability::None => false,
        }
    }
}
