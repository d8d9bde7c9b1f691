mod acknowledged_message;
pub(crate) mod http;
mod join_handle;
pub(crate) mod process;
pub(crate) mod stream;
mod tls_rustls;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver, AcknowledgmentSender},
    join_handle::AsyncJoinHandle,
    stream::AsyncStream,
    tls_rustls::TlsConfig,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::{Error, Result};

/// Runs `fut` on the current tokio runtime.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Like [`spawn`], for tasks nobody waits on.
pub(crate) fn execute<F, O>(fut: F)
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    spawn(fut);
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// Fails with a network timeout error if `future` does not finish within `timeout`.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::network_timeout())
}
