use tokio::sync::watch;

/// Keeps a background worker alive. The worker shuts down once every clone has been dropped.
#[derive(Clone, Debug)]
pub(crate) struct WorkerHandle {
    _alive: watch::Receiver<()>,
}

/// Held by the worker to learn when the last [`WorkerHandle`] is gone.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    sender: watch::Sender<()>,
}

impl WorkerHandleListener {
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = watch::channel(());
        (WorkerHandle { _alive: receiver }, WorkerHandleListener { sender })
    }

    /// Resolves once no handles remain. Only poll this from a `select!` alongside the worker's
    /// other tasks.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        self.sender.closed().await;
    }
}
