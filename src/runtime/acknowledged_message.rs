use tokio::sync::oneshot;

/// A message sent to a worker task together with a channel for its reply. Dropping the message
/// without replying wakes the sender with `None`.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    message: M,
    reply: AcknowledgmentSender<R>,
}

impl<M, R> AcknowledgedMessage<M, R> {
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (sender, receiver) = oneshot::channel();
        let reply = AcknowledgmentSender { sender };
        (Self { message, reply }, AcknowledgmentReceiver { receiver })
    }

    pub(crate) fn into_parts(self) -> (M, AcknowledgmentSender<R>) {
        (self.message, self.reply)
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentSender<R> {
    sender: oneshot::Sender<R>,
}

impl<R> AcknowledgmentSender<R> {
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        // The requester may have given up waiting.
        let _ = self.sender.send(result.into());
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentReceiver<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> AcknowledgmentReceiver<R> {
    /// Waits for the reply, or `None` if the message was dropped unanswered.
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.receiver.await.ok()
    }
}
