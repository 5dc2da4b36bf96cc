use super::msg::TaskMessage;
use tokio::sync::mpsc;

/// Sending half of a node's action queue.
///
/// Listeners and the scanner each hold a clone; the processor owns the only receiver.
#[derive(Clone)]
pub struct ActionQueue {
    sender: mpsc::UnboundedSender<TaskMessage>,
}

impl ActionQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TaskMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Enqueues without blocking. Returns `false` once the processor is gone.
    pub fn send(&self, message: TaskMessage) -> bool {
        let kind = message.kind();
        match self.sender.send(message) {
            Ok(()) => {
                tracing::trace!(kind, "message queued");
                true
            }
            Err(_) => {
                tracing::debug!(kind, "action queue closed, dropping message");
                false
            }
        }
    }
}
