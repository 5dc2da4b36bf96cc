//! Local Event Listeners
//!
//! Each listener drains the change notifications for entries this node owns and turns them into
//! messages for the action processor. Listeners read the store when they need to decide which
//! message to send; the only write they perform is parking a new task in `WAITING`.

mod context;
mod membership;
mod runtime;
mod task;

pub use context::{ContextListener, ContextStateNotifier, TopicStateNotifier};
pub use membership::MembershipListener;
pub use runtime::RuntimeListener;
pub use task::TaskListener;

use crate::store::EntryEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Runs `handle` for every event until the store drops the subscription.
pub(crate) fn drive<V, F, Fut>(
    name: &'static str,
    mut events: mpsc::UnboundedReceiver<EntryEvent<V>>,
    handle: F,
) -> JoinHandle<()>
where
    V: Send + 'static,
    F: Fn(EntryEvent<V>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::debug!(listener = name, "listener started");
        while let Some(event) = events.recv().await {
            handle(event).await;
        }
        tracing::debug!(listener = name, "listener stopped");
    })
}
