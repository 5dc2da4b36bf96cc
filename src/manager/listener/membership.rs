use crate::store::{MembershipEvent, NodeId};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Logs members and clients coming and going.
///
/// Ownership drift after membership changes is repaired by the key scanner, not here.
pub struct MembershipListener {
    node_id: NodeId,
    events: broadcast::Receiver<MembershipEvent>,
}

impl MembershipListener {
    pub fn new(node_id: NodeId, events: broadcast::Receiver<MembershipEvent>) -> Self {
        Self { node_id, events }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.events.recv().await {
                    Ok(event) => self.log(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "membership listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn log(&self, event: &MembershipEvent) {
        let node = &self.node_id;
        match event {
            MembershipEvent::MemberAdded(member) => {
                tracing::info!(node = %node, member = %member, "cluster member added");
            }
            MembershipEvent::MemberRemoved(member) => {
                tracing::info!(node = %node, member = %member, "cluster member removed");
            }
            MembershipEvent::ClientConnected(client) => {
                tracing::info!(node = %node, client = %client, "client connected");
            }
            MembershipEvent::ClientDisconnected(client) => {
                tracing::info!(node = %node, client = %client, "client disconnected");
            }
        }
    }
}
