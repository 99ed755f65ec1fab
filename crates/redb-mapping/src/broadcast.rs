//! Fire-and-forget propagation of mutations to peer nodes.
//!
//! [`Broadcaster::publish`] returns nothing: the send runs on a detached task
//! with its own timeout, and failures are only logged. Messages of one publish
//! are sent in order; once one fails, the rest are skipped because they may
//! reference the record that did not arrive.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::BroadcastConfig;
use crate::core::{BroadcastMessage, MeshTransport};

#[derive(Clone)]
pub struct Broadcaster {
    mesh: Option<Arc<dyn MeshTransport>>,
    timeout: Duration,
}

impl Broadcaster {
    pub fn new(mesh: Arc<dyn MeshTransport>, config: &BroadcastConfig) -> Self {
        Self {
            mesh: config.enabled.then_some(mesh),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// A broadcaster that never sends.
    pub fn disabled() -> Self {
        Self {
            mesh: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// Send `messages` to peers, owners before dependents.
    pub fn publish(&self, messages: Vec<BroadcastMessage>) {
        self.spawn(messages);
    }

    fn spawn(&self, messages: Vec<BroadcastMessage>) -> Option<JoinHandle<()>> {
        let mesh = self.mesh.clone()?;
        if messages.is_empty() || !mesh.should_broadcast() {
            return None;
        }
        let timeout = self.timeout;
        Some(tokio::spawn(async move {
            if tokio::time::timeout(timeout, send_in_order(mesh.as_ref(), messages))
                .await
                .is_err()
            {
                warn!("Mesh broadcast timed out after {:?}", timeout);
            }
        }))
    }
}

async fn send_in_order(mesh: &dyn MeshTransport, messages: Vec<BroadcastMessage>) {
    let total = messages.len();
    for (sent, message) in messages.into_iter().enumerate() {
        let table = message.table.clone();
        let key = message.primary_key.clone();
        if let Err(e) = mesh.send(message).await {
            warn!(
                "Mesh broadcast of {} '{}' failed, skipping {} dependent messages: {}",
                table,
                key,
                total - sent - 1,
                e
            );
            return;
        }
        debug!("Broadcast {} '{}' to peers", table, key);
    }
}
