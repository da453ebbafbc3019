use ahash::HashSet;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::server_instance::ServerInstance;

/// Changes produced by one reconciliation pass. An instance never appears in
/// both sets of the same delta.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MembershipDelta {
    pub removed: HashSet<ServerInstance>,
    pub added: HashSet<ServerInstance>,
}

impl MembershipDelta {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    pub(crate) fn record_added(&mut self, instance: ServerInstance) {
        self.removed.remove(&instance);
        self.added.insert(instance);
    }

    pub(crate) fn record_removed(&mut self, instance: ServerInstance) {
        if !self.added.remove(&instance) {
            self.removed.insert(instance);
        }
    }
}

/// Receives the outcome of every reconciliation pass, in pass order, while the
/// membership state is still locked. Implementations must not call back into
/// the live server set.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn update(&self, delta: &MembershipDelta);
}

/// Forwards non-empty deltas to a channel, waiting for capacity so the
/// consumer sees every delta in order.
#[async_trait]
impl Listener for mpsc::Sender<MembershipDelta> {
    async fn update(&self, delta: &MembershipDelta) {
        if delta.is_empty() {
            return;
        }
        if self.send(delta.clone()).await.is_err() {
            warn!("membership delta receiver closed, drop delta with {} added and {} removed", delta.added.len(), delta.removed.len());
        }
    }
}
