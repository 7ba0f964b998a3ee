//! In-memory agent connection registry
//!
//! Maps sender ids to the live channel of the browser agent holding that
//! session, and account ids to the set of channels belonging to the tenant.
//! The registry is process-local and lost on restart; the store's
//! online/offline flag is the durable view, reconciled through heartbeats.
//! "No channel registered" is treated by the scheduler as the sender being
//! effectively offline.

use shared::api::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Handle used to push events to one connected agent.
pub type AgentChannel = mpsc::UnboundedSender<ServerEvent>;

/// Internal registry state
struct RegistryState {
    /// sender id -> live channel
    by_sender: HashMap<String, AgentChannel>,
    /// account id -> sender ids with a live channel
    by_account: HashMap<String, HashSet<String>>,
    /// sender id -> owning account id, for reverse cleanup on forget
    sender_account: HashMap<String, String>,
}

/// Process-local registry of connected agents.
#[derive(Clone)]
pub struct AgentRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState {
                by_sender: HashMap::new(),
                by_account: HashMap::new(),
                sender_account: HashMap::new(),
            })),
        }
    }

    /// Associates a channel with a sender and its account, replacing any
    /// prior channel for the same sender.
    pub async fn register(&self, sender_id: &str, account_id: &str, channel: AgentChannel) {
        let mut state = self.state.write().await;

        if state.by_sender.insert(sender_id.to_string(), channel).is_some() {
            debug!(sender_id = %sender_id, "Replaced existing agent channel");
        }
        state
            .by_account
            .entry(account_id.to_string())
            .or_default()
            .insert(sender_id.to_string());
        state
            .sender_account
            .insert(sender_id.to_string(), account_id.to_string());
    }

    /// Drops the channel for a sender (agent disconnect).
    pub async fn forget(&self, sender_id: &str) {
        let mut state = self.state.write().await;

        state.by_sender.remove(sender_id);
        if let Some(account_id) = state.sender_account.remove(sender_id) {
            if let Some(senders) = state.by_account.get_mut(&account_id) {
                senders.remove(sender_id);
                if senders.is_empty() {
                    state.by_account.remove(&account_id);
                }
            }
        }
    }

    /// Pushes an event to one sender's agent. Returns false when no channel
    /// is registered or the channel is closed.
    pub async fn push_to_sender(&self, sender_id: &str, event: ServerEvent) -> bool {
        let state = self.state.read().await;
        match state.by_sender.get(sender_id) {
            Some(channel) => channel.send(event).is_ok(),
            None => false,
        }
    }

    /// Best-effort fan-out of an event to every channel of an account.
    pub async fn push_to_account(&self, account_id: &str, event: ServerEvent) {
        let state = self.state.read().await;
        let Some(sender_ids) = state.by_account.get(account_id) else {
            return;
        };
        for sender_id in sender_ids {
            if let Some(channel) = state.by_sender.get(sender_id) {
                if channel.send(event.clone()).is_err() {
                    warn!(
                        sender_id = %sender_id,
                        account_id = %account_id,
                        "Dropped account event: agent channel closed"
                    );
                }
            }
        }
    }

    /// Whether a live channel exists for the sender.
    pub async fn is_connected(&self, sender_id: &str) -> bool {
        self.state.read().await.by_sender.contains_key(sender_id)
    }

    /// Number of live channels, for diagnostics.
    pub async fn connected_count(&self) -> usize {
        self.state.read().await.by_sender.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (AgentChannel, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_register_and_push_to_sender() {
        let registry = AgentRegistry::new();
        let (tx, mut rx) = channel();
        registry.register("s1", "a1", tx).await;

        assert!(registry.is_connected("s1").await);
        assert!(
            registry
                .push_to_sender(
                    "s1",
                    ServerEvent::SenderOnline {
                        sender_id: "s1".to_string()
                    }
                )
                .await
        );
        assert!(matches!(
            rx.recv().await,
            Some(ServerEvent::SenderOnline { .. })
        ));
    }

    #[tokio::test]
    async fn test_push_to_unknown_sender_returns_false() {
        let registry = AgentRegistry::new();
        assert!(
            !registry
                .push_to_sender(
                    "ghost",
                    ServerEvent::SenderOffline {
                        sender_id: "ghost".to_string()
                    }
                )
                .await
        );
    }

    #[tokio::test]
    async fn test_register_replaces_prior_channel() {
        let registry = AgentRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        registry.register("s1", "a1", tx1).await;
        registry.register("s1", "a1", tx2).await;

        registry
            .push_to_sender(
                "s1",
                ServerEvent::SenderOnline {
                    sender_id: "s1".to_string(),
                },
            )
            .await;

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_account_fanout_reaches_all_channels() {
        let registry = AgentRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        let (tx3, mut rx3) = channel();
        registry.register("s1", "a1", tx1).await;
        registry.register("s2", "a1", tx2).await;
        registry.register("s3", "other", tx3).await;

        registry
            .push_to_account(
                "a1",
                ServerEvent::SenderOffline {
                    sender_id: "s1".to_string(),
                },
            )
            .await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forget_removes_sender_and_account_entry() {
        let registry = AgentRegistry::new();
        let (tx, _rx) = channel();
        registry.register("s1", "a1", tx).await;
        registry.forget("s1").await;

        assert!(!registry.is_connected("s1").await);
        assert_eq!(registry.connected_count().await, 0);
        assert!(
            !registry
                .push_to_sender(
                    "s1",
                    ServerEvent::SenderOffline {
                        sender_id: "s1".to_string()
                    }
                )
                .await
        );
    }
}
