//! Peer Registry
//!
//! At most one live [`PeerConnectionManager`] per remote peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::peer::{PeerConnectionManager, PeerContext};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Map from remote peer id to its manager
pub struct PeerRegistry {
    ctx: Arc<PeerContext>,
    peers: Mutex<HashMap<String, Arc<PeerConnectionManager>>>,
}

impl PeerRegistry {
    pub fn new(ctx: Arc<PeerContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Arc<PeerContext> {
        &self.ctx
    }

    /// Return the live or not-yet-started manager for `peer_id`, or replace
    /// a stale one with a fresh manager.
    pub fn get_or_create(&self, peer_id: &str) -> Arc<PeerConnectionManager> {
        let (manager, stale) = {
            let mut peers = lock(&self.peers);
            if let Some(existing) = peers.get(peer_id) {
                if existing.is_live() || existing.is_fresh() {
                    return existing.clone();
                }
            }
            let manager = PeerConnectionManager::new(peer_id, self.ctx.clone());
            let stale = peers.insert(peer_id.to_string(), manager.clone());
            (manager, stale)
        };
        if let Some(stale) = stale {
            debug!("Replacing {:?} manager for {}", stale.status(), peer_id);
            stale.cleanup();
        }
        manager
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerConnectionManager>> {
        lock(&self.peers).get(peer_id).cloned()
    }

    /// The manager for `peer_id` if it is Connecting or Connected
    pub fn get_live(&self, peer_id: &str) -> Option<Arc<PeerConnectionManager>> {
        self.get(peer_id).filter(|m| m.is_live())
    }

    /// Clean up and evict. Returns whether an entry existed.
    pub fn remove(&self, peer_id: &str) -> bool {
        let removed = lock(&self.peers).remove(peer_id);
        match removed {
            Some(manager) => {
                manager.cleanup();
                true
            }
            None => false,
        }
    }

    /// Evict `manager` only if it is still the registered entry for its peer
    pub fn remove_if_same(&self, manager: &Arc<PeerConnectionManager>) -> bool {
        let removed = {
            let mut peers = lock(&self.peers);
            match peers.get(manager.remote_peer_id()) {
                Some(current) if Arc::ptr_eq(current, manager) => {
                    peers.remove(manager.remote_peer_id())
                }
                _ => None,
            }
        };
        if let Some(manager) = &removed {
            manager.cleanup();
        }
        removed.is_some()
    }

    /// Tear down every manager
    pub fn cleanup_all(&self) {
        let managers: Vec<_> = lock(&self.peers).drain().map(|(_, m)| m).collect();
        for manager in managers {
            manager.cleanup();
        }
    }

    /// Managers that are Connecting or Connected
    pub fn live_managers(&self) -> Vec<Arc<PeerConnectionManager>> {
        lock(&self.peers)
            .values()
            .filter(|m| m.is_live())
            .cloned()
            .collect()
    }

    /// Peers with a Connecting or Connected manager
    pub fn live_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = lock(&self.peers)
            .iter()
            .filter(|(_, m)| m.is_live())
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.peers).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::D2dConfig;
    use crate::mock::{MemorySignalingStore, MockMediaSource, MockNetwork, MockTransport};
    use crate::types::ConnectionStatus;

    fn registry() -> Arc<PeerRegistry> {
        let network = MockNetwork::new();
        let ctx = PeerContext::new(
            "alice",
            MemorySignalingStore::new(),
            MockTransport::new(&network),
            MockMediaSource::new(),
            D2dConfig::default(),
        );
        PeerRegistry::new(ctx)
    }

    #[tokio::test]
    async fn test_fresh_manager_is_reused() {
        let registry = registry();
        let a = registry.get_or_create("bob");
        let b = registry.get_or_create("bob");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_live_manager_is_reused() {
        let registry = registry();
        let a = registry.get_or_create("bob");
        a.connect(false).await.unwrap();
        assert_eq!(a.status(), ConnectionStatus::Connecting);
        let b = registry.get_or_create("bob");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.live_peers(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_manager_is_replaced() {
        let registry = registry();
        let a = registry.get_or_create("bob");
        a.connect(false).await.unwrap();
        a.cleanup();
        assert_eq!(a.status(), ConnectionStatus::Idle);

        let b = registry.get_or_create("bob");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(b.is_fresh());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_cleanup_all() {
        let registry = registry();
        let bob = registry.get_or_create("bob");
        let carol = registry.get_or_create("carol");
        bob.connect(false).await.unwrap();

        assert!(registry.remove("bob"));
        assert!(!registry.remove("bob"));
        assert_eq!(bob.status(), ConnectionStatus::Idle);

        registry.cleanup_all();
        assert!(registry.is_empty());
        assert!(!carol.is_fresh());
    }

    #[tokio::test]
    async fn test_remove_if_same_ignores_replaced_entry() {
        let registry = registry();
        let old = registry.get_or_create("bob");
        old.cleanup();
        let new = registry.get_or_create("bob");
        assert!(!registry.remove_if_same(&old));
        assert!(registry.get("bob").is_some());
        assert!(registry.remove_if_same(&new));
        assert!(registry.get("bob").is_none());
    }
}
