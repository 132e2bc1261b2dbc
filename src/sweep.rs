// # Cleaners
//
// Two periodic sweepers. The lease cleaner removes leases that expired or
// whose node left the platform view. The ephemeral cleaner deletes nodes
// whose owner set has been empty past the configured grace period; deletion
// cascades through the pool's removal callbacks (lease eviction, transport
// close, persistence deletes).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConfigHandle;
use crate::node::NodePool;
use crate::router::Router;
use crate::util::{now_ns, secs_to_ns};

pub struct LeaseCleaner {
    router: Arc<Router>,
    config: Arc<ConfigHandle>,
}

impl LeaseCleaner {
    pub fn new(router: Arc<Router>, config: Arc<ConfigHandle>) -> Self {
        Self { router, config }
    }

    pub fn sweep(&self) -> usize {
        self.router.sweep_expired()
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = Duration::from_secs(self.config.get().lease_sweep_interval_secs);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let removed = self.sweep();
            if removed > 0 {
                debug!(removed, "lease sweep");
            }
        }
    }
}

pub struct EphemeralCleaner {
    pool: Arc<NodePool>,
    config: Arc<ConfigHandle>,
}

impl EphemeralCleaner {
    pub fn new(pool: Arc<NodePool>, config: Arc<ConfigHandle>) -> Self {
        Self { pool, config }
    }

    /// Delete every node orphaned for longer than the evict delay. Returns
    /// the number removed.
    pub fn sweep(&self) -> usize {
        let delay_ns = secs_to_ns(self.config.get().ephemeral_node_evict_delay_secs);
        let now = now_ns();
        let mut doomed = Vec::new();
        self.pool.range(|entry| {
            let orphaned_at = entry.orphaned_at_ns();
            if entry.owner_count() == 0 && orphaned_at > 0 && now - orphaned_at > delay_ns {
                doomed.push(entry.hash.clone());
            }
            true
        });
        let mut removed = 0;
        for hash in doomed {
            // Re-check under the current state; a subscription may have
            // re-adopted the node since the scan.
            if let Some(entry) = self.pool.get(&hash) {
                if entry.owner_count() == 0 && self.pool.remove_node(&hash).is_some() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "ephemeral node sweep");
        }
        removed
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = Duration::from_secs(self.config.get().ephemeral_sweep_interval_secs);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.sweep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::node::DefaultOutboundFactory;
    use crate::persist::{FlushEngine, MemoryStore};
    use crate::platform::PlatformSpec;
    use serde_json::json;

    struct Fixture {
        pool: Arc<NodePool>,
        router: Arc<Router>,
        config: Arc<ConfigHandle>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(ConfigHandle::new(store.clone()));
        let engine = Arc::new(FlushEngine::new(store, config.clone()));
        let pool = Arc::new(NodePool::new(
            config.clone(),
            engine.clone(),
            Arc::new(DefaultOutboundFactory),
            8,
        ));
        pool.register_platform(PlatformSpec::default_platform())
            .unwrap();
        let router = Arc::new(Router::new(
            pool.clone(),
            config.clone(),
            engine,
            Arc::new(EventBus::new()),
        ));
        Fixture {
            pool,
            router,
            config,
        }
    }

    #[tokio::test]
    async fn test_orphan_evicted_after_delay() {
        let f = fixture();
        // Zero-delay eviction so the sweep fires immediately.
        f.config
            .patch(json!({"ephemeral_node_evict_delay_secs": 0}))
            .await
            .unwrap();
        let (entry, _) = f.pool.add(&json!({"type": "direct"}), "s1");
        let cleaner = EphemeralCleaner::new(f.pool.clone(), f.config.clone());

        // Owned: not swept.
        assert_eq!(cleaner.sweep(), 0);

        f.pool.remove_from_subscription(&entry.hash, "s1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cleaner.sweep(), 1);
        assert!(f.pool.get(&entry.hash).is_none());
    }

    #[tokio::test]
    async fn test_owned_node_survives_sweep() {
        let f = fixture();
        f.config
            .patch(json!({"ephemeral_node_evict_delay_secs": 0}))
            .await
            .unwrap();
        let (entry, _) = f.pool.add(&json!({"type": "direct"}), "s1");
        let cleaner = EphemeralCleaner::new(f.pool.clone(), f.config.clone());
        assert_eq!(cleaner.sweep(), 0);
        assert!(f.pool.get(&entry.hash).is_some());
    }

    #[tokio::test]
    async fn test_readopted_orphan_survives() {
        let f = fixture();
        f.config
            .patch(json!({"ephemeral_node_evict_delay_secs": 0}))
            .await
            .unwrap();
        let (entry, _) = f.pool.add(&json!({"type": "direct"}), "s1");
        f.pool.remove_from_subscription(&entry.hash, "s1");
        tokio::time::sleep(Duration::from_millis(5)).await;
        // A second subscription adopts the node before the sweep.
        f.pool.add(&json!({"type": "direct"}), "s2");
        let cleaner = EphemeralCleaner::new(f.pool.clone(), f.config.clone());
        assert_eq!(cleaner.sweep(), 0);
        assert!(f.pool.get(&entry.hash).is_some());
    }

    #[test]
    fn test_lease_cleaner_delegates_to_router() {
        let f = fixture();
        f.pool.add(&json!({"type": "direct"}), "s1");
        f.router
            .route_request("Default", "acct", "http://x.example/", false)
            .unwrap();
        // Make the leased node unroutable, then sweep.
        let lease = f.router.get_lease("Default", "acct").unwrap();
        f.pool.set_circuit(&lease.node_hash, true).unwrap();
        let cleaner = LeaseCleaner::new(f.router.clone(), f.config.clone());
        assert_eq!(cleaner.sweep(), 1);
        assert!(f.router.get_lease("Default", "acct").is_none());
    }
}
