// # Cache flush engine
//
// Mutations never touch the store inline; they mark a key dirty and move on.
// The flush worker drains the dirty-sets on a cadence, when the dirty count
// crosses a threshold, and once more on shutdown. For each drained key the
// engine asks the `SnapshotSource` for the current in-memory value: present
// means upsert, absent means delete. The set is idempotent and reflects the
// latest intent, so reordered or repeated drains converge on the same store
// content.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    AccountHeaderRuleRow, LeaseRow, NodeDynamicRow, NodeLatencyRow, NodeStaticRow, PlatformRow,
    StateStore, SubscriptionNodeRow, SubscriptionRow,
};
use crate::config::ConfigHandle;
use crate::error::Result;

/// Read-side of the runtime state, consulted at flush time. Implemented by
/// the application over the live components; `None` means the entity is gone
/// and its rows should be deleted.
pub trait SnapshotSource: Send + Sync {
    fn subscription(&self, id: &str) -> Option<SubscriptionRow>;
    fn platform(&self, id: &str) -> Option<PlatformRow>;
    fn account_header_rule(&self, prefix: &str) -> Option<AccountHeaderRuleRow>;
    fn node_static(&self, hash: &str) -> Option<NodeStaticRow>;
    fn node_dynamic(&self, hash: &str) -> Option<NodeDynamicRow>;
    fn node_latency(&self, hash: &str, domain: &str) -> Option<NodeLatencyRow>;
    fn subscription_node(&self, sub_id: &str, hash: &str) -> Option<SubscriptionNodeRow>;
    fn lease(&self, platform_id: &str, account: &str) -> Option<LeaseRow>;
}

#[derive(Default)]
struct DirtySets {
    subscriptions: HashSet<String>,
    platforms: HashSet<String>,
    rules: HashSet<String>,
    nodes: HashSet<String>,
    node_latency: HashSet<(String, String)>,
    subscription_nodes: HashSet<(String, String)>,
    leases: HashSet<(String, String)>,
}

impl DirtySets {
    fn len(&self) -> usize {
        self.subscriptions.len()
            + self.platforms.len()
            + self.rules.len()
            + self.nodes.len()
            + self.node_latency.len()
            + self.subscription_nodes.len()
            + self.leases.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn merge(&mut self, other: DirtySets) {
        self.subscriptions.extend(other.subscriptions);
        self.platforms.extend(other.platforms);
        self.rules.extend(other.rules);
        self.nodes.extend(other.nodes);
        self.node_latency.extend(other.node_latency);
        self.subscription_nodes.extend(other.subscription_nodes);
        self.leases.extend(other.leases);
    }
}

pub struct FlushEngine {
    store: Arc<dyn StateStore>,
    config: Arc<ConfigHandle>,
    dirty: Mutex<DirtySets>,
    source: RwLock<Option<Arc<dyn SnapshotSource>>>,
    wake: Notify,
}

impl FlushEngine {
    pub fn new(store: Arc<dyn StateStore>, config: Arc<ConfigHandle>) -> Self {
        Self {
            store,
            config,
            dirty: Mutex::new(DirtySets::default()),
            source: RwLock::new(None),
            wake: Notify::new(),
        }
    }

    /// Wire the read-side. Marks recorded earlier are retained and flushed
    /// once a source exists.
    pub fn set_source(&self, source: Arc<dyn SnapshotSource>) {
        *self.source.write() = Some(source);
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }

    // ---- Marks ----

    pub fn mark_subscription(&self, id: &str) {
        self.mark(|d| {
            d.subscriptions.insert(id.to_string());
        });
    }

    pub fn mark_platform(&self, id: &str) {
        self.mark(|d| {
            d.platforms.insert(id.to_string());
        });
    }

    pub fn mark_account_header_rule(&self, prefix: &str) {
        self.mark(|d| {
            d.rules.insert(prefix.to_string());
        });
    }

    /// Covers both `nodes_static` and `nodes_dynamic`.
    pub fn mark_node(&self, hash: &str) {
        self.mark(|d| {
            d.nodes.insert(hash.to_string());
        });
    }

    pub fn mark_node_latency(&self, hash: &str, domain: &str) {
        self.mark(|d| {
            d.node_latency.insert((hash.to_string(), domain.to_string()));
        });
    }

    pub fn mark_subscription_node(&self, sub_id: &str, hash: &str) {
        self.mark(|d| {
            d.subscription_nodes
                .insert((sub_id.to_string(), hash.to_string()));
        });
    }

    pub fn mark_lease(&self, platform_id: &str, account: &str) {
        self.mark(|d| {
            d.leases
                .insert((platform_id.to_string(), account.to_string()));
        });
    }

    fn mark(&self, f: impl FnOnce(&mut DirtySets)) {
        let len = {
            let mut d = self.dirty.lock();
            f(&mut d);
            d.len()
        };
        if len >= self.config.get().cache_flush_dirty_threshold {
            self.wake.notify_one();
        }
    }

    // ---- Flush ----

    /// Drain everything dirty into the store. Failed batches are re-marked
    /// so the next tick retries them.
    pub async fn flush_now(&self) -> Result<()> {
        let drained = {
            let mut d = self.dirty.lock();
            std::mem::take(&mut *d)
        };
        if drained.is_empty() {
            return Ok(());
        }
        let source = match self.source.read().clone() {
            Some(s) => s,
            None => {
                // No read-side yet; keep the marks.
                self.dirty.lock().merge(drained);
                return Ok(());
            }
        };
        debug!(keys = drained.len(), "cache flush");

        let mut failed = DirtySets::default();

        // subscriptions
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for id in &drained.subscriptions {
            match source.subscription(id) {
                Some(row) => upserts.push(row),
                None => deletes.push(id.clone()),
            }
        }
        if let Err(e) = self.write_pair(
            upserts,
            deletes,
            |rows| self.store.upsert_subscriptions(rows),
            |keys| self.store.delete_subscriptions(keys),
        )
        .await
        {
            warn!(error = %e, "subscription flush failed");
            failed.subscriptions = drained.subscriptions.clone();
        }

        // platforms
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for id in &drained.platforms {
            match source.platform(id) {
                Some(row) => upserts.push(row),
                None => deletes.push(id.clone()),
            }
        }
        if let Err(e) = self.write_pair(
            upserts,
            deletes,
            |rows| self.store.upsert_platforms(rows),
            |keys| self.store.delete_platforms(keys),
        )
        .await
        {
            warn!(error = %e, "platform flush failed");
            failed.platforms = drained.platforms.clone();
        }

        // account header rules
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for prefix in &drained.rules {
            match source.account_header_rule(prefix) {
                Some(row) => upserts.push(row),
                None => deletes.push(prefix.clone()),
            }
        }
        if let Err(e) = self.write_pair(
            upserts,
            deletes,
            |rows| self.store.upsert_account_header_rules(rows),
            |keys| self.store.delete_account_header_rules(keys),
        )
        .await
        {
            warn!(error = %e, "account header rule flush failed");
            failed.rules = drained.rules.clone();
        }

        // nodes: static + dynamic share the dirty key
        let mut static_up = Vec::new();
        let mut dyn_up = Vec::new();
        let mut node_del = Vec::new();
        for hash in &drained.nodes {
            match (source.node_static(hash), source.node_dynamic(hash)) {
                (Some(s), Some(d)) => {
                    static_up.push(s);
                    dyn_up.push(d);
                }
                _ => node_del.push(hash.clone()),
            }
        }
        let node_result: Result<()> = async {
            if !static_up.is_empty() {
                self.store.upsert_nodes_static(static_up).await?;
            }
            if !dyn_up.is_empty() {
                self.store.upsert_nodes_dynamic(dyn_up).await?;
            }
            if !node_del.is_empty() {
                self.store.delete_nodes_static(node_del.clone()).await?;
                self.store.delete_nodes_dynamic(node_del).await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = node_result {
            warn!(error = %e, "node flush failed");
            failed.nodes = drained.nodes.clone();
        }

        // node latency
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for (hash, domain) in &drained.node_latency {
            match source.node_latency(hash, domain) {
                Some(row) => upserts.push(row),
                None => deletes.push((hash.clone(), domain.clone())),
            }
        }
        if let Err(e) = self.write_pair(
            upserts,
            deletes,
            |rows| self.store.upsert_node_latency(rows),
            |keys| self.store.delete_node_latency(keys),
        )
        .await
        {
            warn!(error = %e, "node latency flush failed");
            failed.node_latency = drained.node_latency.clone();
        }

        // subscription nodes
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for (sub_id, hash) in &drained.subscription_nodes {
            match source.subscription_node(sub_id, hash) {
                Some(row) => upserts.push(row),
                None => deletes.push((sub_id.clone(), hash.clone())),
            }
        }
        if let Err(e) = self.write_pair(
            upserts,
            deletes,
            |rows| self.store.upsert_subscription_nodes(rows),
            |keys| self.store.delete_subscription_nodes(keys),
        )
        .await
        {
            warn!(error = %e, "subscription node flush failed");
            failed.subscription_nodes = drained.subscription_nodes.clone();
        }

        // leases
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for (platform_id, account) in &drained.leases {
            match source.lease(platform_id, account) {
                Some(row) => upserts.push(row),
                None => deletes.push((platform_id.clone(), account.clone())),
            }
        }
        if let Err(e) = self.write_pair(
            upserts,
            deletes,
            |rows| self.store.upsert_leases(rows),
            |keys| self.store.delete_leases(keys),
        )
        .await
        {
            warn!(error = %e, "lease flush failed");
            failed.leases = drained.leases.clone();
        }

        if !failed.is_empty() {
            self.dirty.lock().merge(failed);
        }
        Ok(())
    }

    async fn write_pair<R, U, FU, DU, FD, DD>(
        &self,
        upserts: Vec<R>,
        deletes: Vec<U>,
        up: FU,
        del: FD,
    ) -> Result<()>
    where
        FU: FnOnce(Vec<R>) -> DU,
        DU: std::future::Future<Output = Result<()>>,
        FD: FnOnce(Vec<U>) -> DD,
        DD: std::future::Future<Output = Result<()>>,
    {
        if !upserts.is_empty() {
            up(upserts).await?;
        }
        if !deletes.is_empty() {
            del(deletes).await?;
        }
        Ok(())
    }

    /// Flush worker loop. Runs until cancelled, then performs a final flush.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = Duration::from_secs(self.config.get().cache_flush_interval_secs);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.flush_now().await {
                warn!(error = %e, "cache flush tick failed");
            }
        }
        if let Err(e) = self.flush_now().await {
            warn!(error = %e, "final cache flush failed");
        }
    }
}
