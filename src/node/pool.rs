// # Node pool
//
// The authoritative map of identity → NodeEntry, plus the registry of
// platforms whose routable views are derived from it. Membership and health
// transitions re-evaluate affected platform views incrementally; a full
// rebuild is the safe superset and runs after restore and on demand.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::entry::{NodeEntry, NodeSummary};
use super::identity::{identity_of, NodeHash};
use super::outbound::OutboundFactory;
use crate::config::ConfigHandle;
use crate::error::{ResinError, Result};
use crate::persist::FlushEngine;
use crate::platform::{Platform, PlatformSpec};
use crate::util::now_ns;

pub type NodeCallback = Arc<dyn Fn(&Arc<NodeEntry>) + Send + Sync>;

pub struct NodePool {
    nodes: DashMap<NodeHash, Arc<NodeEntry>>,
    platforms: DashMap<String, Arc<Platform>>,
    // name → id secondary index; names are unique among live platforms.
    platform_names: DashMap<String, String>,

    config: Arc<ConfigHandle>,
    engine: Arc<FlushEngine>,
    factory: Arc<dyn OutboundFactory>,
    latency_table_cap: usize,

    on_added: RwLock<Vec<NodeCallback>>,
    on_removed: RwLock<Vec<NodeCallback>>,
}

impl NodePool {
    pub fn new(
        config: Arc<ConfigHandle>,
        engine: Arc<FlushEngine>,
        factory: Arc<dyn OutboundFactory>,
        latency_table_cap: usize,
    ) -> Self {
        Self {
            nodes: DashMap::new(),
            platforms: DashMap::new(),
            platform_names: DashMap::new(),
            config,
            engine,
            factory,
            latency_table_cap,
            on_added: RwLock::new(Vec::new()),
            on_removed: RwLock::new(Vec::new()),
        }
    }

    /// Fires for every brand-new entry. Callbacks must be non-blocking.
    pub fn on_node_added(&self, cb: NodeCallback) {
        self.on_added.write().push(cb);
    }

    /// Fires when an entry is deleted from the pool.
    pub fn on_node_removed(&self, cb: NodeCallback) {
        self.on_removed.write().push(cb);
    }

    // ---- Membership ----

    /// Idempotent on identity: an existing entry gains `sub_id` as an owner,
    /// a new entry is created, gets its outbound built, and fires the
    /// added callbacks.
    pub fn add(&self, options: &Value, sub_id: &str) -> (Arc<NodeEntry>, bool) {
        let hash = identity_of(options);
        if let Some(existing) = self.nodes.get(&hash) {
            let entry = existing.value().clone();
            drop(existing);
            entry.add_owner(sub_id);
            self.engine.mark_node(&hash);
            return (entry, false);
        }

        let entry = Arc::new(NodeEntry::new(
            hash.clone(),
            options.clone(),
            self.latency_table_cap,
            now_ns(),
        ));
        entry.add_owner(sub_id);
        match self.factory.build(entry.raw_options()) {
            Ok(outbound) => entry.set_outbound(Some(outbound)),
            Err(e) => {
                entry.set_last_error(&format!("outbound build: {e}"));
                warn!(hash = %hash, error = %e, "outbound build failed");
            }
        }
        self.nodes.insert(hash.clone(), entry.clone());
        self.engine.mark_node(&hash);
        self.reevaluate_node(&entry);
        for cb in self.on_added.read().iter() {
            cb(&entry);
        }
        debug!(hash = %hash, sub = sub_id, "node added to pool");
        (entry, true)
    }

    /// Restore path: insert a prebuilt entry without callbacks or dirty
    /// marks.
    pub fn insert_restored(&self, entry: Arc<NodeEntry>) {
        match self.factory.build(entry.raw_options()) {
            Ok(outbound) => entry.set_outbound(Some(outbound)),
            Err(e) => entry.set_last_error(&format!("outbound build: {e}")),
        }
        self.nodes.insert(entry.hash.clone(), entry);
    }

    /// Drop `sub_id` from the owner set. An entry whose owner set empties is
    /// kept until the ephemeral cleaner's grace period elapses.
    pub fn remove_from_subscription(&self, hash: &str, sub_id: &str) {
        if let Some(entry) = self.nodes.get(hash) {
            let orphaned = entry.remove_owner(sub_id, now_ns());
            self.engine.mark_node(hash);
            if orphaned {
                debug!(hash = %hash, "node orphaned");
            }
        }
    }

    /// Delete an entry outright. Used by the ephemeral cleaner; cascades to
    /// persistence and to the removal callbacks (lease eviction, transport
    /// close).
    pub fn remove_node(&self, hash: &str) -> Option<Arc<NodeEntry>> {
        let (_, entry) = self.nodes.remove(hash)?;
        for p in self.platforms.iter() {
            p.value().view_remove(hash);
        }
        self.engine.mark_node(hash);
        for (domain, _) in entry.latency_snapshot() {
            self.engine.mark_node_latency(hash, &domain);
        }
        for cb in self.on_removed.read().iter() {
            cb(&entry);
        }
        info!(hash = %hash, "node removed from pool");
        Some(entry)
    }

    pub fn get(&self, hash: &str) -> Option<Arc<NodeEntry>> {
        self.nodes.get(hash).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Visit every entry; the visitor returns false to stop early.
    pub fn range(&self, mut visitor: impl FnMut(&Arc<NodeEntry>) -> bool) {
        for e in self.nodes.iter() {
            if !visitor(e.value()) {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<NodeSummary> {
        self.nodes.iter().map(|e| e.value().summary()).collect()
    }

    // ---- Health ----

    /// Report a request/probe outcome for a node.
    pub fn record_result(&self, hash: &str, ok: bool) {
        let Some(entry) = self.get(hash) else {
            return;
        };
        let changed = if ok {
            entry.record_success()
        } else {
            let max = self.config.get().max_consecutive_failures;
            entry.record_failure(max, now_ns())
        };
        self.engine.mark_node(hash);
        if changed {
            info!(hash = %hash, open = !ok, "circuit transition");
            self.reevaluate_node(&entry);
        }
    }

    /// Operator-forced circuit state.
    pub fn set_circuit(&self, hash: &str, open: bool) -> Result<()> {
        let entry = self
            .get(hash)
            .ok_or_else(|| ResinError::NotFound(format!("node {hash}")))?;
        if entry.force_circuit(open, now_ns()) {
            self.engine.mark_node(hash);
            self.reevaluate_node(&entry);
        }
        Ok(())
    }

    /// Store an egress probe result; region changes re-derive views.
    pub fn update_egress(&self, hash: &str, ip: &str, region: &str) {
        if let Some(entry) = self.get(hash) {
            let region_changed = entry.set_egress(ip, region, now_ns());
            self.engine.mark_node(hash);
            if region_changed {
                self.reevaluate_node(&entry);
            }
        }
    }

    /// Replace a node's display tags (subscription bind/refresh).
    pub fn set_display_tags(&self, hash: &str, tags: Vec<String>) {
        if let Some(entry) = self.get(hash) {
            entry.set_display_tags(tags);
            self.reevaluate_node(&entry);
        }
    }

    // ---- Platforms ----

    /// Register a platform. Its view is seeded from the current pool before
    /// the platform becomes observable, so readers never see an empty view
    /// on a freshly created platform.
    pub fn register_platform(&self, spec: PlatformSpec) -> Result<Arc<Platform>> {
        if let Some(taken) = self.platform_names.get(&spec.name) {
            if *taken.value() != spec.id {
                return Err(ResinError::Conflict(format!(
                    "platform name already taken: {}",
                    spec.name
                )));
            }
        }
        let id = spec.id.clone();
        let name = spec.name.clone();
        let platform = Arc::new(Platform::new(spec)?);
        platform.replace_view(self.compute_view(&platform));
        self.platforms.insert(id.clone(), platform.clone());
        self.platform_names.insert(name, id);
        Ok(platform)
    }

    /// Swap a live platform's spec; filters recompile and the view rebuilds
    /// before the name index updates.
    pub fn replace_platform(&self, id: &str, spec: PlatformSpec) -> Result<()> {
        let platform = self
            .platform(id)
            .ok_or_else(|| ResinError::NotFound(format!("platform {id}")))?;
        if let Some(taken) = self.platform_names.get(&spec.name) {
            if *taken.value() != id {
                return Err(ResinError::Conflict(format!(
                    "platform name already taken: {}",
                    spec.name
                )));
            }
        }
        let old_name = platform.name();
        platform.update_spec(spec.clone())?;
        platform.replace_view(self.compute_view(&platform));
        if old_name != spec.name {
            self.platform_names.remove(&old_name);
            self.platform_names.insert(spec.name, id.to_string());
        }
        Ok(())
    }

    pub fn unregister_platform(&self, id: &str) -> Option<Arc<Platform>> {
        let (_, platform) = self.platforms.remove(id)?;
        self.platform_names.remove(&platform.name());
        Some(platform)
    }

    pub fn platform(&self, id: &str) -> Option<Arc<Platform>> {
        self.platforms.get(id).map(|p| p.value().clone())
    }

    /// Case-exact name lookup.
    pub fn platform_by_name(&self, name: &str) -> Option<Arc<Platform>> {
        let id = self.platform_names.get(name)?.value().clone();
        self.platform(&id)
    }

    pub fn platforms_snapshot(&self) -> Vec<Arc<Platform>> {
        self.platforms.iter().map(|p| p.value().clone()).collect()
    }

    pub fn rebuild_platform(&self, id: &str) -> Result<()> {
        let platform = self
            .platform(id)
            .ok_or_else(|| ResinError::NotFound(format!("platform {id}")))?;
        platform.replace_view(self.compute_view(&platform));
        Ok(())
    }

    pub fn rebuild_all_platforms(&self) {
        for p in self.platforms.iter() {
            p.value().replace_view(self.compute_view(p.value()));
        }
    }

    /// A node is routable by a platform iff healthy and the platform's
    /// filters accept its display tags and region.
    fn node_routable(&self, platform: &Platform, entry: &NodeEntry) -> bool {
        entry.healthy() && platform.matches(&entry.display_tags(), &entry.region())
    }

    fn compute_view(&self, platform: &Platform) -> HashSet<NodeHash> {
        let mut view = HashSet::new();
        for e in self.nodes.iter() {
            if self.node_routable(platform, e.value()) {
                view.insert(e.key().clone());
            }
        }
        view
    }

    /// Incremental re-derivation for one node across all platforms.
    pub fn reevaluate_node(&self, entry: &Arc<NodeEntry>) {
        for p in self.platforms.iter() {
            if self.node_routable(p.value(), entry) {
                p.value().view_insert(&entry.hash);
            } else {
                p.value().view_remove(&entry.hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::outbound::DefaultOutboundFactory;
    use crate::persist::MemoryStore;
    use crate::platform::{AllocationPolicy, MissAction};
    use serde_json::json;

    fn pool() -> NodePool {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(ConfigHandle::new(store.clone()));
        let engine = Arc::new(FlushEngine::new(store, config.clone()));
        NodePool::new(config, engine, Arc::new(DefaultOutboundFactory), 8)
    }

    fn spec(id: &str, name: &str, regex: &[&str]) -> PlatformSpec {
        PlatformSpec {
            id: id.into(),
            name: name.into(),
            sticky_ttl_ns: 1_000_000_000,
            regex_filters: regex.iter().map(|s| s.to_string()).collect(),
            region_filters: Vec::new(),
            reverse_proxy_miss_action: MissAction::Reject,
            allocation_policy: AllocationPolicy::Balanced,
            updated_at_ns: 0,
        }
    }

    #[test]
    fn test_add_is_idempotent_on_identity() {
        let pool = pool();
        let (a, created_a) = pool.add(&json!({"type": "direct", "x": 1}), "s1");
        let (b, created_b) = pool.add(&json!({"x": 1, "type": "direct"}), "s2");
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.hash, b.hash);
        assert_eq!(pool.len(), 1);
        assert_eq!(a.owner_count(), 2);
    }

    #[test]
    fn test_added_callback_fires_for_new_entries_only() {
        let pool = pool();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        pool.on_node_added(Arc::new(move |_| {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        pool.add(&json!({"type": "direct"}), "s1");
        pool.add(&json!({"type": "direct"}), "s2");
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_from_subscription_orphans_but_keeps_node() {
        let pool = pool();
        let (entry, _) = pool.add(&json!({"type": "direct"}), "s1");
        pool.remove_from_subscription(&entry.hash, "s1");
        assert!(pool.get(&entry.hash).is_some());
        assert!(entry.orphaned_at_ns() > 0);
    }

    #[test]
    fn test_circuit_open_drops_node_from_views() {
        let pool = pool();
        let platform = pool.register_platform(spec("p1", "P1", &[])).unwrap();
        let (entry, _) = pool.add(&json!({"type": "direct"}), "s1");
        assert!(platform.view_contains(&entry.hash));

        for _ in 0..5 {
            pool.record_result(&entry.hash, false);
        }
        assert!(!entry.healthy());
        assert!(!platform.view_contains(&entry.hash));

        pool.record_result(&entry.hash, true);
        assert!(entry.healthy());
        assert!(platform.view_contains(&entry.hash));
    }

    #[test]
    fn test_view_seeded_before_platform_is_visible() {
        let pool = pool();
        let (entry, _) = pool.add(&json!({"type": "direct"}), "s1");
        pool.set_display_tags(&entry.hash, vec!["Provider/HK-01".into()]);
        let platform = pool
            .register_platform(spec("p2", "P2", &["^Provider/.*"]))
            .unwrap();
        // Whatever observes the platform observes its populated view.
        assert!(platform.view_contains(&entry.hash));
        assert_eq!(pool.platform_by_name("P2").unwrap().view_len(), 1);
    }

    #[test]
    fn test_platform_name_conflict() {
        let pool = pool();
        pool.register_platform(spec("p1", "One", &[])).unwrap();
        let err = pool.register_platform(spec("p2", "One", &[])).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn test_replace_platform_rename_updates_index() {
        let pool = pool();
        pool.register_platform(spec("p1", "One", &[])).unwrap();
        pool.replace_platform("p1", spec("p1", "Uno", &[])).unwrap();
        assert!(pool.platform_by_name("One").is_none());
        assert!(pool.platform_by_name("Uno").is_some());
    }

    #[test]
    fn test_tag_change_reevaluates_views() {
        let pool = pool();
        let platform = pool
            .register_platform(spec("p1", "P1", &["^Want/.*"]))
            .unwrap();
        let (entry, _) = pool.add(&json!({"type": "direct"}), "s1");
        assert!(!platform.view_contains(&entry.hash));
        pool.set_display_tags(&entry.hash, vec!["Want/a".into()]);
        assert!(platform.view_contains(&entry.hash));
        pool.set_display_tags(&entry.hash, vec!["Other/a".into()]);
        assert!(!platform.view_contains(&entry.hash));
    }

    #[test]
    fn test_remove_node_cascades_views_and_callbacks() {
        let pool = pool();
        let platform = pool.register_platform(spec("p1", "P1", &[])).unwrap();
        let removed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let r = removed.clone();
        pool.on_node_removed(Arc::new(move |_| {
            r.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        let (entry, _) = pool.add(&json!({"type": "direct"}), "s1");
        assert!(pool.remove_node(&entry.hash).is_some());
        assert!(pool.get(&entry.hash).is_none());
        assert!(!platform.view_contains(&entry.hash));
        assert_eq!(removed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(pool.remove_node(&entry.hash).is_none());
    }

    #[test]
    fn test_unbuildable_outbound_keeps_node_unhealthy() {
        let pool = pool();
        let platform = pool.register_platform(spec("p1", "P1", &[])).unwrap();
        let (entry, _) = pool.add(&json!({"type": "martian"}), "s1");
        assert!(!entry.healthy());
        assert!(!platform.view_contains(&entry.hash));
        assert!(entry.last_error().contains("outbound build"));
    }
}
