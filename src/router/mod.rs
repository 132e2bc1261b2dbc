// # Router
//
// Resolves (platform, account, target URL) to a node. Sticky leases win when
// still routable; otherwise the platform's allocation policy picks from the
// healthy view: power-of-two-choices on authority latency, deterministic
// lowest latency, or fewest leases per egress IP.

pub mod lease;

pub use lease::{Lease, LeaseTable};

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::debug;

use crate::config::ConfigHandle;
use crate::error::{ResinError, Result};
use crate::events::{EventBus, LeaseEvent, LeaseEventKind};
use crate::node::{NodeEntry, NodePool};
use crate::persist::{FlushEngine, LeaseRow};
use crate::platform::{AllocationPolicy, MissAction, Platform, DEFAULT_PLATFORM_ID};
use crate::util::now_ns;

#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub node_hash: String,
    pub egress_ip: String,
    pub node_tag: String,
    pub lease_created: bool,
}

pub struct Router {
    pool: Arc<NodePool>,
    config: Arc<ConfigHandle>,
    engine: Arc<FlushEngine>,
    events: Arc<EventBus>,
    leases: LeaseTable,
}

impl Router {
    pub fn new(
        pool: Arc<NodePool>,
        config: Arc<ConfigHandle>,
        engine: Arc<FlushEngine>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            pool,
            config,
            engine,
            events,
            leases: LeaseTable::new(),
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// The routing pipeline. `from_reverse_proxy` gates the miss action for
    /// unknown platform names.
    pub fn route_request(
        &self,
        platform_name: &str,
        account: &str,
        target: &str,
        from_reverse_proxy: bool,
    ) -> Result<RouteResult> {
        let platform = match self.pool.platform_by_name(platform_name) {
            Some(p) => p,
            None if from_reverse_proxy => return self.apply_miss_action(platform_name),
            None => {
                return Err(ResinError::NotFound(format!(
                    "platform {platform_name}"
                )))
            }
        };
        let platform_id = platform.id();
        let now = now_ns();

        // Sticky lease first.
        if !account.is_empty() {
            if let Some(existing) = self.leases.get(&platform_id, account) {
                let routable = !existing.expired(now)
                    && platform.view_contains(&existing.node_hash)
                    && self
                        .pool
                        .get(&existing.node_hash)
                        .map_or(false, |n| n.healthy());
                if routable {
                    let ttl = platform.sticky_ttl_ns();
                    let touched = self.leases.touch_with(
                        &platform_id,
                        account,
                        now,
                        ttl,
                        |l| {
                            self.events.emit_lease(&LeaseEvent {
                                kind: LeaseEventKind::Touch,
                                platform_id: l.platform_id.clone(),
                                account: l.account.clone(),
                                node_hash: l.node_hash.clone(),
                                egress_ip: l.egress_ip.clone(),
                                at_ns: now,
                            });
                        },
                    );
                    if let Some(lease) = touched {
                        self.engine.mark_lease(&platform_id, account);
                        let tag = self
                            .pool
                            .get(&lease.node_hash)
                            .map(|n| n.primary_tag())
                            .unwrap_or_default();
                        return Ok(RouteResult {
                            node_hash: lease.node_hash,
                            egress_ip: lease.egress_ip,
                            node_tag: tag,
                            lease_created: false,
                        });
                    }
                }
            }
        }

        let candidates = self.healthy_candidates(&platform);
        if candidates.is_empty() {
            return Err(ResinError::NoHealthyNode(platform_name.to_string()));
        }
        let chosen = self.pick(&platform, &candidates, now);
        debug!(platform = %platform_name, node = %chosen.hash, target, "routed");

        let lease_created = if !account.is_empty() {
            self.bind_lease(&platform, account, &chosen, now);
            true
        } else {
            false
        };

        Ok(RouteResult {
            node_hash: chosen.hash.clone(),
            egress_ip: chosen.egress_ip(),
            node_tag: chosen.primary_tag(),
            lease_created,
        })
    }

    fn apply_miss_action(&self, platform_name: &str) -> Result<RouteResult> {
        let default = self
            .pool
            .platform(DEFAULT_PLATFORM_ID)
            .ok_or_else(|| ResinError::Internal("Default platform missing".to_string()))?;
        match default.miss_action() {
            MissAction::Reject => Err(ResinError::NotFound(format!(
                "platform {platform_name}"
            ))),
            MissAction::Random => {
                let candidates = self.healthy_candidates(&default);
                if candidates.is_empty() {
                    return Err(ResinError::NoHealthyNode(DEFAULT_PLATFORM_ID.to_string()));
                }
                let idx = rand::rng().random_range(0..candidates.len());
                let chosen = &candidates[idx];
                Ok(RouteResult {
                    node_hash: chosen.hash.clone(),
                    egress_ip: chosen.egress_ip(),
                    node_tag: chosen.primary_tag(),
                    lease_created: false,
                })
            }
        }
    }

    fn healthy_candidates(&self, platform: &Platform) -> Vec<Arc<NodeEntry>> {
        platform
            .view_snapshot()
            .into_iter()
            .filter_map(|hash| self.pool.get(&hash))
            .filter(|n| n.healthy())
            .collect()
    }

    fn pick(
        &self,
        platform: &Platform,
        candidates: &[Arc<NodeEntry>],
        now: i64,
    ) -> Arc<NodeEntry> {
        if candidates.len() == 1 {
            return candidates[0].clone();
        }
        let cfg = self.config.get();
        let window = Duration::from_secs(cfg.p2c_latency_window_secs);
        let authorities = &cfg.latency_authorities;
        let mut rng = rand::rng();

        match platform.allocation_policy() {
            AllocationPolicy::Balanced => {
                // Two distinct uniform samples, lower authority EWMA wins.
                let i = rng.random_range(0..candidates.len());
                let mut j = rng.random_range(0..candidates.len() - 1);
                if j >= i {
                    j += 1;
                }
                let (a, b) = (&candidates[i], &candidates[j]);
                let sa = a.authority_score(authorities, now, window);
                let sb = b.authority_score(authorities, now, window);
                match (sa, sb) {
                    (Some(x), Some(y)) => {
                        if x <= y {
                            a.clone()
                        } else {
                            b.clone()
                        }
                    }
                    (Some(_), None) => a.clone(),
                    (None, Some(_)) => b.clone(),
                    // Neither sample is ready: uniform random.
                    (None, None) => {
                        if rng.random_bool(0.5) {
                            a.clone()
                        } else {
                            b.clone()
                        }
                    }
                }
            }
            AllocationPolicy::PreferLowLatency => {
                let mut best: Vec<&Arc<NodeEntry>> = Vec::new();
                let mut best_score = f64::INFINITY;
                let mut unscored: Vec<&Arc<NodeEntry>> = Vec::new();
                for c in candidates {
                    match c.authority_score(authorities, now, window) {
                        Some(s) if s < best_score => {
                            best_score = s;
                            best.clear();
                            best.push(c);
                        }
                        Some(s) if s == best_score => best.push(c),
                        Some(_) => {}
                        None => unscored.push(c),
                    }
                }
                let pool = if best.is_empty() { unscored } else { best };
                pool[rng.random_range(0..pool.len())].clone()
            }
            AllocationPolicy::PreferIdleIp => {
                let platform_id = platform.id();
                let mut best: Vec<&Arc<NodeEntry>> = Vec::new();
                let mut best_load = i64::MAX;
                for c in candidates {
                    let load = self.leases.ip_load(&platform_id, &c.egress_ip());
                    if load < best_load {
                        best_load = load;
                        best.clear();
                        best.push(c);
                    } else if load == best_load {
                        best.push(c);
                    }
                }
                best[rng.random_range(0..best.len())].clone()
            }
        }
    }

    fn bind_lease(&self, platform: &Platform, account: &str, node: &Arc<NodeEntry>, now: i64) {
        let platform_id = platform.id();
        let lease = Lease {
            platform_id: platform_id.clone(),
            account: account.to_string(),
            node_hash: node.hash.clone(),
            egress_ip: node.egress_ip(),
            created_at_ns: now,
            expiry_ns: now.saturating_add(platform.sticky_ttl_ns()),
            last_accessed_ns: now,
        };
        self.leases.upsert_with(lease, |l, previous| {
            self.events.emit_lease(&LeaseEvent {
                kind: if previous.is_some() {
                    LeaseEventKind::Replace
                } else {
                    LeaseEventKind::Create
                },
                platform_id: l.platform_id.clone(),
                account: l.account.clone(),
                node_hash: l.node_hash.clone(),
                egress_ip: l.egress_ip.clone(),
                at_ns: now,
            });
        });
        self.engine.mark_lease(&platform_id, account);
    }

    // ---- Lease operations ----

    pub fn get_lease(&self, platform_id: &str, account: &str) -> Option<Lease> {
        self.leases.get(platform_id, account)
    }

    pub fn list_leases(&self, platform_id: Option<&str>) -> Vec<Lease> {
        self.leases.list(platform_id)
    }

    pub fn delete_lease(&self, platform_id: &str, account: &str) -> Result<Lease> {
        let removed = self
            .leases
            .remove_with(platform_id, account, |l| {
                self.events.emit_lease(&LeaseEvent {
                    kind: LeaseEventKind::Expire,
                    platform_id: l.platform_id.clone(),
                    account: l.account.clone(),
                    node_hash: l.node_hash.clone(),
                    egress_ip: l.egress_ip.clone(),
                    at_ns: now_ns(),
                });
            })
            .ok_or_else(|| {
                ResinError::NotFound(format!("lease {platform_id}/{account}"))
            })?;
        self.engine.mark_lease(platform_id, account);
        Ok(removed)
    }

    /// Drop every lease bound to a node; used when the node leaves the pool.
    pub fn evict_node(&self, node_hash: &str) -> usize {
        self.sweep_matching(|l| l.node_hash == node_hash)
    }

    /// Drop a deleted platform's leases.
    pub fn evict_platform(&self, platform_id: &str) -> usize {
        self.sweep_matching(|l| l.platform_id == platform_id)
    }

    /// Remove leases that have expired or whose node left the platform's
    /// view. Called by the lease cleaner.
    pub fn sweep_expired(&self) -> usize {
        let now = now_ns();
        self.sweep_matching(|l| {
            if l.expired(now) {
                return true;
            }
            match self.pool.platform(&l.platform_id) {
                Some(p) => !p.view_contains(&l.node_hash),
                // Platform vanished: the lease goes with it.
                None => true,
            }
        })
    }

    fn sweep_matching(&self, predicate: impl FnMut(&Lease) -> bool) -> usize {
        let now = now_ns();
        let removed = self.leases.remove_matching(predicate, |l| {
            self.events.emit_lease(&LeaseEvent {
                kind: LeaseEventKind::Expire,
                platform_id: l.platform_id.clone(),
                account: l.account.clone(),
                node_hash: l.node_hash.clone(),
                egress_ip: l.egress_ip.clone(),
                at_ns: now,
            });
        });
        for l in &removed {
            self.engine.mark_lease(&l.platform_id, &l.account);
        }
        removed.len()
    }

    /// Copy the parent account's live lease onto the child account.
    pub fn inherit_lease(
        &self,
        platform_name: &str,
        parent: &str,
        child: &str,
    ) -> Result<Lease> {
        let platform = self
            .pool
            .platform_by_name(platform_name)
            .ok_or_else(|| ResinError::NotFound(format!("platform {platform_name}")))?;
        let platform_id = platform.id();
        let now = now_ns();
        let parent_lease = self
            .leases
            .get(&platform_id, parent)
            .filter(|l| !l.expired(now))
            .ok_or_else(|| {
                ResinError::NotFound(format!("no live lease for account {parent}"))
            })?;
        if child.is_empty() {
            return Err(ResinError::InvalidArgument(
                "child account must not be empty".to_string(),
            ));
        }
        let lease = Lease {
            platform_id: platform_id.clone(),
            account: child.to_string(),
            node_hash: parent_lease.node_hash.clone(),
            egress_ip: parent_lease.egress_ip.clone(),
            created_at_ns: now,
            expiry_ns: now.saturating_add(platform.sticky_ttl_ns()),
            last_accessed_ns: now,
        };
        let out = lease.clone();
        self.leases.upsert_with(lease, |l, previous| {
            self.events.emit_lease(&LeaseEvent {
                kind: if previous.is_some() {
                    LeaseEventKind::Replace
                } else {
                    LeaseEventKind::Create
                },
                platform_id: l.platform_id.clone(),
                account: l.account.clone(),
                node_hash: l.node_hash.clone(),
                egress_ip: l.egress_ip.clone(),
                at_ns: now,
            });
        });
        self.engine.mark_lease(&platform_id, child);
        Ok(out)
    }

    /// Boot-time restore of one persisted lease.
    pub fn restore_lease(&self, row: &LeaseRow) {
        self.leases.restore(Lease::from_row(row));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LeaseEventKind;
    use crate::node::DefaultOutboundFactory;
    use crate::persist::MemoryStore;
    use crate::platform::PlatformSpec;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Fixture {
        pool: Arc<NodePool>,
        router: Router,
        events: Arc<Mutex<Vec<LeaseEventKind>>>,
    }

    fn fixture(policy: AllocationPolicy) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(ConfigHandle::new(store.clone()));
        let engine = Arc::new(FlushEngine::new(store, config.clone()));
        let pool = Arc::new(NodePool::new(
            config.clone(),
            engine.clone(),
            Arc::new(DefaultOutboundFactory),
            8,
        ));
        let mut spec = PlatformSpec::default_platform();
        spec.allocation_policy = policy;
        pool.register_platform(spec).unwrap();

        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        bus.subscribe_lease(Arc::new(move |e| sink.lock().push(e.kind)));

        Fixture {
            pool: pool.clone(),
            router: Router::new(pool, config, engine, bus),
            events: log,
        }
    }

    fn add_node(f: &Fixture, marker: u32) -> Arc<NodeEntry> {
        let (entry, _) = f
            .pool
            .add(&json!({"type": "direct", "n": marker}), "s1");
        entry
    }

    #[test]
    fn test_route_unknown_platform() {
        let f = fixture(AllocationPolicy::Balanced);
        let err = f
            .router
            .route_request("Nope", "", "http://x.example/", false)
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_route_no_healthy_node() {
        let f = fixture(AllocationPolicy::Balanced);
        let err = f
            .router
            .route_request("Default", "", "http://x.example/", false)
            .unwrap_err();
        assert_eq!(err.code(), "NO_HEALTHY_NODE");
    }

    #[test]
    fn test_account_route_creates_then_reuses_lease() {
        let f = fixture(AllocationPolicy::Balanced);
        add_node(&f, 1);
        add_node(&f, 2);

        let first = f
            .router
            .route_request("Default", "acct", "http://a.example/", false)
            .unwrap();
        assert!(first.lease_created);

        let second = f
            .router
            .route_request("Default", "acct", "http://b.example/", false)
            .unwrap();
        assert!(!second.lease_created);
        assert_eq!(first.node_hash, second.node_hash);

        let kinds = f.events.lock().clone();
        assert_eq!(kinds, vec![LeaseEventKind::Create, LeaseEventKind::Touch]);
    }

    #[test]
    fn test_lease_broken_by_unroutable_node() {
        let f = fixture(AllocationPolicy::Balanced);
        let n1 = add_node(&f, 1);
        add_node(&f, 2);

        let first = f
            .router
            .route_request("Default", "acct", "http://a.example/", false)
            .unwrap();
        // Open the leased node's circuit; the next route replaces the lease.
        let leased = f.pool.get(&first.node_hash).unwrap();
        f.pool.set_circuit(&leased.hash, true).unwrap();

        let second = f
            .router
            .route_request("Default", "acct", "http://a.example/", false)
            .unwrap();
        assert!(second.lease_created);
        assert_ne!(second.node_hash, first.node_hash);
        let _ = n1;
        let kinds = f.events.lock().clone();
        assert_eq!(kinds, vec![LeaseEventKind::Create, LeaseEventKind::Replace]);
    }

    #[test]
    fn test_empty_account_never_leases() {
        let f = fixture(AllocationPolicy::Balanced);
        add_node(&f, 1);
        let res = f
            .router
            .route_request("Default", "", "http://a.example/", false)
            .unwrap();
        assert!(!res.lease_created);
        assert_eq!(f.router.list_leases(None).len(), 0);
    }

    #[test]
    fn test_prefer_low_latency_is_deterministic() {
        let f = fixture(AllocationPolicy::PreferLowLatency);
        let slow = add_node(&f, 1);
        let fast = add_node(&f, 2);
        let cfg = crate::config::RuntimeConfig::default();
        let authority = cfg.latency_authorities[0].clone();
        let now = now_ns();
        slow.observe_latency(
            &authority,
            Duration::from_millis(500),
            now,
            Duration::from_secs(600),
        );
        fast.observe_latency(
            &authority,
            Duration::from_millis(20),
            now,
            Duration::from_secs(600),
        );

        for _ in 0..10 {
            let res = f
                .router
                .route_request("Default", "", "http://a.example/", false)
                .unwrap();
            assert_eq!(res.node_hash, fast.hash);
        }
    }

    #[test]
    fn test_balanced_prefers_sampled_node() {
        let f = fixture(AllocationPolicy::Balanced);
        let slow = add_node(&f, 1);
        let fast = add_node(&f, 2);
        let cfg = crate::config::RuntimeConfig::default();
        let authority = cfg.latency_authorities[0].clone();
        let now = now_ns();
        slow.observe_latency(
            &authority,
            Duration::from_millis(900),
            now,
            Duration::from_secs(600),
        );
        fast.observe_latency(
            &authority,
            Duration::from_millis(10),
            now,
            Duration::from_secs(600),
        );
        // With two candidates P2C always samples both; the fast one wins.
        for _ in 0..10 {
            let res = f
                .router
                .route_request("Default", "", "http://a.example/", false)
                .unwrap();
            assert_eq!(res.node_hash, fast.hash);
        }
    }

    #[test]
    fn test_prefer_idle_ip_spreads_accounts() {
        let f = fixture(AllocationPolicy::PreferIdleIp);
        let a = add_node(&f, 1);
        let b = add_node(&f, 2);
        a.set_egress("1.1.1.1", "US", 1);
        b.set_egress("2.2.2.2", "US", 1);

        let first = f
            .router
            .route_request("Default", "one", "http://a.example/", false)
            .unwrap();
        let second = f
            .router
            .route_request("Default", "two", "http://a.example/", false)
            .unwrap();
        assert_ne!(first.egress_ip, second.egress_ip);
    }

    #[test]
    fn test_delete_lease_emits_expire() {
        let f = fixture(AllocationPolicy::Balanced);
        add_node(&f, 1);
        f.router
            .route_request("Default", "acct", "http://a.example/", false)
            .unwrap();
        f.router.delete_lease("Default", "acct").unwrap();
        assert!(f
            .events
            .lock()
            .iter()
            .any(|k| *k == LeaseEventKind::Expire));
        assert!(f.router.delete_lease("Default", "acct").is_err());
    }

    #[test]
    fn test_inherit_lease() {
        let f = fixture(AllocationPolicy::Balanced);
        add_node(&f, 1);
        let parent = f
            .router
            .route_request("Default", "parent", "http://a.example/", false)
            .unwrap();
        let inherited = f
            .router
            .inherit_lease("Default", "parent", "child")
            .unwrap();
        assert_eq!(inherited.node_hash, parent.node_hash);
        assert!(f.router.get_lease("Default", "child").is_some());
        assert!(f.router.inherit_lease("Default", "ghost", "c2").is_err());
    }

    #[test]
    fn test_evict_node_drops_its_leases() {
        let f = fixture(AllocationPolicy::Balanced);
        add_node(&f, 1);
        let res = f
            .router
            .route_request("Default", "acct", "http://a.example/", false)
            .unwrap();
        assert_eq!(f.router.evict_node(&res.node_hash), 1);
        assert!(f.router.get_lease("Default", "acct").is_none());
    }

    #[test]
    fn test_sweep_removes_unroutable_leases() {
        let f = fixture(AllocationPolicy::Balanced);
        let n = add_node(&f, 1);
        f.router
            .route_request("Default", "acct", "http://a.example/", false)
            .unwrap();
        f.pool.set_circuit(&n.hash, true).unwrap();
        assert_eq!(f.router.sweep_expired(), 1);
        assert!(f.router.get_lease("Default", "acct").is_none());
    }
}
