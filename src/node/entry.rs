// # Node entries
//
// One `NodeEntry` per identity, owned exclusively by the pool. Hot fields
// (counters, timestamps) are atomics; everything else sits behind the entry's
// own short-lived locks so readers on the routing path never contend on a
// pool-wide lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;

use super::identity::{canonical_json, NodeHash};
use super::latency::{LatencySample, LatencyTable};
use super::outbound::Outbound;
use crate::persist::{NodeDynamicRow, NodeStaticRow};
use crate::util::short_hash;

pub struct NodeEntry {
    pub hash: NodeHash,
    raw_options: Value,
    created_at_ns: i64,

    outbound: RwLock<Option<Arc<dyn Outbound>>>,

    egress_ip: RwLock<String>,
    region: RwLock<String>,
    last_egress_update_ns: AtomicI64,
    last_egress_attempt_ns: AtomicI64,
    last_latency_attempt_ns: AtomicI64,
    last_authority_attempt_ns: AtomicI64,

    failure_count: AtomicU32,
    circuit_open_since_ns: AtomicI64,
    last_error: Mutex<String>,

    latency: Mutex<LatencyTable>,

    subscription_ids: RwLock<HashSet<String>>,
    display_tags: RwLock<Vec<String>>,
    orphaned_at_ns: AtomicI64,
}

impl NodeEntry {
    pub fn new(hash: NodeHash, raw_options: Value, latency_cap: usize, created_at_ns: i64) -> Self {
        Self {
            hash,
            raw_options,
            created_at_ns,
            outbound: RwLock::new(None),
            egress_ip: RwLock::new(String::new()),
            region: RwLock::new(String::new()),
            last_egress_update_ns: AtomicI64::new(0),
            last_egress_attempt_ns: AtomicI64::new(0),
            last_latency_attempt_ns: AtomicI64::new(0),
            last_authority_attempt_ns: AtomicI64::new(0),
            failure_count: AtomicU32::new(0),
            circuit_open_since_ns: AtomicI64::new(0),
            last_error: Mutex::new(String::new()),
            latency: Mutex::new(LatencyTable::new(latency_cap)),
            subscription_ids: RwLock::new(HashSet::new()),
            display_tags: RwLock::new(Vec::new()),
            orphaned_at_ns: AtomicI64::new(0),
        }
    }

    pub fn raw_options(&self) -> &Value {
        &self.raw_options
    }

    pub fn created_at_ns(&self) -> i64 {
        self.created_at_ns
    }

    // ---- Outbound ----

    pub fn outbound(&self) -> Option<Arc<dyn Outbound>> {
        self.outbound.read().clone()
    }

    pub fn set_outbound(&self, outbound: Option<Arc<dyn Outbound>>) {
        *self.outbound.write() = outbound;
    }

    // ---- Health ----

    /// The single health definition: circuit closed and an outbound present.
    pub fn healthy(&self) -> bool {
        self.circuit_open_since_ns.load(Ordering::Acquire) == 0 && self.outbound.read().is_some()
    }

    pub fn circuit_open_since_ns(&self) -> i64 {
        self.circuit_open_since_ns.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Count one failure; opens the circuit when the threshold is reached.
    /// Returns true when this call transitioned the circuit to open.
    pub fn record_failure(&self, max_consecutive: u32, now_ns: i64) -> bool {
        let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= max_consecutive {
            self.circuit_open_since_ns
                .compare_exchange(0, now_ns, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            false
        }
    }

    /// Reset failure accounting. Returns true when this closed an open
    /// circuit.
    pub fn record_success(&self) -> bool {
        self.failure_count.store(0, Ordering::Release);
        self.circuit_open_since_ns.swap(0, Ordering::AcqRel) != 0
    }

    /// Operator override. Returns true when the circuit state changed.
    pub fn force_circuit(&self, open: bool, now_ns: i64) -> bool {
        if open {
            self.circuit_open_since_ns
                .compare_exchange(0, now_ns, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            self.failure_count.store(0, Ordering::Release);
            self.circuit_open_since_ns.swap(0, Ordering::AcqRel) != 0
        }
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    pub fn set_last_error(&self, err: &str) {
        let mut slot = self.last_error.lock();
        slot.clear();
        // Keep it a short reason, not a stack.
        slot.push_str(&err.chars().take(240).collect::<String>());
    }

    // ---- Egress / region ----

    pub fn egress_ip(&self) -> String {
        self.egress_ip.read().clone()
    }

    pub fn region(&self) -> String {
        self.region.read().clone()
    }

    /// Store a probe result. Returns true when the region changed, which
    /// requires platform re-evaluation.
    pub fn set_egress(&self, ip: &str, region: &str, now_ns: i64) -> bool {
        *self.egress_ip.write() = ip.to_string();
        self.last_egress_update_ns.store(now_ns, Ordering::Release);
        let mut slot = self.region.write();
        let changed = !slot.eq_ignore_ascii_case(region);
        *slot = region.to_ascii_uppercase();
        changed
    }

    pub fn last_egress_update_ns(&self) -> i64 {
        self.last_egress_update_ns.load(Ordering::Acquire)
    }

    pub fn last_egress_attempt_ns(&self) -> i64 {
        self.last_egress_attempt_ns.load(Ordering::Acquire)
    }

    pub fn stamp_egress_attempt(&self, now_ns: i64) {
        self.last_egress_attempt_ns.store(now_ns, Ordering::Release);
    }

    pub fn last_latency_attempt_ns(&self) -> i64 {
        self.last_latency_attempt_ns.load(Ordering::Acquire)
    }

    pub fn stamp_latency_attempt(&self, now_ns: i64) {
        self.last_latency_attempt_ns.store(now_ns, Ordering::Release);
    }

    pub fn last_authority_attempt_ns(&self) -> i64 {
        self.last_authority_attempt_ns.load(Ordering::Acquire)
    }

    pub fn stamp_authority_attempt(&self, now_ns: i64) {
        self.last_authority_attempt_ns.store(now_ns, Ordering::Release);
    }

    // ---- Latency ----

    pub fn observe_latency(
        &self,
        domain: &str,
        rtt: std::time::Duration,
        now_ns: i64,
        half_life: std::time::Duration,
    ) {
        self.latency.lock().observe(domain, rtt, now_ns, half_life);
    }

    pub fn restore_latency(&self, domain: &str, sample: LatencySample) {
        self.latency.lock().restore(domain, sample);
    }

    pub fn latency_sample(&self, domain: &str) -> Option<LatencySample> {
        self.latency.lock().get(domain)
    }

    pub fn latency_snapshot(&self) -> Vec<(String, LatencySample)> {
        self.latency
            .lock()
            .iter()
            .map(|(d, s)| (d.to_string(), *s))
            .collect()
    }

    pub fn authority_score(
        &self,
        authorities: &[String],
        now_ns: i64,
        window: std::time::Duration,
    ) -> Option<f64> {
        self.latency.lock().authority_score(authorities, now_ns, window)
    }

    // ---- Ownership ----

    pub fn subscription_ids(&self) -> Vec<String> {
        self.subscription_ids.read().iter().cloned().collect()
    }

    pub fn owner_count(&self) -> usize {
        self.subscription_ids.read().len()
    }

    /// Returns true when the subscription was newly added as an owner.
    pub fn add_owner(&self, sub_id: &str) -> bool {
        let added = self.subscription_ids.write().insert(sub_id.to_string());
        if added {
            self.orphaned_at_ns.store(0, Ordering::Release);
        }
        added
    }

    /// Returns true when the owner set became empty.
    pub fn remove_owner(&self, sub_id: &str, now_ns: i64) -> bool {
        let mut owners = self.subscription_ids.write();
        owners.remove(sub_id);
        if owners.is_empty() {
            self.orphaned_at_ns.store(now_ns, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn orphaned_at_ns(&self) -> i64 {
        self.orphaned_at_ns.load(Ordering::Acquire)
    }

    /// Restore path: a node that came back from the store with no owners
    /// starts its orphan clock now.
    pub fn stamp_orphaned(&self, now_ns: i64) {
        if self.subscription_ids.read().is_empty() {
            self.orphaned_at_ns.store(now_ns, Ordering::Release);
        }
    }

    pub fn display_tags(&self) -> Vec<String> {
        self.display_tags.read().clone()
    }

    pub fn set_display_tags(&self, tags: Vec<String>) {
        *self.display_tags.write() = tags;
    }

    /// First display tag, or the short hash when untagged.
    pub fn primary_tag(&self) -> String {
        self.display_tags
            .read()
            .first()
            .cloned()
            .unwrap_or_else(|| short_hash(&self.hash).to_string())
    }

    // ---- Persistence ----

    pub fn to_static_row(&self) -> NodeStaticRow {
        NodeStaticRow {
            hash: self.hash.clone(),
            raw_options_blob: canonical_json(&self.raw_options),
            created_at_ns: self.created_at_ns,
        }
    }

    pub fn to_dynamic_row(&self) -> NodeDynamicRow {
        NodeDynamicRow {
            hash: self.hash.clone(),
            failure_count: self.failure_count(),
            circuit_open_since_ns: self.circuit_open_since_ns(),
            egress_ip: self.egress_ip(),
            egress_updated_at_ns: self.last_egress_update_ns(),
            region: self.region(),
            last_error: self.last_error(),
        }
    }

    pub fn restore_dynamic(&self, row: &NodeDynamicRow) {
        self.failure_count.store(row.failure_count, Ordering::Release);
        self.circuit_open_since_ns
            .store(row.circuit_open_since_ns, Ordering::Release);
        *self.egress_ip.write() = row.egress_ip.clone();
        *self.region.write() = row.region.to_ascii_uppercase();
        self.last_egress_update_ns
            .store(row.egress_updated_at_ns, Ordering::Release);
        self.set_last_error(&row.last_error);
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            hash: self.hash.clone(),
            kind: self
                .outbound()
                .map(|o| o.kind().to_string())
                .unwrap_or_default(),
            healthy: self.healthy(),
            egress_ip: self.egress_ip(),
            region: self.region(),
            failure_count: self.failure_count(),
            circuit_open_since_ns: self.circuit_open_since_ns(),
            display_tags: self.display_tags(),
            subscription_ids: self.subscription_ids(),
            last_error: self.last_error(),
            created_at_ns: self.created_at_ns,
        }
    }
}

/// Control-plane view of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub hash: NodeHash,
    pub kind: String,
    pub healthy: bool,
    pub egress_ip: String,
    pub region: String,
    pub failure_count: u32,
    pub circuit_open_since_ns: i64,
    pub display_tags: Vec<String>,
    pub subscription_ids: Vec<String>,
    pub last_error: String,
    pub created_at_ns: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::outbound::DirectOutbound;
    use serde_json::json;

    fn entry() -> NodeEntry {
        NodeEntry::new("h1".into(), json!({"type": "direct"}), 8, 1)
    }

    #[test]
    fn test_health_requires_outbound_and_closed_circuit() {
        let e = entry();
        assert!(!e.healthy()); // no outbound yet
        e.set_outbound(Some(Arc::new(DirectOutbound)));
        assert!(e.healthy());
        e.force_circuit(true, 10);
        assert!(!e.healthy());
        e.force_circuit(false, 20);
        assert!(e.healthy());
    }

    #[test]
    fn test_failure_threshold_opens_circuit_once() {
        let e = entry();
        assert!(!e.record_failure(3, 100));
        assert!(!e.record_failure(3, 101));
        assert!(e.record_failure(3, 102));
        assert_eq!(e.circuit_open_since_ns(), 102);
        // Further failures do not restamp.
        assert!(!e.record_failure(3, 103));
        assert_eq!(e.circuit_open_since_ns(), 102);
    }

    #[test]
    fn test_success_resets_failures_and_closes() {
        let e = entry();
        e.record_failure(2, 1);
        e.record_failure(2, 2);
        assert!(e.circuit_open_since_ns() > 0);
        assert!(e.record_success());
        assert_eq!(e.failure_count(), 0);
        assert_eq!(e.circuit_open_since_ns(), 0);
        assert!(!e.record_success());
    }

    #[test]
    fn test_owner_set_orphan_stamp() {
        let e = entry();
        assert!(e.add_owner("s1"));
        assert!(!e.add_owner("s1"));
        e.add_owner("s2");
        assert!(!e.remove_owner("s1", 50));
        assert_eq!(e.orphaned_at_ns(), 0);
        assert!(e.remove_owner("s2", 60));
        assert_eq!(e.orphaned_at_ns(), 60);
        // Re-adding an owner clears the orphan stamp.
        e.add_owner("s3");
        assert_eq!(e.orphaned_at_ns(), 0);
    }

    #[test]
    fn test_set_egress_reports_region_change() {
        let e = entry();
        assert!(e.set_egress("1.2.3.4", "hk", 5));
        assert_eq!(e.region(), "HK");
        assert!(!e.set_egress("1.2.3.5", "HK", 6));
        assert!(e.set_egress("1.2.3.5", "JP", 7));
    }

    #[test]
    fn test_primary_tag_falls_back_to_short_hash() {
        let e = NodeEntry::new(
            "0123456789abcdef0123456789abcdef".into(),
            json!({}),
            8,
            0,
        );
        assert_eq!(e.primary_tag(), "0123456789ab");
        e.set_display_tags(vec!["Sub/HK".into(), "Sub/2".into()]);
        assert_eq!(e.primary_tag(), "Sub/HK");
    }

    #[test]
    fn test_dynamic_row_roundtrip() {
        let e = entry();
        e.set_outbound(Some(Arc::new(DirectOutbound)));
        e.set_egress("9.9.9.9", "US", 77);
        e.record_failure(5, 78);
        e.set_last_error("dial timeout");
        let row = e.to_dynamic_row();

        let restored = entry();
        restored.restore_dynamic(&row);
        assert_eq!(restored.failure_count(), 1);
        assert_eq!(restored.egress_ip(), "9.9.9.9");
        assert_eq!(restored.region(), "US");
        assert_eq!(restored.last_error(), "dial timeout");
    }
}
