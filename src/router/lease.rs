// # Lease table
//
// Sticky (platform, account) → node bindings in a striped concurrent map.
// The IP-load index (platform → egress IP → active lease count) is maintained
// inside the same critical section as the lease mutation, so per-key lease
// events observe a total order and the index never drifts from the table.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use serde::Serialize;

use crate::persist::LeaseRow;

const STRIPES: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lease {
    pub platform_id: String,
    pub account: String,
    pub node_hash: String,
    pub egress_ip: String,
    pub created_at_ns: i64,
    pub expiry_ns: i64,
    pub last_accessed_ns: i64,
}

impl Lease {
    pub fn expired(&self, now_ns: i64) -> bool {
        self.expiry_ns <= now_ns
    }

    pub fn to_row(&self) -> LeaseRow {
        LeaseRow {
            platform_id: self.platform_id.clone(),
            account: self.account.clone(),
            node_hash: self.node_hash.clone(),
            egress_ip: self.egress_ip.clone(),
            created_at_ns: self.created_at_ns,
            expiry_ns: self.expiry_ns,
            last_accessed_ns: self.last_accessed_ns,
        }
    }

    pub fn from_row(row: &LeaseRow) -> Self {
        Self {
            platform_id: row.platform_id.clone(),
            account: row.account.clone(),
            node_hash: row.node_hash.clone(),
            egress_ip: row.egress_ip.clone(),
            created_at_ns: row.created_at_ns,
            expiry_ns: row.expiry_ns,
            last_accessed_ns: row.last_accessed_ns,
        }
    }
}

struct Stripe {
    leases: HashMap<(String, String), Lease>,
    // (platform_id, egress_ip) → count, for PREFER_IDLE_IP.
    ip_load: HashMap<(String, String), i64>,
}

impl Stripe {
    fn new() -> Self {
        Self {
            leases: HashMap::new(),
            ip_load: HashMap::new(),
        }
    }
}

pub struct LeaseTable {
    stripes: Vec<Mutex<Stripe>>,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(Stripe::new())).collect(),
        }
    }

    fn stripe_for(&self, platform_id: &str, account: &str) -> &Mutex<Stripe> {
        let mut h = DefaultHasher::new();
        platform_id.hash(&mut h);
        account.hash(&mut h);
        &self.stripes[(h.finish() as usize) % STRIPES]
    }

    pub fn get(&self, platform_id: &str, account: &str) -> Option<Lease> {
        self.stripe_for(platform_id, account)
            .lock()
            .leases
            .get(&(platform_id.to_string(), account.to_string()))
            .cloned()
    }

    /// Refresh `last_accessed` and push out the expiry, calling `observe`
    /// with the updated lease while the stripe is held.
    pub fn touch_with(
        &self,
        platform_id: &str,
        account: &str,
        now_ns: i64,
        sticky_ttl_ns: i64,
        observe: impl FnOnce(&Lease),
    ) -> Option<Lease> {
        let mut stripe = self.stripe_for(platform_id, account).lock();
        let lease = stripe
            .leases
            .get_mut(&(platform_id.to_string(), account.to_string()))?;
        lease.last_accessed_ns = now_ns;
        lease.expiry_ns = now_ns.saturating_add(sticky_ttl_ns);
        let updated = lease.clone();
        observe(&updated);
        Some(updated)
    }

    /// Insert or replace; the previous lease (if any) is returned and
    /// `observe` runs under the stripe lock with (new, previous).
    pub fn upsert_with(
        &self,
        lease: Lease,
        observe: impl FnOnce(&Lease, Option<&Lease>),
    ) -> Option<Lease> {
        let key = (lease.platform_id.clone(), lease.account.clone());
        let mut stripe = self.stripe_for(&lease.platform_id, &lease.account).lock();
        let previous = stripe.leases.insert(key, lease.clone());
        if let Some(prev) = &previous {
            dec_load(&mut stripe.ip_load, &prev.platform_id, &prev.egress_ip);
        }
        inc_load(&mut stripe.ip_load, &lease.platform_id, &lease.egress_ip);
        observe(&lease, previous.as_ref());
        previous
    }

    pub fn remove_with(
        &self,
        platform_id: &str,
        account: &str,
        observe: impl FnOnce(&Lease),
    ) -> Option<Lease> {
        let mut stripe = self.stripe_for(platform_id, account).lock();
        let removed = stripe
            .leases
            .remove(&(platform_id.to_string(), account.to_string()))?;
        dec_load(&mut stripe.ip_load, &removed.platform_id, &removed.egress_ip);
        observe(&removed);
        Some(removed)
    }

    /// Restore path: insert without events. IP-load is rebuilt as rows land.
    pub fn restore(&self, lease: Lease) {
        self.upsert_with(lease, |_, _| {});
    }

    /// Active lease count for one (platform, egress IP).
    pub fn ip_load(&self, platform_id: &str, egress_ip: &str) -> i64 {
        let key = (platform_id.to_string(), egress_ip.to_string());
        self.stripes
            .iter()
            .map(|s| s.lock().ip_load.get(&key).copied().unwrap_or(0))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().leases.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self, platform_id: Option<&str>) -> Vec<Lease> {
        let mut out = Vec::new();
        for s in &self.stripes {
            let stripe = s.lock();
            for lease in stripe.leases.values() {
                if platform_id.map_or(true, |p| lease.platform_id == p) {
                    out.push(lease.clone());
                }
            }
        }
        out
    }

    /// Remove every lease the predicate selects. Each removal invokes
    /// `observe` under its stripe lock; returns the removed leases.
    pub fn remove_matching(
        &self,
        mut predicate: impl FnMut(&Lease) -> bool,
        mut observe: impl FnMut(&Lease),
    ) -> Vec<Lease> {
        let mut removed = Vec::new();
        for s in &self.stripes {
            let mut stripe = s.lock();
            let keys: Vec<(String, String)> = stripe
                .leases
                .values()
                .filter(|l| predicate(l))
                .map(|l| (l.platform_id.clone(), l.account.clone()))
                .collect();
            for key in keys {
                if let Some(lease) = stripe.leases.remove(&key) {
                    dec_load(&mut stripe.ip_load, &lease.platform_id, &lease.egress_ip);
                    observe(&lease);
                    removed.push(lease);
                }
            }
        }
        removed
    }
}

fn inc_load(load: &mut HashMap<(String, String), i64>, platform_id: &str, ip: &str) {
    *load
        .entry((platform_id.to_string(), ip.to_string()))
        .or_insert(0) += 1;
}

fn dec_load(load: &mut HashMap<(String, String), i64>, platform_id: &str, ip: &str) {
    let key = (platform_id.to_string(), ip.to_string());
    if let Some(v) = load.get_mut(&key) {
        *v -= 1;
        if *v <= 0 {
            load.remove(&key);
        }
    }
}
