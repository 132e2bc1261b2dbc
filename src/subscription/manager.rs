// # Subscription manager
//
// CRUD over subscription records and the diff that binds fetched feed nodes
// into the pool. Control-plane mutations are persistence-first: the store
// write happens before memory changes, so a storage failure leaves the
// runtime untouched. Ephemeral subscriptions skip the store entirely and are
// re-fetched on start.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{validate_subscription_fields, FeedNode, ManagedNode, Subscription};
use crate::error::{ResinError, Result};
use crate::node::{identity_of, NodeHash, NodePool};
use crate::persist::{FlushEngine, StateStore, SubscriptionNodeRow, SubscriptionRow};
use crate::util::{now_ns, secs_to_ns};

pub struct SubscriptionState {
    pub record: RwLock<Subscription>,
    /// Serialises refreshes of this subscription.
    pub refresh_lock: tokio::sync::Mutex<()>,
}

/// Patchable subset of a subscription.
#[derive(Debug, Default, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub update_interval_secs: Option<u64>,
    pub enabled: Option<bool>,
    pub ephemeral: Option<bool>,
}

pub struct SubscriptionManager {
    subs: DashMap<String, Arc<SubscriptionState>>,
    pool: Arc<NodePool>,
    engine: Arc<FlushEngine>,
    store: Arc<dyn StateStore>,
}

impl SubscriptionManager {
    pub fn new(pool: Arc<NodePool>, engine: Arc<FlushEngine>, store: Arc<dyn StateStore>) -> Self {
        Self {
            subs: DashMap::new(),
            pool,
            engine,
            store,
        }
    }

    // ---- CRUD ----

    pub async fn create(
        &self,
        name: &str,
        url: &str,
        update_interval_secs: u64,
        enabled: bool,
        ephemeral: bool,
    ) -> Result<Subscription> {
        validate_subscription_fields(name, url, update_interval_secs)?;
        let now = now_ns();
        let sub = Subscription {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            url: url.to_string(),
            update_interval_ns: secs_to_ns(update_interval_secs),
            enabled,
            ephemeral,
            created_at_ns: now,
            updated_at_ns: now,
            last_refresh_at_ns: 0,
            last_refresh_error: String::new(),
            managed: HashMap::new(),
        };
        if !ephemeral {
            self.store.upsert_subscriptions(vec![sub.to_row()]).await?;
        }
        self.subs.insert(
            sub.id.clone(),
            Arc::new(SubscriptionState {
                record: RwLock::new(sub.clone()),
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
        );
        info!(id = %sub.id, name = %sub.name, "subscription created");
        Ok(sub)
    }

    pub fn get(&self, id: &str) -> Option<Subscription> {
        self.subs.get(id).map(|s| s.value().record.read().clone())
    }

    pub fn state(&self, id: &str) -> Option<Arc<SubscriptionState>> {
        self.subs.get(id).map(|s| s.value().clone())
    }

    pub fn list(&self) -> Vec<Subscription> {
        self.subs
            .iter()
            .map(|s| s.value().record.read().clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.subs.iter().map(|s| s.key().clone()).collect()
    }

    pub async fn patch(&self, id: &str, patch: SubscriptionPatch) -> Result<Subscription> {
        let state = self
            .state(id)
            .ok_or_else(|| ResinError::NotFound(format!("subscription {id}")))?;

        let mut next = state.record.read().clone();
        if let Some(name) = patch.name {
            next.name = name;
        }
        if let Some(url) = patch.url {
            next.url = url;
        }
        if let Some(secs) = patch.update_interval_secs {
            next.update_interval_ns = secs_to_ns(secs);
        }
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        let was_ephemeral = next.ephemeral;
        if let Some(ephemeral) = patch.ephemeral {
            next.ephemeral = ephemeral;
        }
        validate_subscription_fields(
            &next.name,
            &next.url,
            (next.update_interval_ns / 1_000_000_000) as u64,
        )?;
        next.updated_at_ns = now_ns();

        // Persist first; only then mutate memory.
        if next.ephemeral {
            if !was_ephemeral {
                self.store.delete_subscriptions(vec![id.to_string()]).await?;
                let keys: Vec<(String, String)> = next
                    .managed
                    .keys()
                    .map(|h| (id.to_string(), h.clone()))
                    .collect();
                self.store.delete_subscription_nodes(keys).await?;
            }
        } else {
            self.store.upsert_subscriptions(vec![next.to_row()]).await?;
        }

        let name_changed = {
            let mut record = state.record.write();
            let changed = record.name != next.name;
            *record = next.clone();
            changed
        };
        if name_changed {
            // Display tags embed the subscription name.
            for hash in next.managed.keys() {
                self.recompute_display_tags(hash);
            }
        }
        Ok(next)
    }

    /// Delete the record and unbind every managed node. Orphaned nodes stay
    /// in the pool until the ephemeral cleaner's grace period elapses.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let state = self
            .state(id)
            .ok_or_else(|| ResinError::NotFound(format!("subscription {id}")))?;
        let snapshot = state.record.read().clone();

        if !snapshot.ephemeral {
            self.store.delete_subscriptions(vec![id.to_string()]).await?;
            let keys: Vec<(String, String)> = snapshot
                .managed
                .keys()
                .map(|h| (id.to_string(), h.clone()))
                .collect();
            self.store.delete_subscription_nodes(keys).await?;
        }

        self.subs.remove(id);
        for (hash, managed) in &snapshot.managed {
            if !managed.evicted {
                self.pool.remove_from_subscription(hash, id);
            }
            self.recompute_display_tags(hash);
        }
        info!(id = %id, name = %snapshot.name, "subscription deleted");
        Ok(())
    }

    /// Unbind every currently-unhealthy managed node, marking the bindings
    /// evicted so the next refresh does not re-add them. Returns the count.
    pub fn cleanup_unhealthy(&self, id: &str) -> Result<usize> {
        let state = self
            .state(id)
            .ok_or_else(|| ResinError::NotFound(format!("subscription {id}")))?;
        let mut evicted = Vec::new();
        {
            let mut record = state.record.write();
            let ephemeral = record.ephemeral;
            for (hash, managed) in record.managed.iter_mut() {
                if managed.evicted {
                    continue;
                }
                let unhealthy = self.pool.get(hash).map_or(true, |n| !n.healthy());
                if unhealthy {
                    managed.evicted = true;
                    evicted.push(hash.clone());
                    if !ephemeral {
                        self.engine.mark_subscription_node(id, hash);
                    }
                }
            }
        }
        for hash in &evicted {
            self.pool.remove_from_subscription(hash, id);
            self.recompute_display_tags(hash);
        }
        info!(id = %id, count = evicted.len(), "cleanup-unhealthy");
        Ok(evicted.len())
    }

    // ---- Feed application ----

    /// Diff a fetched feed against the managed set: bind added nodes,
    /// refresh kept tags, unbind removed ones. Evicted bindings stay unbound
    /// until the feed drops them.
    pub fn apply_feed(&self, id: &str, feed: Vec<FeedNode>) -> Result<()> {
        let state = self
            .state(id)
            .ok_or_else(|| ResinError::NotFound(format!("subscription {id}")))?;

        let mut fetched: HashMap<NodeHash, FeedNode> = HashMap::new();
        for node in feed {
            fetched.insert(identity_of(&node.options), node);
        }

        let (ephemeral, previous): (bool, HashMap<NodeHash, ManagedNode>) = {
            let record = state.record.read();
            (record.ephemeral, record.managed.clone())
        };

        let mut added = 0usize;
        let mut removed = 0usize;
        let mut retagged: HashSet<NodeHash> = HashSet::new();
        let mut next: HashMap<NodeHash, ManagedNode> = HashMap::new();

        for (hash, node) in &fetched {
            match previous.get(hash) {
                Some(managed) if managed.evicted => {
                    // Still administratively out; keep the mark.
                    next.insert(hash.clone(), managed.clone());
                }
                Some(managed) => {
                    if managed.tags != node.tags {
                        retagged.insert(hash.clone());
                        if !ephemeral {
                            self.engine.mark_subscription_node(id, hash);
                        }
                    }
                    next.insert(
                        hash.clone(),
                        ManagedNode {
                            tags: node.tags.clone(),
                            evicted: false,
                        },
                    );
                }
                None => {
                    self.pool.add(&node.options, id);
                    next.insert(
                        hash.clone(),
                        ManagedNode {
                            tags: node.tags.clone(),
                            evicted: false,
                        },
                    );
                    if !ephemeral {
                        self.engine.mark_subscription_node(id, hash);
                    }
                    retagged.insert(hash.clone());
                    added += 1;
                }
            }
        }

        for (hash, managed) in &previous {
            if !fetched.contains_key(hash) {
                if !managed.evicted {
                    self.pool.remove_from_subscription(hash, id);
                }
                if !ephemeral {
                    self.engine.mark_subscription_node(id, hash);
                }
                retagged.insert(hash.clone());
                removed += 1;
            }
        }

        {
            let mut record = state.record.write();
            record.managed = next;
            record.last_refresh_at_ns = now_ns();
            record.last_refresh_error.clear();
        }
        for hash in &retagged {
            self.recompute_display_tags(hash);
        }
        debug!(id = %id, added, removed, kept = fetched.len() - added, "feed applied");
        Ok(())
    }

    pub fn record_refresh_error(&self, id: &str, error: &str) {
        if let Some(state) = self.state(id) {
            let mut record = state.record.write();
            record.last_refresh_at_ns = now_ns();
            record.last_refresh_error = error.chars().take(240).collect();
        }
    }

    /// A node's display tags are the union of `"{SubName}/{tag}"` across its
    /// non-evicted bindings.
    pub fn recompute_display_tags(&self, hash: &str) {
        if self.pool.get(hash).is_none() {
            return;
        }
        let mut tags = Vec::new();
        for entry in self.subs.iter() {
            let record = entry.value().record.read();
            if let Some(managed) = record.managed.get(hash) {
                if !managed.evicted {
                    for t in &managed.tags {
                        tags.push(format!("{}/{}", record.name, t));
                    }
                }
            }
        }
        tags.sort();
        self.pool.set_display_tags(hash, tags);
    }

    // ---- Snapshot reads for the flush engine ----

    pub fn snapshot_row(&self, id: &str) -> Option<SubscriptionRow> {
        let state = self.state(id)?;
        let record = state.record.read();
        if record.ephemeral {
            return None;
        }
        Some(record.to_row())
    }

    pub fn binding_row(&self, sub_id: &str, hash: &str) -> Option<SubscriptionNodeRow> {
        let state = self.state(sub_id)?;
        let record = state.record.read();
        if record.ephemeral {
            return None;
        }
        let managed = record.managed.get(hash)?;
        Some(SubscriptionNodeRow {
            subscription_id: sub_id.to_string(),
            node_hash: hash.to_string(),
            tags_json: serde_json::to_string(&managed.tags).unwrap_or_default(),
            evicted: managed.evicted,
        })
    }

    /// Restore path: install a record and its bindings without store writes.
    pub fn restore(&self, sub: Subscription) {
        self.subs.insert(
            sub.id.clone(),
            Arc::new(SubscriptionState {
                record: RwLock::new(sub),
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
        );
    }

    pub fn restore_binding(&self, sub_id: &str, hash: &str, managed: ManagedNode) {
        if let Some(state) = self.state(sub_id) {
            state
                .record
                .write()
                .managed
                .insert(hash.to_string(), managed);
        }
    }
}
