// # In-memory state store
//
// The bundled `StateStore` implementation. Used by tests and by deployments
// that run without a database; state does not survive the process unless a
// real backend is plugged in.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    AccountHeaderRuleRow, LeaseRow, NodeDynamicRow, NodeLatencyRow, NodeStaticRow, PlatformRow,
    StateStore, SubscriptionNodeRow, SubscriptionRow, SystemConfigRow,
};
use crate::error::{ResinError, Result};

#[derive(Default)]
pub struct MemoryStore {
    subscriptions: Mutex<HashMap<String, SubscriptionRow>>,
    platforms: Mutex<HashMap<String, PlatformRow>>,
    account_header_rules: Mutex<HashMap<String, AccountHeaderRuleRow>>,
    system_config: Mutex<HashMap<u64, SystemConfigRow>>,
    nodes_static: Mutex<HashMap<String, NodeStaticRow>>,
    nodes_dynamic: Mutex<HashMap<String, NodeDynamicRow>>,
    node_latency: Mutex<HashMap<(String, String), NodeLatencyRow>>,
    subscription_nodes: Mutex<HashMap<(String, String), SubscriptionNodeRow>>,
    leases: Mutex<HashMap<(String, String), LeaseRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row counts per node-keyed table, for tests asserting cascade deletes.
    pub fn node_row_counts(&self, hash: &str) -> (usize, usize, usize) {
        let s = self
            .nodes_static
            .lock()
            .values()
            .filter(|r| r.hash == hash)
            .count();
        let d = self
            .nodes_dynamic
            .lock()
            .values()
            .filter(|r| r.hash == hash)
            .count();
        let l = self
            .node_latency
            .lock()
            .values()
            .filter(|r| r.hash == hash)
            .count();
        (s, d, l)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn upsert_subscriptions(&self, rows: Vec<SubscriptionRow>) -> Result<()> {
        let mut t = self.subscriptions.lock();
        for r in rows {
            t.insert(r.id.clone(), r);
        }
        Ok(())
    }

    async fn delete_subscriptions(&self, ids: Vec<String>) -> Result<()> {
        let mut t = self.subscriptions.lock();
        for id in ids {
            t.remove(&id);
        }
        Ok(())
    }

    async fn load_subscriptions(&self) -> Result<Vec<SubscriptionRow>> {
        Ok(self.subscriptions.lock().values().cloned().collect())
    }

    async fn upsert_platforms(&self, rows: Vec<PlatformRow>) -> Result<()> {
        let mut t = self.platforms.lock();
        for r in rows {
            // Platform name carries a uniqueness constraint.
            if t.values().any(|p| p.name == r.name && p.id != r.id) {
                return Err(ResinError::Storage(format!(
                    "platform name already taken: {}",
                    r.name
                )));
            }
            t.insert(r.id.clone(), r);
        }
        Ok(())
    }

    async fn delete_platforms(&self, ids: Vec<String>) -> Result<()> {
        let mut t = self.platforms.lock();
        for id in ids {
            t.remove(&id);
        }
        Ok(())
    }

    async fn load_platforms(&self) -> Result<Vec<PlatformRow>> {
        Ok(self.platforms.lock().values().cloned().collect())
    }

    async fn upsert_account_header_rules(&self, rows: Vec<AccountHeaderRuleRow>) -> Result<()> {
        let mut t = self.account_header_rules.lock();
        for r in rows {
            t.insert(r.url_prefix.clone(), r);
        }
        Ok(())
    }

    async fn delete_account_header_rules(&self, prefixes: Vec<String>) -> Result<()> {
        let mut t = self.account_header_rules.lock();
        for p in prefixes {
            t.remove(&p);
        }
        Ok(())
    }

    async fn load_account_header_rules(&self) -> Result<Vec<AccountHeaderRuleRow>> {
        Ok(self.account_header_rules.lock().values().cloned().collect())
    }

    async fn upsert_system_config(&self, row: SystemConfigRow) -> Result<()> {
        let mut t = self.system_config.lock();
        if t.contains_key(&row.version) {
            return Err(ResinError::Storage(format!(
                "system_config version already exists: {}",
                row.version
            )));
        }
        t.insert(row.version, row);
        Ok(())
    }

    async fn load_system_config(&self) -> Result<Option<SystemConfigRow>> {
        let t = self.system_config.lock();
        Ok(t.values().max_by_key(|r| r.version).cloned())
    }

    async fn upsert_nodes_static(&self, rows: Vec<NodeStaticRow>) -> Result<()> {
        let mut t = self.nodes_static.lock();
        for r in rows {
            t.insert(r.hash.clone(), r);
        }
        Ok(())
    }

    async fn delete_nodes_static(&self, hashes: Vec<String>) -> Result<()> {
        let mut t = self.nodes_static.lock();
        for h in hashes {
            t.remove(&h);
        }
        Ok(())
    }

    async fn load_nodes_static(&self) -> Result<Vec<NodeStaticRow>> {
        Ok(self.nodes_static.lock().values().cloned().collect())
    }

    async fn upsert_nodes_dynamic(&self, rows: Vec<NodeDynamicRow>) -> Result<()> {
        let mut t = self.nodes_dynamic.lock();
        for r in rows {
            t.insert(r.hash.clone(), r);
        }
        Ok(())
    }

    async fn delete_nodes_dynamic(&self, hashes: Vec<String>) -> Result<()> {
        let mut t = self.nodes_dynamic.lock();
        for h in hashes {
            t.remove(&h);
        }
        Ok(())
    }

    async fn load_nodes_dynamic(&self) -> Result<Vec<NodeDynamicRow>> {
        Ok(self.nodes_dynamic.lock().values().cloned().collect())
    }

    async fn upsert_node_latency(&self, rows: Vec<NodeLatencyRow>) -> Result<()> {
        let mut t = self.node_latency.lock();
        for r in rows {
            t.insert((r.hash.clone(), r.domain.clone()), r);
        }
        Ok(())
    }

    async fn delete_node_latency(&self, keys: Vec<(String, String)>) -> Result<()> {
        let mut t = self.node_latency.lock();
        for k in keys {
            t.remove(&k);
        }
        Ok(())
    }

    async fn load_node_latency(&self) -> Result<Vec<NodeLatencyRow>> {
        Ok(self.node_latency.lock().values().cloned().collect())
    }

    async fn upsert_subscription_nodes(&self, rows: Vec<SubscriptionNodeRow>) -> Result<()> {
        let mut t = self.subscription_nodes.lock();
        for r in rows {
            t.insert((r.subscription_id.clone(), r.node_hash.clone()), r);
        }
        Ok(())
    }

    async fn delete_subscription_nodes(&self, keys: Vec<(String, String)>) -> Result<()> {
        let mut t = self.subscription_nodes.lock();
        for k in keys {
            t.remove(&k);
        }
        Ok(())
    }

    async fn load_subscription_nodes(&self) -> Result<Vec<SubscriptionNodeRow>> {
        Ok(self.subscription_nodes.lock().values().cloned().collect())
    }

    async fn upsert_leases(&self, rows: Vec<LeaseRow>) -> Result<()> {
        let mut t = self.leases.lock();
        for r in rows {
            t.insert((r.platform_id.clone(), r.account.clone()), r);
        }
        Ok(())
    }

    async fn delete_leases(&self, keys: Vec<(String, String)>) -> Result<()> {
        let mut t = self.leases.lock();
        for k in keys {
            t.remove(&k);
        }
        Ok(())
    }

    async fn load_leases(&self) -> Result<Vec<LeaseRow>> {
        Ok(self.leases.lock().values().cloned().collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_config_version_is_monotone() {
        let store = MemoryStore::new();
        store
            .upsert_system_config(SystemConfigRow {
                version: 1,
                payload_json: "{}".into(),
                updated_at_ns: 1,
            })
            .await
            .unwrap();
        let dup = store
            .upsert_system_config(SystemConfigRow {
                version: 1,
                payload_json: "{}".into(),
                updated_at_ns: 2,
            })
            .await;
        assert!(dup.is_err());
        store
            .upsert_system_config(SystemConfigRow {
                version: 2,
                payload_json: r#"{"a":1}"#.into(),
                updated_at_ns: 3,
            })
            .await
            .unwrap();
        let latest = store.load_system_config().await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
    }

    #[tokio::test]
    async fn test_platform_name_unique() {
        let store = MemoryStore::new();
        let row = |id: &str, name: &str| PlatformRow {
            id: id.into(),
            name: name.into(),
            sticky_ttl_ns: 0,
            regex_filters_json: "[]".into(),
            region_filters_json: "[]".into(),
            reverse_proxy_miss_action: "RANDOM".into(),
            allocation_policy: "BALANCED".into(),
            updated_at_ns: 0,
        };
        store.upsert_platforms(vec![row("a", "one")]).await.unwrap();
        assert!(store.upsert_platforms(vec![row("b", "one")]).await.is_err());
        // Same id re-upserts fine.
        store.upsert_platforms(vec![row("a", "one")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store
            .delete_nodes_static(vec!["missing".into()])
            .await
            .unwrap();
        store
            .delete_leases(vec![("p".into(), "a".into())])
            .await
            .unwrap();
    }
}
