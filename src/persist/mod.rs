// # Persistence
//
// The routing core never writes storage inline. Mutations mark dirty-sets on
// the flush engine; a worker drains them into the `StateStore` in batches.
// The store itself is backend-agnostic: this module fixes the table shapes
// and the trait, `memory` provides the bundled implementation, `engine` the
// dirty-set flush worker, and `restore` the boot-time load.

pub mod engine;
pub mod memory;
pub mod restore;

pub use engine::{FlushEngine, SnapshotSource};
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub id: String,
    pub name: String,
    pub url: String,
    pub update_interval_ns: i64,
    pub enabled: bool,
    pub ephemeral: bool,
    pub created_at_ns: i64,
    pub updated_at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformRow {
    pub id: String,
    pub name: String,
    pub sticky_ttl_ns: i64,
    pub regex_filters_json: String,
    pub region_filters_json: String,
    pub reverse_proxy_miss_action: String,
    pub allocation_policy: String,
    pub updated_at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountHeaderRuleRow {
    pub url_prefix: String,
    pub headers_json: String,
    pub updated_at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfigRow {
    pub version: u64,
    pub payload_json: String,
    pub updated_at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStaticRow {
    pub hash: String,
    pub raw_options_blob: String,
    pub created_at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDynamicRow {
    pub hash: String,
    pub failure_count: u32,
    pub circuit_open_since_ns: i64,
    pub egress_ip: String,
    pub egress_updated_at_ns: i64,
    pub region: String,
    pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLatencyRow {
    pub hash: String,
    pub domain: String,
    pub ewma_ns: i64,
    pub last_updated_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionNodeRow {
    pub subscription_id: String,
    pub node_hash: String,
    pub tags_json: String,
    pub evicted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRow {
    pub platform_id: String,
    pub account: String,
    pub node_hash: String,
    pub egress_ip: String,
    pub created_at_ns: i64,
    pub expiry_ns: i64,
    pub last_accessed_ns: i64,
}

/// Key/value-style storage backend. Each method is transactional per call;
/// a failed call must leave the table unchanged. Batches may be empty.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn upsert_subscriptions(&self, rows: Vec<SubscriptionRow>) -> Result<()>;
    async fn delete_subscriptions(&self, ids: Vec<String>) -> Result<()>;
    async fn load_subscriptions(&self) -> Result<Vec<SubscriptionRow>>;

    async fn upsert_platforms(&self, rows: Vec<PlatformRow>) -> Result<()>;
    async fn delete_platforms(&self, ids: Vec<String>) -> Result<()>;
    async fn load_platforms(&self) -> Result<Vec<PlatformRow>>;

    async fn upsert_account_header_rules(&self, rows: Vec<AccountHeaderRuleRow>) -> Result<()>;
    async fn delete_account_header_rules(&self, prefixes: Vec<String>) -> Result<()>;
    async fn load_account_header_rules(&self) -> Result<Vec<AccountHeaderRuleRow>>;

    /// Inserts a new config version. Versions are monotone; inserting a
    /// version that already exists is a storage error.
    async fn upsert_system_config(&self, row: SystemConfigRow) -> Result<()>;
    /// Returns the highest-version config row, if any.
    async fn load_system_config(&self) -> Result<Option<SystemConfigRow>>;

    async fn upsert_nodes_static(&self, rows: Vec<NodeStaticRow>) -> Result<()>;
    async fn delete_nodes_static(&self, hashes: Vec<String>) -> Result<()>;
    async fn load_nodes_static(&self) -> Result<Vec<NodeStaticRow>>;

    async fn upsert_nodes_dynamic(&self, rows: Vec<NodeDynamicRow>) -> Result<()>;
    async fn delete_nodes_dynamic(&self, hashes: Vec<String>) -> Result<()>;
    async fn load_nodes_dynamic(&self) -> Result<Vec<NodeDynamicRow>>;

    async fn upsert_node_latency(&self, rows: Vec<NodeLatencyRow>) -> Result<()>;
    async fn delete_node_latency(&self, keys: Vec<(String, String)>) -> Result<()>;
    async fn load_node_latency(&self) -> Result<Vec<NodeLatencyRow>>;

    async fn upsert_subscription_nodes(&self, rows: Vec<SubscriptionNodeRow>) -> Result<()>;
    async fn delete_subscription_nodes(&self, keys: Vec<(String, String)>) -> Result<()>;
    async fn load_subscription_nodes(&self) -> Result<Vec<SubscriptionNodeRow>>;

    async fn upsert_leases(&self, rows: Vec<LeaseRow>) -> Result<()>;
    async fn delete_leases(&self, keys: Vec<(String, String)>) -> Result<()>;
    async fn load_leases(&self) -> Result<Vec<LeaseRow>>;

    async fn close(&self) -> Result<()>;
}
