// # Subscriptions
//
// A subscription is a URL that enumerates nodes. The manager owns the
// records and their managed-node bindings (tags, eviction marks); the
// scheduler fetches feeds and diffs them against the pool; the downloader is
// the shared retrying fetch used by subscriptions and GeoIP.

pub mod download;
pub mod manager;
pub mod scheduler;

pub use download::Downloader;
pub use manager::SubscriptionManager;
pub use scheduler::SubscriptionScheduler;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ResinError, Result};
use crate::node::NodeHash;
use crate::persist::SubscriptionRow;

/// Smallest accepted refresh interval.
pub const MIN_UPDATE_INTERVAL_SECS: u64 = 60;

/// One node binding under a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedNode {
    pub tags: Vec<String>,
    /// Administratively unbound by cleanup-unhealthy. The binding is kept so
    /// the next refresh does not immediately re-add the node; it clears when
    /// the feed drops the node.
    pub evicted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,
    pub update_interval_ns: i64,
    pub enabled: bool,
    pub ephemeral: bool,
    pub created_at_ns: i64,
    pub updated_at_ns: i64,
    pub last_refresh_at_ns: i64,
    pub last_refresh_error: String,
    pub managed: HashMap<NodeHash, ManagedNode>,
}

impl Subscription {
    pub fn to_row(&self) -> SubscriptionRow {
        SubscriptionRow {
            id: self.id.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            update_interval_ns: self.update_interval_ns,
            enabled: self.enabled,
            ephemeral: self.ephemeral,
            created_at_ns: self.created_at_ns,
            updated_at_ns: self.updated_at_ns,
        }
    }

    pub fn from_row(row: &SubscriptionRow) -> Self {
        Self {
            id: row.id.clone(),
            name: row.name.clone(),
            url: row.url.clone(),
            update_interval_ns: row.update_interval_ns,
            enabled: row.enabled,
            ephemeral: row.ephemeral,
            created_at_ns: row.created_at_ns,
            updated_at_ns: row.updated_at_ns,
            last_refresh_at_ns: 0,
            last_refresh_error: String::new(),
            managed: HashMap::new(),
        }
    }
}

/// One entry of a fetched feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedNode {
    pub options: Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Parse a feed document: a JSON array of `{options, tags}` or an object
/// with a `nodes` array. Untagged entries default to their index.
pub fn parse_feed(body: &[u8]) -> Result<Vec<FeedNode>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ResinError::InvalidArgument(format!("feed is not JSON: {e}")))?;
    let items = match &value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("nodes") {
            Some(Value::Array(items)) => items.clone(),
            _ => {
                return Err(ResinError::InvalidArgument(
                    "feed object has no \"nodes\" array".to_string(),
                ))
            }
        },
        _ => {
            return Err(ResinError::InvalidArgument(
                "feed must be a JSON array or object".to_string(),
            ))
        }
    };
    let mut nodes = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let mut node: FeedNode = serde_json::from_value(item)
            .map_err(|e| ResinError::InvalidArgument(format!("feed entry {idx}: {e}")))?;
        if !node.options.is_object() {
            return Err(ResinError::InvalidArgument(format!(
                "feed entry {idx}: options must be an object"
            )));
        }
        if node.tags.is_empty() {
            node.tags = vec![idx.to_string()];
        }
        nodes.push(node);
    }
    Ok(nodes)
}

pub fn validate_subscription_fields(name: &str, url: &str, update_interval_secs: u64) -> Result<()> {
    if name.is_empty() {
        return Err(ResinError::InvalidArgument(
            "subscription name must not be empty".to_string(),
        ));
    }
    let uri: http::Uri = url
        .parse()
        .map_err(|_| ResinError::InvalidArgument(format!("subscription url is not a URL: {url}")))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(ResinError::InvalidArgument(format!(
                "subscription url must be http(s): {url}"
            )))
        }
    }
    if update_interval_secs < MIN_UPDATE_INTERVAL_SECS {
        return Err(ResinError::InvalidArgument(format!(
            "update_interval must be at least {MIN_UPDATE_INTERVAL_SECS}s"
        )));
    }
    Ok(())
}
