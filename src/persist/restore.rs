// # Boot-time restore
//
// Loads the store into the live components before anything starts: config
// version, platforms (creating Default if absent), nodes with their dynamic
// state and latency tables, subscription records and bindings, header rules,
// and non-expired leases. Finishes with one full platform-view rebuild.

use std::sync::Arc;

use tracing::{info, warn};

use super::StateStore;
use crate::config::ConfigHandle;
use crate::node::entry::NodeEntry;
use crate::node::{identity_of, LatencySample, NodePool};
use crate::platform::{PlatformManager, PlatformSpec};
use crate::proxy::AccountHeaderRules;
use crate::router::Router;
use crate::subscription::{ManagedNode, Subscription, SubscriptionManager};
use crate::error::Result;
use crate::util::now_ns;

#[allow(clippy::too_many_arguments)]
pub async fn restore(
    store: &Arc<dyn StateStore>,
    config: &ConfigHandle,
    pool: &Arc<NodePool>,
    subscriptions: &SubscriptionManager,
    platforms: &PlatformManager,
    router: &Router,
    rules: &AccountHeaderRules,
    latency_table_cap: usize,
) -> Result<()> {
    let now = now_ns();

    if let Some(row) = store.load_system_config().await? {
        match config.seed(&row) {
            Ok(()) => info!(version = row.version, "runtime config restored"),
            Err(e) => warn!(error = %e, "persisted config rejected, using defaults"),
        }
    }

    for row in store.load_platforms().await? {
        match PlatformSpec::from_row(&row) {
            Ok(spec) => {
                if let Err(e) = pool.register_platform(spec) {
                    warn!(id = %row.id, error = %e, "platform restore failed");
                }
            }
            Err(e) => warn!(id = %row.id, error = %e, "platform row rejected"),
        }
    }
    platforms.ensure_default().await?;

    let dynamic_rows: std::collections::HashMap<String, _> = store
        .load_nodes_dynamic()
        .await?
        .into_iter()
        .map(|r| (r.hash.clone(), r))
        .collect();
    let mut restored_nodes = 0usize;
    for row in store.load_nodes_static().await? {
        let options: serde_json::Value = match serde_json::from_str(&row.raw_options_blob) {
            Ok(v) => v,
            Err(e) => {
                warn!(hash = %row.hash, error = %e, "node options blob rejected");
                continue;
            }
        };
        if identity_of(&options) != row.hash {
            warn!(hash = %row.hash, "node options blob does not re-hash to its key");
            continue;
        }
        let entry = Arc::new(NodeEntry::new(
            row.hash.clone(),
            options,
            latency_table_cap,
            row.created_at_ns,
        ));
        if let Some(dynamic) = dynamic_rows.get(&row.hash) {
            entry.restore_dynamic(dynamic);
        }
        pool.insert_restored(entry);
        restored_nodes += 1;
    }

    for row in store.load_node_latency().await? {
        if let Some(entry) = pool.get(&row.hash) {
            entry.restore_latency(
                &row.domain,
                LatencySample {
                    ewma_ns: row.ewma_ns,
                    last_updated_ns: row.last_updated_ns,
                },
            );
        }
    }

    for row in store.load_subscriptions().await? {
        subscriptions.restore(Subscription::from_row(&row));
    }
    for row in store.load_subscription_nodes().await? {
        let tags: Vec<String> = serde_json::from_str(&row.tags_json).unwrap_or_default();
        subscriptions.restore_binding(
            &row.subscription_id,
            &row.node_hash,
            ManagedNode {
                tags,
                evicted: row.evicted,
            },
        );
        if !row.evicted {
            if let Some(entry) = pool.get(&row.node_hash) {
                entry.add_owner(&row.subscription_id);
            }
        }
    }
    // Nodes with no surviving owner age out from now; owned nodes get their
    // display tags rebuilt from the restored bindings.
    let mut orphans = Vec::new();
    let mut owned = Vec::new();
    pool.range(|entry| {
        if entry.owner_count() == 0 {
            orphans.push(entry.clone());
        } else {
            owned.push(entry.hash.clone());
        }
        true
    });
    for entry in orphans {
        entry.stamp_orphaned(now);
    }
    for hash in owned {
        subscriptions.recompute_display_tags(&hash);
    }

    rules.restore(&store.load_account_header_rules().await?)?;

    let mut restored_leases = 0usize;
    for row in store.load_leases().await? {
        if row.expiry_ns <= now {
            continue;
        }
        if pool.platform(&row.platform_id).is_none() {
            continue;
        }
        router.restore_lease(&row);
        restored_leases += 1;
    }

    pool.rebuild_all_platforms();
    info!(
        nodes = restored_nodes,
        leases = restored_leases,
        platforms = pool.platforms_snapshot().len(),
        "state restored"
    );
    Ok(())
}
