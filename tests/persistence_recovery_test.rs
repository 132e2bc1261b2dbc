// Crash-consistency scenarios: sticky routes surviving a restart, and
// dirty-set drains converging with pool membership.

use std::path::Path;
use std::sync::Arc;

use resin::geoip::{GeoReader, GeoReaderOpener};
use resin::node::DefaultOutboundFactory;
use resin::persist::{MemoryStore, StateStore};
use resin::platform::{AllocationPolicy, MissAction, PlatformCreate};
use resin::{App, Settings};
use serde_json::json;

struct NullGeoReader;

impl GeoReader for NullGeoReader {
    fn lookup(&self, _ip: std::net::IpAddr) -> Option<String> {
        None
    }
}

fn geo_opener() -> GeoReaderOpener {
    Arc::new(|_: &Path| Ok(Arc::new(NullGeoReader) as Arc<dyn GeoReader>))
}

async fn build_app(store: Arc<MemoryStore>) -> Arc<App> {
    App::build(
        Settings::default(),
        store,
        Arc::new(DefaultOutboundFactory),
        geo_opener(),
    )
    .await
    .expect("app builds")
}

#[tokio::test]
async fn test_restart_recovers_sticky_route() {
    let store = Arc::new(MemoryStore::new());

    // First process: create a platform, seed nodes, route once.
    let first_node;
    {
        let app = build_app(store.clone()).await;
        app.platforms
            .create(PlatformCreate {
                name: "RestartPlat".into(),
                sticky_ttl_secs: 3600,
                regex_filters: vec![],
                region_filters: vec![],
                reverse_proxy_miss_action: MissAction::Reject,
                allocation_policy: AllocationPolicy::Balanced,
            })
            .await
            .unwrap();
        app.pool.add(&json!({"type": "direct", "n": 1}), "s1");
        app.pool.add(&json!({"type": "direct", "n": 2}), "s1");

        let routed = app
            .router
            .route_request("RestartPlat", "acct-restart", "http://a.example/", false)
            .unwrap();
        assert!(routed.lease_created);
        first_node = routed.node_hash;

        app.engine.flush_now().await.unwrap();
        app.shutdown().await;
    }

    // Second process over the same store.
    let app = build_app(store).await;
    let routed = app
        .router
        .route_request("RestartPlat", "acct-restart", "http://b.example/", false)
        .unwrap();
    assert_eq!(routed.node_hash, first_node);
    assert!(!routed.lease_created);
}

#[tokio::test]
async fn test_dirty_set_recovery_deletes_node_rows() {
    let store = Arc::new(MemoryStore::new());
    let app = build_app(store.clone()).await;

    let (entry, _) = app.pool.add(&json!({"type": "direct", "probe": true}), "s1");
    entry.observe_latency(
        "ref.example",
        std::time::Duration::from_millis(42),
        resin::util::now_ns(),
        std::time::Duration::from_secs(600),
    );
    app.engine.mark_node_latency(&entry.hash, "ref.example");
    app.engine.flush_now().await.unwrap();
    assert_eq!(store.node_row_counts(&entry.hash), (1, 1, 1));

    // Delete from the pool; the same dirty keys now mean "delete rows".
    app.pool.remove_node(&entry.hash);
    app.engine.flush_now().await.unwrap();
    assert_eq!(store.node_row_counts(&entry.hash), (0, 0, 0));

    // A second drain with no new marks changes nothing.
    app.engine.flush_now().await.unwrap();
    assert_eq!(store.node_row_counts(&entry.hash), (0, 0, 0));
}

#[tokio::test]
async fn test_restart_restores_subscription_bindings() {
    let store = Arc::new(MemoryStore::new());
    let node_hash;
    let sub_id;
    {
        let app = build_app(store.clone()).await;
        let sub = app
            .subscriptions
            .create("Provider", "https://feed.example/nodes", 300, true, false)
            .await
            .unwrap();
        sub_id = sub.id.clone();
        app.subscriptions
            .apply_feed(
                &sub.id,
                vec![resin::subscription::FeedNode {
                    options: json!({"type": "direct", "n": 7}),
                    tags: vec!["HK-07".into()],
                }],
            )
            .unwrap();
        node_hash = app.pool.snapshot()[0].hash.clone();
        app.engine.flush_now().await.unwrap();
        app.shutdown().await;
    }

    let app = build_app(store).await;
    let entry = app.pool.get(&node_hash).expect("node restored");
    assert_eq!(entry.subscription_ids(), vec![sub_id.clone()]);
    assert_eq!(entry.display_tags(), vec!["Provider/HK-07".to_string()]);
    assert!(entry.orphaned_at_ns() == 0);
    let sub = app.subscriptions.get(&sub_id).unwrap();
    assert!(sub.managed.contains_key(&node_hash));
}

#[tokio::test]
async fn test_expired_leases_are_not_restored() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_leases(vec![resin::persist::LeaseRow {
            platform_id: "Default".into(),
            account: "stale".into(),
            node_hash: "deadbeef".into(),
            egress_ip: String::new(),
            created_at_ns: 1,
            expiry_ns: 2,
            last_accessed_ns: 1,
        }])
        .await
        .unwrap();
    let app = build_app(store).await;
    assert!(app.router.get_lease("Default", "stale").is_none());
}
