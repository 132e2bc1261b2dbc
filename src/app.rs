// # Application assembly
//
// Wires the components together, restores persisted state, and owns the
// lifecycle: event sources (listener, scheduler, probes, cleaners, GeoIP)
// stop first, then the flush worker runs its final drain, then the store
// closes.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{build_router, ApiState};
use crate::config::ConfigHandle;
use crate::error::Result;
use crate::events::EventBus;
use crate::geoip::{GeoIpService, GeoReaderOpener};
use crate::node::{NodePool, OutboundFactory, TransportPool};
use crate::persist::engine::SnapshotSource;
use crate::persist::{self, FlushEngine, StateStore};
use crate::platform::PlatformManager;
use crate::probe::ProbeManager;
use crate::proxy::{AccountHeaderRules, ForwardProxy, ProxyContext, ReverseProxy};
use crate::router::Router;
use crate::server::InboundServer;
use crate::settings::Settings;
use crate::subscription::{Downloader, SubscriptionManager, SubscriptionScheduler};

pub struct App {
    pub settings: Settings,
    pub config: Arc<ConfigHandle>,
    pub store: Arc<dyn StateStore>,
    pub engine: Arc<FlushEngine>,
    pub pool: Arc<NodePool>,
    pub events: Arc<EventBus>,
    pub router: Arc<Router>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub downloader: Arc<Downloader>,
    pub scheduler: Arc<SubscriptionScheduler>,
    pub geoip: Arc<GeoIpService>,
    pub probes: Arc<ProbeManager>,
    pub transports: Arc<TransportPool>,
    pub platforms: Arc<PlatformManager>,
    pub rules: Arc<AccountHeaderRules>,
    pub started_at: chrono::DateTime<Utc>,

    work_cancel: CancellationToken,
    flush_cancel: CancellationToken,
    work_tasks: Mutex<Vec<JoinHandle<()>>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

/// Read-side the flush engine consults when draining dirty keys.
struct AppSnapshotSource {
    pool: Arc<NodePool>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<Router>,
    rules: Arc<AccountHeaderRules>,
}

impl SnapshotSource for AppSnapshotSource {
    fn subscription(&self, id: &str) -> Option<persist::SubscriptionRow> {
        self.subscriptions.snapshot_row(id)
    }

    fn platform(&self, id: &str) -> Option<persist::PlatformRow> {
        self.pool.platform(id).map(|p| p.spec().to_row())
    }

    fn account_header_rule(&self, prefix: &str) -> Option<persist::AccountHeaderRuleRow> {
        self.rules.snapshot_row(prefix)
    }

    fn node_static(&self, hash: &str) -> Option<persist::NodeStaticRow> {
        self.pool.get(hash).map(|n| n.to_static_row())
    }

    fn node_dynamic(&self, hash: &str) -> Option<persist::NodeDynamicRow> {
        self.pool.get(hash).map(|n| n.to_dynamic_row())
    }

    fn node_latency(&self, hash: &str, domain: &str) -> Option<persist::NodeLatencyRow> {
        let entry = self.pool.get(hash)?;
        let sample = entry.latency_sample(domain)?;
        Some(persist::NodeLatencyRow {
            hash: hash.to_string(),
            domain: domain.to_string(),
            ewma_ns: sample.ewma_ns,
            last_updated_ns: sample.last_updated_ns,
        })
    }

    fn subscription_node(&self, sub_id: &str, hash: &str) -> Option<persist::SubscriptionNodeRow> {
        self.subscriptions.binding_row(sub_id, hash)
    }

    fn lease(&self, platform_id: &str, account: &str) -> Option<persist::LeaseRow> {
        self.router.get_lease(platform_id, account).map(|l| l.to_row())
    }
}

impl App {
    /// Construct and wire every component, then restore persisted state.
    /// Nothing is running yet; call `start` next.
    pub async fn build(
        settings: Settings,
        store: Arc<dyn StateStore>,
        outbound_factory: Arc<dyn OutboundFactory>,
        geo_opener: GeoReaderOpener,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(ConfigHandle::new(store.clone()));
        let engine = Arc::new(FlushEngine::new(store.clone(), config.clone()));
        let pool = Arc::new(NodePool::new(
            config.clone(),
            engine.clone(),
            outbound_factory,
            settings.latency_table_cap,
        ));
        let events = Arc::new(EventBus::new());
        let router = Arc::new(Router::new(
            pool.clone(),
            config.clone(),
            engine.clone(),
            events.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            pool.clone(),
            engine.clone(),
            store.clone(),
        ));
        let downloader = Arc::new(Downloader::new(pool.clone(), config.clone()));
        let scheduler = Arc::new(SubscriptionScheduler::new(
            subscriptions.clone(),
            downloader.clone(),
        ));
        let geoip = Arc::new(GeoIpService::new(
            settings.geoip_db_path.clone(),
            settings.cache_dir.clone(),
            geo_opener,
        ));
        let probes = Arc::new(ProbeManager::new(
            pool.clone(),
            config.clone(),
            geoip.clone(),
            engine.clone(),
            settings.probe_concurrency,
        ));
        let transports = Arc::new(TransportPool::new(
            settings.transport_pool_max_idle,
            std::time::Duration::from_secs(settings.transport_idle_timeout_secs),
        ));
        let platforms = Arc::new(PlatformManager::new(
            pool.clone(),
            router.clone(),
            store.clone(),
        ));
        let rules = Arc::new(AccountHeaderRules::new(store.clone()));

        // Membership callbacks: new nodes probe immediately; removed nodes
        // lose their leases and pooled transports.
        {
            let probes = probes.clone();
            pool.on_node_added(Arc::new(move |entry| {
                probes.trigger_immediate_egress(&entry.hash);
            }));
        }
        {
            let router = router.clone();
            let transports = transports.clone();
            pool.on_node_removed(Arc::new(move |entry| {
                router.evict_node(&entry.hash);
                transports.evict_node(&entry.hash);
            }));
        }

        engine.set_source(Arc::new(AppSnapshotSource {
            pool: pool.clone(),
            subscriptions: subscriptions.clone(),
            router: router.clone(),
            rules: rules.clone(),
        }));

        geoip.open_existing();
        persist::restore::restore(
            &store,
            &config,
            &pool,
            &subscriptions,
            &platforms,
            &router,
            &rules,
            settings.latency_table_cap,
        )
        .await?;

        Ok(Arc::new(Self {
            settings,
            config,
            store,
            engine,
            pool,
            events,
            router,
            subscriptions,
            downloader,
            scheduler,
            geoip,
            probes,
            transports,
            platforms,
            rules,
            started_at: Utc::now(),
            work_cancel: CancellationToken::new(),
            flush_cancel: CancellationToken::new(),
            work_tasks: Mutex::new(Vec::new()),
            flush_task: Mutex::new(None),
        }))
    }

    pub fn api_state(&self) -> Arc<ApiState> {
        Arc::new(ApiState {
            settings: self.settings.clone(),
            config: self.config.clone(),
            pool: self.pool.clone(),
            subscriptions: self.subscriptions.clone(),
            scheduler: self.scheduler.clone(),
            probes: self.probes.clone(),
            router: self.router.clone(),
            platforms: self.platforms.clone(),
            rules: self.rules.clone(),
            started_at: self.started_at,
        })
    }

    fn proxy_context(&self) -> Arc<ProxyContext> {
        Arc::new(ProxyContext {
            router: self.router.clone(),
            pool: self.pool.clone(),
            transports: self.transports.clone(),
            rules: self.rules.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        })
    }

    /// Spawn every long-running component and the inbound listener.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.settings.listen_addr()).await?;
        self.start_with_listener(listener).await
    }

    pub async fn start_with_listener(&self, listener: TcpListener) -> Result<()> {
        let ctx = self.proxy_context();
        let forward = Arc::new(ForwardProxy::new(ctx.clone()));
        let reverse = Arc::new(ReverseProxy::new(ctx));
        let control = build_router(self.api_state());
        let inbound = Arc::new(InboundServer::new(
            self.settings.proxy_token.clone(),
            control,
            forward,
            reverse,
            self.router.clone(),
        ));

        let mut tasks = self.work_tasks.lock();
        tasks.push(tokio::spawn({
            let inbound = inbound.clone();
            let cancel = self.work_cancel.clone();
            async move {
                if let Err(e) = inbound.run(listener, cancel).await {
                    warn!(error = %e, "inbound server exited");
                }
            }
        }));
        tasks.push(tokio::spawn(
            self.scheduler.clone().run(self.work_cancel.clone()),
        ));
        tasks.push(tokio::spawn(
            self.probes.clone().run(self.work_cancel.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::new(crate::sweep::LeaseCleaner::new(
                self.router.clone(),
                self.config.clone(),
            ))
            .run(self.work_cancel.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::new(crate::sweep::EphemeralCleaner::new(
                self.pool.clone(),
                self.config.clone(),
            ))
            .run(self.work_cancel.clone()),
        ));
        tasks.push(tokio::spawn(self.geoip.clone().run(
            self.downloader.clone(),
            self.config.clone(),
            self.work_cancel.clone(),
        )));
        *self.flush_task.lock() = Some(tokio::spawn(
            self.engine.clone().run(self.flush_cancel.clone()),
        ));
        info!("resin started");
        Ok(())
    }

    /// Ordered shutdown: event sources drain, the flush worker performs its
    /// final drain, then the store closes.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.work_cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.work_tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.flush_cancel.cancel();
        let flush = self.flush_task.lock().take();
        if let Some(task) = flush {
            let _ = task.await;
        }

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "state store close failed");
        }
        info!("shutdown complete");
    }
}
