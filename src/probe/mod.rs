// # Probe manager
//
// Per-node egress and latency probes. A scheduler pass scans the pool for
// nodes whose last attempt is older than the configured max interval and
// queues work; a bounded worker pool services the queue, so load is capped by
// saturation rather than by dropping probes. Immediate egress probes (new
// nodes, operator requests) jump the queue.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::error::{ResinError, Result, UpstreamStage};
use crate::geoip::GeoIpService;
use crate::node::{NodeEntry, NodeHash, NodePool};
use crate::persist::FlushEngine;
use crate::proxy::upstream::{fetch_body, Target};
use crate::util::{now_ns, secs_to_ns};

const SCHEDULE_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Egress,
    Latency,
    AuthorityLatency,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProbeTask {
    hash: NodeHash,
    kind: ProbeKind,
}

pub struct ProbeManager {
    pool: Arc<NodePool>,
    config: Arc<ConfigHandle>,
    geoip: Arc<GeoIpService>,
    engine: Arc<FlushEngine>,
    concurrency: usize,

    queue: Mutex<VecDeque<ProbeTask>>,
    // Tasks queued or in flight, to avoid duplicate scheduling.
    pending: Mutex<HashSet<ProbeTask>>,
    wake: Notify,
}

impl ProbeManager {
    pub fn new(
        pool: Arc<NodePool>,
        config: Arc<ConfigHandle>,
        geoip: Arc<GeoIpService>,
        engine: Arc<FlushEngine>,
        concurrency: usize,
    ) -> Self {
        Self {
            pool,
            config,
            geoip,
            engine,
            concurrency: concurrency.max(1),
            queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashSet::new()),
            wake: Notify::new(),
        }
    }

    /// Queue an egress probe at the head. Non-blocking; safe from callbacks.
    pub fn trigger_immediate_egress(&self, hash: &str) {
        let task = ProbeTask {
            hash: hash.to_string(),
            kind: ProbeKind::Egress,
        };
        if self.pending.lock().insert(task.clone()) {
            self.queue.lock().push_front(task);
            self.wake.notify_one();
        }
    }

    /// Queue a probe at the tail (operator request or scheduler pass).
    pub fn enqueue(&self, hash: &str, kind: ProbeKind) {
        let task = ProbeTask {
            hash: hash.to_string(),
            kind,
        };
        if self.pending.lock().insert(task.clone()) {
            self.queue.lock().push_back(task);
            self.wake.notify_one();
        }
    }

    fn pop(&self) -> Option<ProbeTask> {
        self.queue.lock().pop_front()
    }

    /// Scan the pool for due probes. Attempt stamps gate scheduling, so a
    /// failing node is retried on the same cadence as a healthy one.
    fn schedule_pass(&self) {
        let cfg = self.config.get();
        let now = now_ns();
        let egress_due = secs_to_ns(cfg.max_egress_test_interval_secs);
        let latency_due = secs_to_ns(cfg.max_latency_test_interval_secs);
        let authority_due = secs_to_ns(cfg.max_authority_latency_test_interval_secs);

        let mut due = Vec::new();
        self.pool.range(|entry| {
            if now - entry.last_egress_attempt_ns() >= egress_due {
                due.push((entry.hash.clone(), ProbeKind::Egress));
            }
            if now - entry.last_latency_attempt_ns() >= latency_due {
                due.push((entry.hash.clone(), ProbeKind::Latency));
            }
            if now - entry.last_authority_attempt_ns() >= authority_due {
                due.push((entry.hash.clone(), ProbeKind::AuthorityLatency));
            }
            true
        });
        for (hash, kind) in due {
            self.enqueue(&hash, kind);
        }
    }

    /// Scheduler plus `concurrency` workers, all bound to `cancel`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(workers = self.concurrency, "probe manager started");
        let mut handles = Vec::with_capacity(self.concurrency + 1);

        let scheduler = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    this.schedule_pass();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(SCHEDULE_TICK) => {}
                    }
                }
            })
        };
        handles.push(scheduler);

        for worker in 0..self.concurrency {
            let this = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let task = match this.pop() {
                        Some(t) => t,
                        None => {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = this.wake.notified() => continue,
                            }
                        }
                    };
                    // A panicking probe must not take the worker with it.
                    let run = std::panic::AssertUnwindSafe(this.execute(task.clone()))
                        .catch_unwind();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = run => {
                            if result.is_err() {
                                warn!(worker, hash = %task.hash, "probe panicked");
                            }
                        }
                    }
                    this.pending.lock().remove(&task);
                }
            }));
        }

        cancel.cancelled().await;
        self.wake.notify_waiters();
        for h in handles {
            let _ = h.await;
        }
        info!("probe manager stopped");
    }

    async fn execute(&self, task: ProbeTask) {
        let Some(entry) = self.pool.get(&task.hash) else {
            return;
        };
        let result = match task.kind {
            ProbeKind::Egress => self.probe_egress(&entry).await,
            ProbeKind::Latency => self.probe_latency(&entry).await,
            ProbeKind::AuthorityLatency => self.probe_authorities(&entry).await,
        };
        match result {
            Ok(()) => self.pool.record_result(&task.hash, true),
            Err(e) => {
                entry.set_last_error(&e.to_string());
                self.pool.record_result(&task.hash, false);
                debug!(hash = %task.hash, kind = ?task.kind, error = %e, "probe failed");
            }
        }
    }

    /// Egress probe: the echo endpoint's first response line is our public
    /// IP as seen from the node. Region comes from GeoIP.
    pub async fn probe_egress(&self, entry: &Arc<NodeEntry>) -> Result<()> {
        let cfg = self.config.get();
        entry.stamp_egress_attempt(now_ns());
        let outbound = entry.outbound().ok_or_else(|| {
            ResinError::upstream(UpstreamStage::Dial, "no outbound".to_string())
        })?;
        let body = fetch_body(
            &outbound,
            &cfg.egress_echo_url,
            Duration::from_secs(cfg.probe_timeout_secs),
        )
        .await?;
        let text = String::from_utf8_lossy(&body);
        let line = text.lines().next().unwrap_or("").trim();
        let ip: IpAddr = line.parse().map_err(|_| {
            ResinError::upstream(
                UpstreamStage::Read,
                format!("egress echo returned no IP: {line:?}"),
            )
        })?;
        let region = self.geoip.lookup(ip).unwrap_or_default();
        self.pool.update_egress(&entry.hash, &ip.to_string(), &region);
        Ok(())
    }

    /// Plain latency probe against `latency_test_url`.
    pub async fn probe_latency(&self, entry: &Arc<NodeEntry>) -> Result<()> {
        let cfg = self.config.get();
        entry.stamp_latency_attempt(now_ns());
        let domain = Target::parse(&cfg.latency_test_url)?.host;
        self.timed_fetch(entry, &cfg.latency_test_url, &domain, &cfg)
            .await
    }

    /// Authority probes: one sample per reference domain. The probe counts
    /// as successful when any authority answered.
    pub async fn probe_authorities(&self, entry: &Arc<NodeEntry>) -> Result<()> {
        let cfg = self.config.get();
        entry.stamp_authority_attempt(now_ns());
        let mut last_err: Option<ResinError> = None;
        let mut any_ok = false;
        for domain in &cfg.latency_authorities {
            let url = format!("https://{domain}/");
            match self.timed_fetch(entry, &url, domain, &cfg).await {
                Ok(()) => any_ok = true,
                Err(e) => last_err = Some(e),
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(last_err.unwrap_or_else(|| {
                ResinError::InvalidArgument("no latency authorities configured".to_string())
            }))
        }
    }

    async fn timed_fetch(
        &self,
        entry: &Arc<NodeEntry>,
        url: &str,
        domain: &str,
        cfg: &crate::config::RuntimeConfig,
    ) -> Result<()> {
        let outbound = entry.outbound().ok_or_else(|| {
            ResinError::upstream(UpstreamStage::Dial, "no outbound".to_string())
        })?;
        let started = Instant::now();
        fetch_body(
            &outbound,
            url,
            Duration::from_secs(cfg.probe_timeout_secs),
        )
        .await?;
        let rtt = started.elapsed();
        entry.observe_latency(
            domain,
            rtt,
            now_ns(),
            Duration::from_secs(cfg.latency_decay_window_secs),
        );
        self.engine.mark_node_latency(&entry.hash, domain);
        debug!(hash = %entry.hash, domain, rtt_ms = rtt.as_millis() as u64, "latency sample");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DefaultOutboundFactory;
    use crate::persist::MemoryStore;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Fixture {
        pool: Arc<NodePool>,
        config: Arc<ConfigHandle>,
        probes: Arc<ProbeManager>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(ConfigHandle::new(store.clone()));
        let engine = Arc::new(FlushEngine::new(store, config.clone()));
        let pool = Arc::new(NodePool::new(
            config.clone(),
            engine.clone(),
            Arc::new(DefaultOutboundFactory),
            8,
        ));
        let geoip = Arc::new(GeoIpService::new(
            std::env::temp_dir().join("resin-test-absent.mmdb"),
            std::env::temp_dir(),
            Arc::new(|_: &std::path::Path| {
                Err(ResinError::Internal("no reader in tests".to_string()))
            }),
        ));
        let probes = Arc::new(ProbeManager::new(
            pool.clone(),
            config.clone(),
            geoip,
            engine,
            2,
        ));
        Fixture {
            pool,
            config,
            probes,
        }
    }

    async fn echo_ip_server(ip: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = sock.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
                        ip.len(),
                        ip
                    );
                    let _ = sock.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_egress_probe_stores_ip() {
        let f = fixture();
        let addr = echo_ip_server("203.0.113.77").await;
        f.config
            .patch(serde_json::json!({
                "egress_echo_url": format!("http://{addr}/")
            }))
            .await
            .unwrap();
        let (entry, _) = f.pool.add(&json!({"type": "direct"}), "s1");

        f.probes.probe_egress(&entry).await.unwrap();
        assert_eq!(entry.egress_ip(), "203.0.113.77");
        assert!(entry.last_egress_update_ns() > 0);
        assert!(entry.last_egress_attempt_ns() > 0);
    }

    #[tokio::test]
    async fn test_egress_probe_garbage_body_fails() {
        let f = fixture();
        let addr = echo_ip_server("not-an-ip").await;
        f.config
            .patch(serde_json::json!({
                "egress_echo_url": format!("http://{addr}/")
            }))
            .await
            .unwrap();
        let (entry, _) = f.pool.add(&json!({"type": "direct"}), "s1");
        let err = f.probes.probe_egress(&entry).await.unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_READ");
        // Attempt stamp advanced even though the probe failed.
        assert!(entry.last_egress_attempt_ns() > 0);
        assert_eq!(entry.last_egress_update_ns(), 0);
    }

    #[tokio::test]
    async fn test_latency_probe_records_sample() {
        let f = fixture();
        let addr = echo_ip_server("ok").await;
        f.config
            .patch(serde_json::json!({
                "latency_test_url": format!("http://{addr}/ping")
            }))
            .await
            .unwrap();
        let (entry, _) = f.pool.add(&json!({"type": "direct"}), "s1");
        f.probes.probe_latency(&entry).await.unwrap();
        let domain = addr.ip().to_string();
        assert!(entry.latency_sample(&domain).is_some());
    }

    #[tokio::test]
    async fn test_immediate_trigger_jumps_queue() {
        let f = fixture();
        f.probes.enqueue("tail-1", ProbeKind::Latency);
        f.probes.enqueue("tail-2", ProbeKind::Latency);
        f.probes.trigger_immediate_egress("head");
        let first = f.probes.pop().unwrap();
        assert_eq!(first.hash, "head");
        assert_eq!(first.kind, ProbeKind::Egress);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_coalesced() {
        let f = fixture();
        f.probes.enqueue("h", ProbeKind::Latency);
        f.probes.enqueue("h", ProbeKind::Latency);
        f.probes.enqueue("h", ProbeKind::Egress);
        assert!(f.probes.pop().is_some());
        assert!(f.probes.pop().is_some());
        assert!(f.probes.pop().is_none());
    }
}
