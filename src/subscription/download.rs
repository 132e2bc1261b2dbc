// # Retrying downloader
//
// Shared fetch path for subscription feeds and GeoIP assets. The first
// attempt goes out directly; subsequent attempts are relayed through healthy
// pool nodes, with exponential backoff between attempts. The whole fetch is
// bounded by `resource_fetch_timeout_secs`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::ConfigHandle;
use crate::error::{ResinError, Result, UpstreamStage};
use crate::node::{NodeEntry, NodePool};
use crate::proxy::upstream::fetch_body;

const MAX_ATTEMPTS: usize = 4;
const BASE_BACKOFF: Duration = Duration::from_millis(250);

pub struct Downloader {
    pool: Arc<NodePool>,
    config: Arc<ConfigHandle>,
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(pool: Arc<NodePool>, config: Arc<ConfigHandle>) -> Self {
        Self {
            pool,
            config,
            client: reqwest::Client::builder()
                .user_agent(concat!("resin/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Fetch `url`, direct first, then via the pool, within the configured
    /// resource budget.
    pub async fn fetch(&self, url: &str) -> Result<Bytes> {
        let budget = Duration::from_secs(self.config.get().resource_fetch_timeout_secs);
        match tokio::time::timeout(budget, self.fetch_with_retries(url, budget)).await {
            Ok(res) => res,
            Err(_) => Err(ResinError::upstream(
                UpstreamStage::Timeout,
                format!("fetch budget exhausted for {url}"),
            )),
        }
    }

    async fn fetch_with_retries(&self, url: &str, budget: Duration) -> Result<Bytes> {
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                // 250ms, 500ms, 1s, ...
                tokio::time::sleep(BASE_BACKOFF * (1 << (attempt - 1))).await;
            }
            let result = if attempt == 0 {
                self.fetch_direct(url, budget).await
            } else {
                self.fetch_via_pool(url, budget).await
            };
            match result {
                Ok(body) => return Ok(body),
                Err(e) => {
                    debug!(url, attempt, error = %e, "fetch attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ResinError::Internal(format!("fetch produced no attempts for {url}"))
        }))
    }

    async fn fetch_direct(&self, url: &str, budget: Duration) -> Result<Bytes> {
        let response = self
            .client
            .get(url)
            .timeout(budget)
            .send()
            .await
            .map_err(|e| ResinError::upstream(UpstreamStage::Dial, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ResinError::upstream(
                UpstreamStage::Read,
                format!("unexpected status {status}"),
            ));
        }
        response
            .bytes()
            .await
            .map_err(|e| ResinError::upstream(UpstreamStage::Read, e.to_string()))
    }

    async fn fetch_via_pool(&self, url: &str, budget: Duration) -> Result<Bytes> {
        let node = self.pick_healthy_node().ok_or_else(|| {
            ResinError::NoHealthyNode("no node available to relay fetch".to_string())
        })?;
        let outbound = node.outbound().ok_or_else(|| {
            ResinError::upstream(UpstreamStage::Dial, "relay node lost its outbound".to_string())
        })?;
        warn!(url, relay = %node.hash, "direct fetch failed, relaying via pool");
        fetch_body(&outbound, url, budget).await
    }

    fn pick_healthy_node(&self) -> Option<Arc<NodeEntry>> {
        let mut healthy = Vec::new();
        self.pool.range(|entry| {
            if entry.healthy() {
                healthy.push(entry.clone());
            }
            true
        });
        if healthy.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..healthy.len());
        Some(healthy.swap_remove(idx))
    }
}
