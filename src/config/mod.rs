// # Runtime configuration
//
// Hot-reloadable settings published as an immutable snapshot behind an atomic
// pointer. Readers pay one `ArcSwap::load` per request; writers serialise on
// a process-wide mutex and go through validate → persist → publish, in that
// order, so a failure anywhere leaves both the in-memory pointer and the
// persisted version untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::Uri;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ResinError, Result};
use crate::persist::{StateStore, SystemConfigRow};
use crate::util::now_ns;

/// Probe intervals below this are rejected to keep probe traffic bounded.
pub const MIN_PROBE_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Consecutive failures that open a node's circuit.
    pub max_consecutive_failures: u32,
    /// Upper bound between egress-IP probes per node, seconds.
    pub max_egress_test_interval_secs: u64,
    /// Upper bound between plain latency probes per node, seconds.
    pub max_latency_test_interval_secs: u64,
    /// Upper bound between authority latency probes per node, seconds.
    pub max_authority_latency_test_interval_secs: u64,
    /// Per-probe timeout, seconds.
    pub probe_timeout_secs: u64,
    /// EWMA half-life for latency samples, seconds.
    pub latency_decay_window_secs: u64,
    /// Age beyond which a latency sample no longer counts for P2C, seconds.
    pub p2c_latency_window_secs: u64,
    /// URL fetched by the plain latency probe.
    pub latency_test_url: String,
    /// URL whose response body's first line is the caller's public IP.
    pub egress_echo_url: String,
    /// Reference domains whose EWMA represents a node's reference latency.
    pub latency_authorities: Vec<String>,
    /// How long an orphaned node survives before eviction, seconds.
    pub ephemeral_node_evict_delay_secs: u64,
    /// Cache flush cadence, seconds.
    pub cache_flush_interval_secs: u64,
    /// Dirty-key count that triggers an early flush.
    pub cache_flush_dirty_threshold: usize,
    /// Budget for subscription/GeoIP downloads including retries, seconds.
    pub resource_fetch_timeout_secs: u64,
    /// Lease cleaner cadence, seconds.
    pub lease_sweep_interval_secs: u64,
    /// Ephemeral cleaner cadence, seconds.
    pub ephemeral_sweep_interval_secs: u64,
    /// GeoIP refresh cadence, seconds.
    pub geoip_refresh_interval_secs: u64,
    /// Release-metadata URL for GeoIP refresh; empty disables the job.
    pub geoip_download_url: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            max_egress_test_interval_secs: 3600,
            max_latency_test_interval_secs: 600,
            max_authority_latency_test_interval_secs: 1800,
            probe_timeout_secs: 15,
            latency_decay_window_secs: 600,
            p2c_latency_window_secs: 1800,
            latency_test_url: "https://www.gstatic.com/generate_204".to_string(),
            egress_echo_url: "https://api.ipify.org/".to_string(),
            latency_authorities: vec!["www.gstatic.com".to_string()],
            ephemeral_node_evict_delay_secs: 1800,
            cache_flush_interval_secs: 30,
            cache_flush_dirty_threshold: 128,
            resource_fetch_timeout_secs: 60,
            lease_sweep_interval_secs: 60,
            ephemeral_sweep_interval_secs: 60,
            geoip_refresh_interval_secs: 86_400,
            geoip_download_url: String::new(),
        }
    }
}

impl RuntimeConfig {
    /// Validate the whole record, normalising where the spec allows it: the
    /// authority domain of `latency_test_url` is appended to
    /// `latency_authorities` when missing.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        for (name, v) in [
            (
                "max_egress_test_interval_secs",
                self.max_egress_test_interval_secs,
            ),
            (
                "max_latency_test_interval_secs",
                self.max_latency_test_interval_secs,
            ),
            (
                "max_authority_latency_test_interval_secs",
                self.max_authority_latency_test_interval_secs,
            ),
        ] {
            if v < MIN_PROBE_INTERVAL_SECS {
                return Err(ResinError::InvalidArgument(format!(
                    "{name} must be at least {MIN_PROBE_INTERVAL_SECS}s, got {v}"
                )));
            }
        }
        for (name, v) in [
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("latency_decay_window_secs", self.latency_decay_window_secs),
            ("p2c_latency_window_secs", self.p2c_latency_window_secs),
            (
                "resource_fetch_timeout_secs",
                self.resource_fetch_timeout_secs,
            ),
            (
                "lease_sweep_interval_secs",
                self.lease_sweep_interval_secs,
            ),
            (
                "ephemeral_sweep_interval_secs",
                self.ephemeral_sweep_interval_secs,
            ),
            (
                "cache_flush_interval_secs",
                self.cache_flush_interval_secs,
            ),
        ] {
            if v == 0 {
                return Err(ResinError::InvalidArgument(format!(
                    "{name} must be positive"
                )));
            }
        }
        if self.max_consecutive_failures == 0 {
            return Err(ResinError::InvalidArgument(
                "max_consecutive_failures must be positive".to_string(),
            ));
        }
        if self.cache_flush_dirty_threshold == 0 {
            return Err(ResinError::InvalidArgument(
                "cache_flush_dirty_threshold must be positive".to_string(),
            ));
        }

        let latency_host = require_http_url("latency_test_url", &self.latency_test_url)?;
        require_http_url("egress_echo_url", &self.egress_echo_url)?;
        if !self.geoip_download_url.is_empty() {
            require_http_url("geoip_download_url", &self.geoip_download_url)?;
        }
        for d in &self.latency_authorities {
            if d.is_empty() || d.contains('/') || d.contains(':') {
                return Err(ResinError::InvalidArgument(format!(
                    "latency_authorities entry is not a bare domain: {d}"
                )));
            }
        }
        if !self
            .latency_authorities
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&latency_host))
        {
            self.latency_authorities.push(latency_host);
        }
        Ok(())
    }
}

fn require_http_url(field: &str, value: &str) -> Result<String> {
    let uri: Uri = value
        .parse()
        .map_err(|_| ResinError::InvalidArgument(format!("{field} is not a URL: {value}")))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(ResinError::InvalidArgument(format!(
                "{field} must be an http(s) URL: {value}"
            )))
        }
    }
    let host = uri
        .host()
        .ok_or_else(|| ResinError::InvalidArgument(format!("{field} has no host: {value}")))?;
    Ok(host.to_string())
}

/// Shared handle to the live config snapshot. Cheap to clone via `Arc`.
pub struct ConfigHandle {
    current: ArcSwap<RuntimeConfig>,
    version: AtomicU64,
    store: Arc<dyn StateStore>,
    // Serialises writers; never held by readers.
    write_lock: tokio::sync::Mutex<()>,
}

impl ConfigHandle {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let mut initial = RuntimeConfig::default();
        // Defaults are valid by construction; normalisation still applies.
        let _ = initial.validate_and_normalize();
        Self {
            current: ArcSwap::from_pointee(initial),
            version: AtomicU64::new(0),
            store,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// One atomic load; the returned snapshot is immutable.
    pub fn get(&self) -> Arc<RuntimeConfig> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Seed from a persisted row during restore, before any patch runs.
    pub fn seed(&self, row: &SystemConfigRow) -> Result<()> {
        let mut cfg: RuntimeConfig = serde_json::from_str(&row.payload_json)?;
        cfg.validate_and_normalize()?;
        self.current.store(Arc::new(cfg));
        self.version.store(row.version, Ordering::Release);
        Ok(())
    }

    /// Constrained-merge patch: object only, non-empty, no nulls, unknown
    /// keys rejected. Validation and persistence fail atomically; only after
    /// the store accepted the new version is the snapshot published.
    pub async fn patch(&self, patch: serde_json::Value) -> Result<Arc<RuntimeConfig>> {
        let _guard = self.write_lock.lock().await;

        let patch_map = match patch {
            serde_json::Value::Object(m) if !m.is_empty() => m,
            serde_json::Value::Object(_) => {
                return Err(ResinError::InvalidArgument(
                    "config patch must not be empty".to_string(),
                ))
            }
            _ => {
                return Err(ResinError::InvalidArgument(
                    "config patch must be a JSON object".to_string(),
                ))
            }
        };

        let current = self.current.load_full();
        let mut merged = match serde_json::to_value(current.as_ref())? {
            serde_json::Value::Object(m) => m,
            _ => return Err(ResinError::Internal("config did not serialize to an object".into())),
        };
        for (k, v) in patch_map {
            if v.is_null() {
                return Err(ResinError::InvalidArgument(format!(
                    "config patch must not contain null values: {k}"
                )));
            }
            if !merged.contains_key(&k) {
                return Err(ResinError::InvalidArgument(format!(
                    "unknown config key: {k}"
                )));
            }
            merged.insert(k, v);
        }

        let mut next: RuntimeConfig = serde_json::from_value(serde_json::Value::Object(merged))
            .map_err(|e| ResinError::InvalidArgument(format!("config patch rejected: {e}")))?;
        next.validate_and_normalize()?;

        let next_version = self.version.load(Ordering::Acquire) + 1;
        self.store
            .upsert_system_config(SystemConfigRow {
                version: next_version,
                payload_json: serde_json::to_string(&next)?,
                updated_at_ns: now_ns(),
            })
            .await?;

        let published = Arc::new(next);
        self.current.store(published.clone());
        self.version.store(next_version, Ordering::Release);
        info!(version = next_version, "runtime config updated");
        Ok(published)
    }
}
