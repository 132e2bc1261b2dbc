// # Static settings
//
// Environment-driven configuration read once at boot. Everything that can
// change at runtime lives in `config::RuntimeConfig` instead; this struct is
// the immutable part: directories, the listen surface, tokens, and pool
// bounds.

use std::path::PathBuf;

use crate::error::{ResinError, Result};

/// Path segments that can never be used as a proxy token because the inbound
/// demux reserves them for the control plane.
pub const RESERVED_TOKENS: &[&str] = &["api", "healthz", "ui"];

#[derive(Debug, Clone)]
pub struct Settings {
    /// Durable state directory (state store files live here).
    pub state_dir: PathBuf,
    /// Scratch directory (GeoIP downloads are staged here).
    pub cache_dir: PathBuf,
    /// Log directory.
    pub log_dir: PathBuf,
    /// Address the single listener binds.
    pub listen_address: String,
    /// Port the single listener binds.
    pub port: u16,
    /// Bearer token required for mutating control-plane calls. May be empty,
    /// which disables the check.
    pub admin_token: String,
    /// First path segment that namespaces reverse-proxy and token-action
    /// requests. May be empty, which disables token checks entirely.
    pub proxy_token: String,
    /// Number of probe workers.
    pub probe_concurrency: usize,
    /// Per-node latency table capacity (domains).
    pub latency_table_cap: usize,
    /// Max idle pooled upstream connections per node+origin.
    pub transport_pool_max_idle: usize,
    /// Idle pooled connection lifetime in seconds.
    pub transport_idle_timeout_secs: u64,
    /// GeoIP database file path (under `state_dir` by default).
    pub geoip_db_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./state"),
            cache_dir: PathBuf::from("./cache"),
            log_dir: PathBuf::from("./logs"),
            listen_address: "0.0.0.0".to_string(),
            port: 8650,
            admin_token: String::new(),
            proxy_token: String::new(),
            probe_concurrency: 8,
            latency_table_cap: 64,
            transport_pool_max_idle: 4,
            transport_idle_timeout_secs: 90,
            geoip_db_path: PathBuf::from("./state/geoip.mmdb"),
        }
    }
}

impl Settings {
    /// Build settings from the process environment, falling back to defaults
    /// for unset variables. `ADMIN_TOKEN` and `PROXY_TOKEN` are required but
    /// may be set to the empty string.
    pub fn from_env() -> Result<Self> {
        let mut s = Settings::default();

        if let Some(v) = env_opt("STATE_DIR") {
            s.state_dir = PathBuf::from(v);
            s.geoip_db_path = s.state_dir.join("geoip.mmdb");
        }
        if let Some(v) = env_opt("CACHE_DIR") {
            s.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = env_opt("LOG_DIR") {
            s.log_dir = PathBuf::from(v);
        }
        if let Some(v) = env_opt("LISTEN_ADDRESS") {
            s.listen_address = v;
        }
        if let Some(v) = env_opt("PORT") {
            s.port = v
                .parse()
                .map_err(|_| ResinError::InvalidArgument(format!("PORT not a port: {v}")))?;
        }
        s.admin_token = require_env("ADMIN_TOKEN")?;
        s.proxy_token = require_env("PROXY_TOKEN")?;
        if let Some(v) = env_opt("PROBE_CONCURRENCY") {
            s.probe_concurrency = parse_positive("PROBE_CONCURRENCY", &v)?;
        }
        if let Some(v) = env_opt("LATENCY_TABLE_CAP") {
            s.latency_table_cap = parse_positive("LATENCY_TABLE_CAP", &v)?;
        }
        if let Some(v) = env_opt("TRANSPORT_POOL_MAX_IDLE") {
            s.transport_pool_max_idle = parse_positive("TRANSPORT_POOL_MAX_IDLE", &v)?;
        }
        if let Some(v) = env_opt("TRANSPORT_IDLE_TIMEOUT_SECS") {
            s.transport_idle_timeout_secs = parse_positive("TRANSPORT_IDLE_TIMEOUT_SECS", &v)? as u64;
        }

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        validate_proxy_token(&self.proxy_token)?;
        if self.probe_concurrency == 0 {
            return Err(ResinError::InvalidArgument(
                "PROBE_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.latency_table_cap == 0 {
            return Err(ResinError::InvalidArgument(
                "LATENCY_TABLE_CAP must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }
}

/// A proxy token rides in URL path segments and userinfo-like positions, so
/// `:` and `@` are rejected, as are the reserved control-plane segments.
pub fn validate_proxy_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Ok(());
    }
    if token.contains(':') || token.contains('@') {
        return Err(ResinError::InvalidArgument(
            "PROXY_TOKEN must not contain ':' or '@'".to_string(),
        ));
    }
    if RESERVED_TOKENS.contains(&token) {
        return Err(ResinError::InvalidArgument(format!(
            "PROXY_TOKEN must not be a reserved word: {token}"
        )));
    }
    Ok(())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| ResinError::InvalidArgument(format!("{key} must be set (may be empty)")))
}

fn parse_positive(key: &str, v: &str) -> Result<usize> {
    let n: usize = v
        .parse()
        .map_err(|_| ResinError::InvalidArgument(format!("{key} not a number: {v}")))?;
    if n == 0 {
        return Err(ResinError::InvalidArgument(format!(
            "{key} must be at least 1"
        )));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_token_validation() {
        assert!(validate_proxy_token("").is_ok());
        assert!(validate_proxy_token("tok").is_ok());
        assert!(validate_proxy_token("a:b").is_err());
        assert!(validate_proxy_token("a@b").is_err());
        assert!(validate_proxy_token("api").is_err());
        assert!(validate_proxy_token("healthz").is_err());
        assert!(validate_proxy_token("ui").is_err());
    }

    #[test]
    fn test_defaults_validate() {
        assert!(Settings::default().validate().is_ok());
    }
}
