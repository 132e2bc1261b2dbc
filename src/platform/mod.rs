// # Platforms
//
// A platform is a tenant-scoped view over the node pool: regex filters over
// display tags, an optional region allowlist, a sticky-lease TTL, and a node
// allocation policy. The declarative part (`PlatformSpec`) is what the
// control plane edits and persistence stores; the runtime part (`Platform`)
// adds compiled filters and the derived routable view.

pub mod manager;

pub use manager::{PlatformCreate, PlatformManager, PlatformPatch};

use std::collections::HashSet;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ResinError, Result};
use crate::node::identity::NodeHash;
use crate::persist::PlatformRow;
use crate::util::now_ns;

/// Fixed ID of the built-in platform. Exists at all times; cannot be deleted
/// or renamed.
pub const DEFAULT_PLATFORM_ID: &str = "Default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissAction {
    /// Unknown platform on the reverse path routes as a random Default node.
    Random,
    /// Unknown platform on the reverse path is rejected.
    Reject,
}

impl MissAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissAction::Random => "RANDOM",
            MissAction::Reject => "REJECT",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "RANDOM" => Ok(MissAction::Random),
            "REJECT" => Ok(MissAction::Reject),
            other => Err(ResinError::InvalidArgument(format!(
                "unknown reverse_proxy_miss_action: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationPolicy {
    /// Power-of-two-choices on authority latency.
    Balanced,
    /// Deterministic lowest authority latency.
    PreferLowLatency,
    /// Fewest active leases per egress IP.
    PreferIdleIp,
}

impl AllocationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationPolicy::Balanced => "BALANCED",
            AllocationPolicy::PreferLowLatency => "PREFER_LOW_LATENCY",
            AllocationPolicy::PreferIdleIp => "PREFER_IDLE_IP",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "BALANCED" => Ok(AllocationPolicy::Balanced),
            "PREFER_LOW_LATENCY" => Ok(AllocationPolicy::PreferLowLatency),
            "PREFER_IDLE_IP" => Ok(AllocationPolicy::PreferIdleIp),
            other => Err(ResinError::InvalidArgument(format!(
                "unknown allocation_policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub id: String,
    pub name: String,
    pub sticky_ttl_ns: i64,
    pub regex_filters: Vec<String>,
    pub region_filters: Vec<String>,
    pub reverse_proxy_miss_action: MissAction,
    pub allocation_policy: AllocationPolicy,
    pub updated_at_ns: i64,
}

impl PlatformSpec {
    /// The built-in platform's factory settings.
    pub fn default_platform() -> Self {
        Self {
            id: DEFAULT_PLATFORM_ID.to_string(),
            name: DEFAULT_PLATFORM_ID.to_string(),
            sticky_ttl_ns: 30 * 60 * 1_000_000_000,
            regex_filters: Vec::new(),
            region_filters: Vec::new(),
            reverse_proxy_miss_action: MissAction::Random,
            allocation_policy: AllocationPolicy::Balanced,
            updated_at_ns: now_ns(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ResinError::InvalidArgument(
                "platform name must not be empty".to_string(),
            ));
        }
        if self.sticky_ttl_ns <= 0 {
            return Err(ResinError::InvalidArgument(
                "sticky_ttl must be positive".to_string(),
            ));
        }
        for f in &self.regex_filters {
            Regex::new(f).map_err(|e| {
                ResinError::InvalidArgument(format!("regex filter does not compile: {f}: {e}"))
            })?;
        }
        for r in &self.region_filters {
            if r.len() != 2 || !r.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(ResinError::InvalidArgument(format!(
                    "region filter is not a two-letter code: {r}"
                )));
            }
        }
        Ok(())
    }

    pub fn to_row(&self) -> PlatformRow {
        PlatformRow {
            id: self.id.clone(),
            name: self.name.clone(),
            sticky_ttl_ns: self.sticky_ttl_ns,
            regex_filters_json: serde_json::to_string(&self.regex_filters).unwrap_or_default(),
            region_filters_json: serde_json::to_string(&self.region_filters).unwrap_or_default(),
            reverse_proxy_miss_action: self.reverse_proxy_miss_action.as_str().to_string(),
            allocation_policy: self.allocation_policy.as_str().to_string(),
            updated_at_ns: self.updated_at_ns,
        }
    }

    pub fn from_row(row: &PlatformRow) -> Result<Self> {
        Ok(Self {
            id: row.id.clone(),
            name: row.name.clone(),
            sticky_ttl_ns: row.sticky_ttl_ns,
            regex_filters: serde_json::from_str(&row.regex_filters_json)?,
            region_filters: serde_json::from_str(&row.region_filters_json)?,
            reverse_proxy_miss_action: MissAction::parse(&row.reverse_proxy_miss_action)?,
            allocation_policy: AllocationPolicy::parse(&row.allocation_policy)?,
            updated_at_ns: row.updated_at_ns,
        })
    }
}

/// Live platform: spec plus compiled filters plus the derived view.
#[derive(Debug)]
pub struct Platform {
    spec: RwLock<PlatformSpec>,
    compiled: RwLock<Vec<Regex>>,
    regions: RwLock<HashSet<String>>,
    view: RwLock<HashSet<NodeHash>>,
}

impl Platform {
    pub fn new(spec: PlatformSpec) -> Result<Self> {
        spec.validate()?;
        let compiled = compile_filters(&spec.regex_filters)?;
        let regions = region_set(&spec.region_filters);
        Ok(Self {
            spec: RwLock::new(spec),
            compiled: RwLock::new(compiled),
            regions: RwLock::new(regions),
            view: RwLock::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> String {
        self.spec.read().id.clone()
    }

    pub fn name(&self) -> String {
        self.spec.read().name.clone()
    }

    pub fn spec(&self) -> PlatformSpec {
        self.spec.read().clone()
    }

    pub fn sticky_ttl_ns(&self) -> i64 {
        self.spec.read().sticky_ttl_ns
    }

    pub fn allocation_policy(&self) -> AllocationPolicy {
        self.spec.read().allocation_policy
    }

    pub fn miss_action(&self) -> MissAction {
        self.spec.read().reverse_proxy_miss_action
    }

    /// Replace the spec; filters are recompiled before publication so a bad
    /// spec never lands half-applied.
    pub fn update_spec(&self, next: PlatformSpec) -> Result<()> {
        next.validate()?;
        let compiled = compile_filters(&next.regex_filters)?;
        let regions = region_set(&next.region_filters);
        *self.compiled.write() = compiled;
        *self.regions.write() = regions;
        *self.spec.write() = next;
        Ok(())
    }

    /// Filter decision for one node, given its display tags and region. The
    /// health check lives in the pool; this is only the platform's part.
    pub fn matches(&self, display_tags: &[String], region: &str) -> bool {
        let compiled = self.compiled.read();
        if !compiled.is_empty() {
            let any = compiled
                .iter()
                .any(|re| display_tags.iter().any(|t| re.is_match(t)));
            if !any {
                return false;
            }
        }
        let regions = self.regions.read();
        if !regions.is_empty() && !regions.contains(&region.to_ascii_uppercase()) {
            return false;
        }
        true
    }

    pub fn view_contains(&self, hash: &str) -> bool {
        self.view.read().contains(hash)
    }

    pub fn view_snapshot(&self) -> Vec<NodeHash> {
        self.view.read().iter().cloned().collect()
    }

    pub fn view_len(&self) -> usize {
        self.view.read().len()
    }

    pub fn replace_view(&self, next: HashSet<NodeHash>) {
        *self.view.write() = next;
    }

    pub fn view_insert(&self, hash: &str) {
        self.view.write().insert(hash.to_string());
    }

    pub fn view_remove(&self, hash: &str) {
        self.view.write().remove(hash);
    }
}

fn compile_filters(filters: &[String]) -> Result<Vec<Regex>> {
    filters
        .iter()
        .map(|f| {
            Regex::new(f).map_err(|e| {
                ResinError::InvalidArgument(format!("regex filter does not compile: {f}: {e}"))
            })
        })
        .collect()
}

fn region_set(regions: &[String]) -> HashSet<String> {
    regions.iter().map(|r| r.to_ascii_uppercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(regex: &[&str], regions: &[&str]) -> PlatformSpec {
        PlatformSpec {
            id: "p1".into(),
            name: "P1".into(),
            sticky_ttl_ns: 1_000_000_000,
            regex_filters: regex.iter().map(|s| s.to_string()).collect(),
            region_filters: regions.iter().map(|s| s.to_string()).collect(),
            reverse_proxy_miss_action: MissAction::Reject,
            allocation_policy: AllocationPolicy::Balanced,
            updated_at_ns: 0,
        }
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let p = Platform::new(spec(&[], &[])).unwrap();
        assert!(p.matches(&["Provider/HK-01".into()], "HK"));
        assert!(p.matches(&[], ""));
    }

    #[test]
    fn test_regex_filters_apply_to_display_tags() {
        let p = Platform::new(spec(&["^Provider/.*"], &[])).unwrap();
        assert!(p.matches(&["Provider/HK-01".into()], ""));
        assert!(p.matches(
            &["Other/x".into(), "Provider/JP-02".into()],
            ""
        ));
        assert!(!p.matches(&["Other/x".into()], ""));
    }

    #[test]
    fn test_region_filter_is_case_insensitive_allowlist() {
        let p = Platform::new(spec(&[], &["hk", "JP"])).unwrap();
        assert!(p.matches(&[], "HK"));
        assert!(p.matches(&[], "jp"));
        assert!(!p.matches(&[], "US"));
        assert!(!p.matches(&[], ""));
    }

    #[test]
    fn test_bad_regex_rejected() {
        assert!(Platform::new(spec(&["("], &[])).is_err());
    }

    #[test]
    fn test_bad_region_rejected() {
        let s = spec(&[], &["HKG"]);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_row_roundtrip() {
        let s = spec(&["^A/.*"], &["US"]);
        let row = s.to_row();
        let back = PlatformSpec::from_row(&row).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn test_enum_parse() {
        assert_eq!(MissAction::parse("RANDOM").unwrap(), MissAction::Random);
        assert!(MissAction::parse("nope").is_err());
        assert_eq!(
            AllocationPolicy::parse("PREFER_IDLE_IP").unwrap(),
            AllocationPolicy::PreferIdleIp
        );
        assert!(AllocationPolicy::parse("nope").is_err());
    }
}
