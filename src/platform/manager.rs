// # Platform manager
//
// Control-plane CRUD over platforms. Writes are persistence-first: the store
// accepts the row before the live registry changes, so a storage failure
// leaves routing untouched. The built-in Default platform cannot be deleted
// or renamed, only reset to its factory settings.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{AllocationPolicy, MissAction, Platform, PlatformSpec, DEFAULT_PLATFORM_ID};
use crate::error::{ResinError, Result};
use crate::node::NodePool;
use crate::persist::StateStore;
use crate::router::Router;
use crate::util::{now_ns, secs_to_ns};

/// Patchable subset of a platform.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformPatch {
    pub name: Option<String>,
    pub sticky_ttl_secs: Option<u64>,
    pub regex_filters: Option<Vec<String>>,
    pub region_filters: Option<Vec<String>>,
    pub reverse_proxy_miss_action: Option<MissAction>,
    pub allocation_policy: Option<AllocationPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformCreate {
    pub name: String,
    pub sticky_ttl_secs: u64,
    #[serde(default)]
    pub regex_filters: Vec<String>,
    #[serde(default)]
    pub region_filters: Vec<String>,
    pub reverse_proxy_miss_action: MissAction,
    pub allocation_policy: AllocationPolicy,
}

pub struct PlatformManager {
    pool: Arc<NodePool>,
    router: Arc<Router>,
    store: Arc<dyn StateStore>,
}

impl PlatformManager {
    pub fn new(pool: Arc<NodePool>, router: Arc<Router>, store: Arc<dyn StateStore>) -> Self {
        Self {
            pool,
            router,
            store,
        }
    }

    /// Guarantee the Default platform exists; used at boot.
    pub async fn ensure_default(&self) -> Result<()> {
        if self.pool.platform(DEFAULT_PLATFORM_ID).is_some() {
            return Ok(());
        }
        let spec = PlatformSpec::default_platform();
        self.store.upsert_platforms(vec![spec.to_row()]).await?;
        self.pool.register_platform(spec)?;
        info!("default platform created");
        Ok(())
    }

    pub async fn create(&self, req: PlatformCreate) -> Result<PlatformSpec> {
        if req.name == DEFAULT_PLATFORM_ID {
            return Err(ResinError::Conflict(format!(
                "platform name already taken: {}",
                req.name
            )));
        }
        let spec = PlatformSpec {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            sticky_ttl_ns: secs_to_ns(req.sticky_ttl_secs),
            regex_filters: req.regex_filters,
            region_filters: req.region_filters,
            reverse_proxy_miss_action: req.reverse_proxy_miss_action,
            allocation_policy: req.allocation_policy,
            updated_at_ns: now_ns(),
        };
        spec.validate()?;
        if self.pool.platform_by_name(&spec.name).is_some() {
            return Err(ResinError::Conflict(format!(
                "platform name already taken: {}",
                spec.name
            )));
        }
        self.store.upsert_platforms(vec![spec.to_row()]).await?;
        self.pool.register_platform(spec.clone())?;
        info!(id = %spec.id, name = %spec.name, "platform created");
        Ok(spec)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Platform>> {
        self.pool.platform(id)
    }

    pub fn list(&self) -> Vec<Arc<Platform>> {
        self.pool.platforms_snapshot()
    }

    pub async fn patch(&self, id: &str, patch: PlatformPatch) -> Result<PlatformSpec> {
        let platform = self
            .pool
            .platform(id)
            .ok_or_else(|| ResinError::NotFound(format!("platform {id}")))?;
        let mut next = platform.spec();
        if let Some(name) = patch.name {
            if id == DEFAULT_PLATFORM_ID && name != DEFAULT_PLATFORM_ID {
                return Err(ResinError::InvalidArgument(
                    "the Default platform cannot be renamed".to_string(),
                ));
            }
            next.name = name;
        }
        if let Some(secs) = patch.sticky_ttl_secs {
            next.sticky_ttl_ns = secs_to_ns(secs);
        }
        if let Some(f) = patch.regex_filters {
            next.regex_filters = f;
        }
        if let Some(f) = patch.region_filters {
            next.region_filters = f;
        }
        if let Some(a) = patch.reverse_proxy_miss_action {
            next.reverse_proxy_miss_action = a;
        }
        if let Some(a) = patch.allocation_policy {
            next.allocation_policy = a;
        }
        next.updated_at_ns = now_ns();
        next.validate()?;
        if let Some(existing) = self.pool.platform_by_name(&next.name) {
            if existing.id() != id {
                return Err(ResinError::Conflict(format!(
                    "platform name already taken: {}",
                    next.name
                )));
            }
        }
        self.store.upsert_platforms(vec![next.to_row()]).await?;
        self.pool.replace_platform(id, next.clone())?;
        Ok(next)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if id == DEFAULT_PLATFORM_ID {
            return Err(ResinError::InvalidArgument(
                "the Default platform cannot be deleted".to_string(),
            ));
        }
        if self.pool.platform(id).is_none() {
            return Err(ResinError::NotFound(format!("platform {id}")));
        }
        self.store.delete_platforms(vec![id.to_string()]).await?;
        self.pool.unregister_platform(id);
        let evicted = self.router.evict_platform(id);
        info!(id = %id, evicted, "platform deleted");
        Ok(())
    }

    /// Reset the Default platform to its factory settings.
    pub async fn reset(&self, id: &str) -> Result<PlatformSpec> {
        if id != DEFAULT_PLATFORM_ID {
            return Err(ResinError::InvalidArgument(
                "only the Default platform can be reset".to_string(),
            ));
        }
        let spec = PlatformSpec::default_platform();
        self.store.upsert_platforms(vec![spec.to_row()]).await?;
        self.pool.replace_platform(id, spec.clone())?;
        info!("default platform reset");
        Ok(spec)
    }

    pub fn rebuild_view(&self, id: &str) -> Result<()> {
        self.pool.rebuild_platform(id)
    }
}
