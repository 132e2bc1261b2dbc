// # Control-plane API
//
// REST surface over the routing core: system info and config, platforms,
// subscriptions, nodes, leases, and account-header rules. Error responses
// share one envelope (`{"error": {"code", "message"}}`) and always carry the
// `X-Resin-Error` header.

pub mod handlers;
pub mod server;
pub mod types;

pub use server::build_router;
pub use types::{ApiError, ApiResult};

use std::sync::Arc;

use crate::config::ConfigHandle;
use crate::node::NodePool;
use crate::platform::PlatformManager;
use crate::probe::ProbeManager;
use crate::proxy::AccountHeaderRules;
use crate::router::Router;
use crate::settings::Settings;
use crate::subscription::{SubscriptionManager, SubscriptionScheduler};

/// Shared handler state.
pub struct ApiState {
    pub settings: Settings,
    pub config: Arc<ConfigHandle>,
    pub pool: Arc<NodePool>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub scheduler: Arc<SubscriptionScheduler>,
    pub probes: Arc<ProbeManager>,
    pub router: Arc<Router>,
    pub platforms: Arc<PlatformManager>,
    pub rules: Arc<AccountHeaderRules>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}
