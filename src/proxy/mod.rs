// # Proxy data path
//
// Forward (CONNECT + absolute-URI) and reverse handlers translate HTTP
// semantics into router calls and outbound dials. `upstream` is the shared
// HTTP-over-outbound plumbing, `rules` derives accounts from headers.

pub mod forward;
pub mod reverse;
pub mod rules;
pub mod upstream;

pub use forward::ForwardProxy;
pub use reverse::ReverseProxy;
pub use rules::AccountHeaderRules;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::{Response, StatusCode};

use crate::config::ConfigHandle;
use crate::error::ResinError;
use crate::events::{EventBus, RequestFinished, RequestLog, RequestOutcome};
use crate::node::{NodePool, TransportPool};
use crate::router::Router;

/// Everything the data path needs, shared by both proxies.
pub struct ProxyContext {
    pub router: Arc<Router>,
    pub pool: Arc<NodePool>,
    pub transports: Arc<TransportPool>,
    pub rules: Arc<AccountHeaderRules>,
    pub events: Arc<EventBus>,
    pub config: Arc<ConfigHandle>,
}

impl ProxyContext {
    /// Per-request upstream deadline.
    pub fn request_timeout(&self) -> Duration {
        // Proxied requests get a generous multiple of the probe timeout.
        Duration::from_secs(self.config.get().probe_timeout_secs.saturating_mul(4))
    }

    pub fn emit_finished(&self, event: RequestFinished, method: &str, status: u16) {
        self.events.emit_request(&event);
        self.events.emit_request_log(&RequestLog {
            method: method.to_string(),
            status,
            finished: event,
        });
    }
}

/// Error → data-path HTTP response with the `X-Resin-Error` code header.
pub fn error_response(err: &ResinError) -> Response<Body> {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Response::builder()
        .status(status)
        .header("x-resin-error", err.code())
        .body(Body::from(format!("{}\n", err.code())))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub fn outcome_for(err: &ResinError) -> RequestOutcome {
    match err {
        ResinError::NoHealthyNode(_) => RequestOutcome::NoHealthyNode,
        ResinError::Upstream { .. } => RequestOutcome::UpstreamError,
        _ => RequestOutcome::Rejected,
    }
}
