// # Inbound server
//
// One TCP listener multiplexing all four inbound surfaces: forward proxy,
// control plane, token-scoped actions, and reverse proxy. Connections are
// served with hyper HTTP/1 (upgrades enabled for CONNECT) and dispatched per
// request through the demux.

pub mod demux;

pub use demux::{classify, RouteClass};

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use tracing::{debug, error, info};

use crate::error::{ResinError, Result};
use crate::proxy::{error_response, ForwardProxy, ReverseProxy};
use crate::router::Router as NodeRouter;
use crate::util::percent_decode;

pub struct InboundServer {
    proxy_token: String,
    control: axum::Router,
    forward: Arc<ForwardProxy>,
    reverse: Arc<ReverseProxy>,
    router: Arc<NodeRouter>,
}

impl InboundServer {
    pub fn new(
        proxy_token: String,
        control: axum::Router,
        forward: Arc<ForwardProxy>,
        reverse: Arc<ReverseProxy>,
        router: Arc<NodeRouter>,
    ) -> Self {
        Self {
            proxy_token,
            control,
            forward,
            reverse,
            router,
        }
    }

    pub async fn dispatch(&self, req: Request<Incoming>) -> Response<Body> {
        match classify(req.method(), req.uri(), &self.proxy_token) {
            RouteClass::Forward => self.forward.handle(req).await,
            RouteClass::ControlPlane => {
                let req = req.map(Body::new);
                match self.control.clone().oneshot(req).await {
                    Ok(response) => response,
                    Err(never) => match never {},
                }
            }
            RouteClass::TokenAction { rest } => self.token_action(req, &rest).await,
            RouteClass::AuthFailed => error_response(&ResinError::AuthFailed(
                "proxy token mismatch".to_string(),
            )),
            RouteClass::Reverse { rest } => self.reverse.handle(req, &rest).await,
        }
    }

    /// The token namespace exposes exactly one verb:
    /// `POST {token}/api/v1/{platformName}/actions/inherit-lease`.
    async fn token_action(&self, req: Request<Incoming>, rest: &str) -> Response<Body> {
        let segments: Vec<&str> = rest.split('/').collect();
        let shape = matches!(
            segments.as_slice(),
            ["api", "v1", _platform, "actions", "inherit-lease"]
        );
        if !shape {
            return error_response(&ResinError::NotFound(format!(
                "no token action at {rest}"
            )));
        }
        if req.method() != Method::POST {
            return error_response(&ResinError::NotFound(
                "inherit-lease requires POST".to_string(),
            ));
        }
        let Some(platform) = percent_decode(segments[2]) else {
            return error_response(&ResinError::InvalidArgument(
                "malformed platform segment".to_string(),
            ));
        };

        #[derive(Deserialize)]
        struct InheritRequest {
            parent: String,
            child: String,
        }

        let body = match req.into_body().collect().await {
            Ok(b) => b.to_bytes(),
            Err(e) => return error_response(&ResinError::InvalidArgument(e.to_string())),
        };
        let parsed: InheritRequest = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => {
                return error_response(&ResinError::InvalidArgument(format!(
                    "inherit-lease body: {e}"
                )))
            }
        };

        match self
            .router
            .inherit_lease(&platform, &parsed.parent, &parsed.child)
        {
            Ok(lease) => {
                let body = json!({
                    "platform_id": lease.platform_id,
                    "account": lease.account,
                    "node_hash": lease.node_hash,
                    "egress_ip": lease.egress_ip,
                });
                Response::builder()
                    .status(StatusCode::OK)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap_or_else(|_| Response::new(Body::empty()))
            }
            Err(e) => error_response(&e),
        }
    }

    /// Accept loop. Runs until cancelled; in-flight connections finish on
    /// their own tasks.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "listener started");
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                }
            };
            stream.set_nodelay(true).ok();
            let this = self.clone();
            let conn_cancel = cancel.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let this = this.clone();
                    async move { Ok::<_, Infallible>(this.dispatch(req).await) }
                });
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades();
                tokio::select! {
                    result = conn => {
                        if let Err(e) = result {
                            debug!(peer = %peer, error = %e, "connection ended");
                        }
                    }
                    _ = conn_cancel.cancelled() => {}
                }
            });
        }
        info!("listener stopped");
        Ok(())
    }
}
