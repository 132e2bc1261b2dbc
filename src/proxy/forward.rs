// # Forward proxy
//
// Serves explicit-proxy clients: `CONNECT host:port` is spliced onto the
// chosen node's outbound after `200 Connection Established`; absolute-URI
// requests are re-issued upstream with hop-by-hop headers stripped. Both
// route on the Default platform with the account derived from the
// account-header rules.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::{Body as HttpBody, Incoming};
use tracing::{debug, warn};

use super::upstream::{strip_hop_by_hop, Target};
use super::{error_response, outcome_for, ProxyContext};
use crate::error::{ResinError, UpstreamStage};
use crate::events::{RequestFinished, RequestOutcome};
use crate::platform::DEFAULT_PLATFORM_ID;

pub struct ForwardProxy {
    ctx: Arc<ProxyContext>,
}

impl ForwardProxy {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<Body> {
        if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_absolute(req).await
        }
    }

    /// CONNECT tunnel: answer 200, then splice the upgraded client stream
    /// onto a fresh outbound connection.
    async fn handle_connect(&self, req: Request<Incoming>) -> Response<Body> {
        let started = Instant::now();
        let target = match req.uri().authority() {
            Some(a) => a.to_string(),
            None => {
                return error_response(&ResinError::InvalidArgument(
                    "CONNECT without authority".to_string(),
                ))
            }
        };
        let host = target.rsplit_once(':').map(|(h, _)| h).unwrap_or(&target);
        let account = self.ctx.rules.derive_account(host, req.headers());

        let routed = match self
            .ctx
            .router
            .route_request(DEFAULT_PLATFORM_ID, &account, &format!("https://{target}"), false)
        {
            Ok(r) => r,
            Err(e) => {
                self.emit_failure(&account, &target, "CONNECT", started, &e);
                return error_response(&e);
            }
        };
        let node = match self.ctx.pool.get(&routed.node_hash) {
            Some(n) => n,
            None => {
                let e = ResinError::NoHealthyNode(DEFAULT_PLATFORM_ID.to_string());
                self.emit_failure(&account, &target, "CONNECT", started, &e);
                return error_response(&e);
            }
        };
        let Some(outbound) = node.outbound() else {
            let e = ResinError::upstream(UpstreamStage::Dial, "node has no outbound".to_string());
            self.emit_failure(&account, &target, "CONNECT", started, &e);
            return error_response(&e);
        };

        let ctx = self.ctx.clone();
        let pool = self.ctx.pool.clone();
        let node_hash = routed.node_hash.clone();
        let account_owned = account.clone();
        let target_owned = target.clone();
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(u) => u,
                Err(e) => {
                    debug!(error = %e, "CONNECT upgrade failed");
                    return;
                }
            };
            let mut client = hyper_util::rt::TokioIo::new(upgraded);
            let (bytes_in, bytes_out, outcome) = match outbound.dial(&target_owned).await {
                Ok(mut upstream) => {
                    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                        Ok((tx, rx)) => {
                            pool.record_result(&node_hash, true);
                            (rx, tx, RequestOutcome::Ok)
                        }
                        Err(e) => {
                            debug!(error = %e, "tunnel closed with error");
                            (0, 0, RequestOutcome::UpstreamError)
                        }
                    }
                }
                Err(e) => {
                    warn!(target = %target_owned, error = %e, "tunnel dial failed");
                    pool.record_result(&node_hash, false);
                    (0, 0, RequestOutcome::UpstreamError)
                }
            };
            ctx.emit_finished(
                RequestFinished {
                    platform_id: DEFAULT_PLATFORM_ID.to_string(),
                    account: account_owned,
                    node_hash,
                    target: target_owned,
                    bytes_in,
                    bytes_out,
                    duration: started.elapsed(),
                    outcome,
                },
                "CONNECT",
                200,
            );
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    /// Absolute-URI forwarding: `GET http://host/path HTTP/1.1`.
    async fn handle_absolute(&self, req: Request<Incoming>) -> Response<Body> {
        let started = Instant::now();
        let method = req.method().clone();
        let url = req.uri().to_string();
        let target = match Target::parse(&url) {
            Ok(t) => t,
            Err(e) => return error_response(&e),
        };
        let account = self
            .ctx
            .rules
            .derive_account(&format!("{}{}", target.host, target.path_and_query), req.headers());

        let routed = match self
            .ctx
            .router
            .route_request(DEFAULT_PLATFORM_ID, &account, &url, false)
        {
            Ok(r) => r,
            Err(e) => {
                self.emit_failure(&account, &url, method.as_str(), started, &e);
                return error_response(&e);
            }
        };
        let Some(node) = self.ctx.pool.get(&routed.node_hash) else {
            let e = ResinError::NoHealthyNode(DEFAULT_PLATFORM_ID.to_string());
            self.emit_failure(&account, &url, method.as_str(), started, &e);
            return error_response(&e);
        };

        let (parts, body) = req.into_parts();
        let boxed = body
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            .boxed();
        let mut upstream_req = match Request::builder()
            .method(parts.method.clone())
            .uri(target.path_and_query.clone())
            .body(boxed)
        {
            Ok(r) => r,
            Err(e) => return error_response(&ResinError::Internal(e.to_string())),
        };
        *upstream_req.headers_mut() = parts.headers;
        strip_hop_by_hop(upstream_req.headers_mut());
        if let Ok(host) = target.authority().parse() {
            upstream_req.headers_mut().insert(http::header::HOST, host);
        }

        let bytes_out = HttpBody::size_hint(upstream_req.body()).exact().unwrap_or(0);
        let result = self
            .ctx
            .transports
            .send(&node, &target, upstream_req, self.ctx.request_timeout())
            .await;

        match result {
            Ok(mut response) => {
                self.ctx.pool.record_result(&routed.node_hash, true);
                strip_hop_by_hop(response.headers_mut());
                let status = response.status();
                let bytes_in = HttpBody::size_hint(response.body()).exact().unwrap_or(0);
                self.ctx.emit_finished(
                    RequestFinished {
                        platform_id: DEFAULT_PLATFORM_ID.to_string(),
                        account,
                        node_hash: routed.node_hash,
                        target: url,
                        bytes_in,
                        bytes_out,
                        duration: started.elapsed(),
                        outcome: RequestOutcome::Ok,
                    },
                    method.as_str(),
                    status.as_u16(),
                );
                response.map(Body::new)
            }
            Err(e) => {
                self.ctx.pool.record_result(&routed.node_hash, false);
                self.emit_failure(&account, &url, method.as_str(), started, &e);
                error_response(&e)
            }
        }
    }

    fn emit_failure(
        &self,
        account: &str,
        target: &str,
        method: &str,
        started: Instant,
        err: &ResinError,
    ) {
        self.ctx.emit_finished(
            RequestFinished {
                platform_id: DEFAULT_PLATFORM_ID.to_string(),
                account: account.to_string(),
                node_hash: String::new(),
                target: target.to_string(),
                bytes_in: 0,
                bytes_out: 0,
                duration: started.elapsed(),
                outcome: outcome_for(err),
            },
            method,
            err.http_status(),
        );
    }
}
