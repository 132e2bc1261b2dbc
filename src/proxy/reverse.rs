// # Reverse proxy
//
// Path grammar: `/{token}/{platform[:account]}/{scheme}/{host}[/subpath]`.
// The demux has already consumed the token decision; this handler parses the
// rest, derives the account from header rules when the path names none, asks
// the router for a node, and re-issues the request upstream.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper::body::{Body as HttpBody, Incoming};

use super::upstream::{strip_hop_by_hop, Target};
use super::{error_response, outcome_for, ProxyContext};
use crate::error::{ResinError, Result};
use crate::events::{RequestFinished, RequestOutcome};
use crate::util::percent_decode;

/// Parsed reverse-proxy path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseTarget {
    pub platform: String,
    pub account: String,
    pub url: String,
    pub target: Target,
}

/// Parse the grammar after the (optional) token segment has been stripped.
/// `rest` is the path without a leading slash; `query` carries through.
pub fn parse_reverse_path(rest: &str, query: Option<&str>) -> Result<ReverseTarget> {
    let mut segments = rest.splitn(3, '/');
    let platform_seg = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ResinError::InvalidArgument("missing platform segment".to_string()))?;
    let scheme = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ResinError::InvalidArgument("missing scheme segment".to_string()))?;
    let host_and_path = segments.next().unwrap_or_default();

    let decoded = percent_decode(platform_seg).ok_or_else(|| {
        ResinError::InvalidArgument(format!("malformed platform segment: {platform_seg}"))
    })?;
    let (platform, account) = match decoded.split_once(':') {
        Some((p, a)) => (p.to_string(), a.to_string()),
        None => (decoded, String::new()),
    };
    if platform.is_empty() {
        return Err(ResinError::InvalidArgument(
            "platform name must not be empty".to_string(),
        ));
    }
    if scheme != "http" && scheme != "https" {
        return Err(ResinError::InvalidArgument(format!(
            "scheme must be http or https: {scheme}"
        )));
    }
    let (host, subpath) = match host_and_path.split_once('/') {
        Some((h, p)) => (h, p),
        None => (host_and_path, ""),
    };
    if host.is_empty() {
        return Err(ResinError::InvalidArgument(
            "missing host segment".to_string(),
        ));
    }

    let mut url = format!("{scheme}://{host}/{subpath}");
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }
    let target = Target::parse(&url)?;
    Ok(ReverseTarget {
        platform,
        account,
        url,
        target,
    })
}

pub struct ReverseProxy {
    ctx: Arc<ProxyContext>,
}

impl ReverseProxy {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// `rest` is the request path with the token segment (if any) already
    /// removed and no leading slash.
    pub async fn handle(&self, req: Request<Incoming>, rest: &str) -> Response<Body> {
        let started = Instant::now();
        let method = req.method().clone();
        let parsed = match parse_reverse_path(rest, req.uri().query()) {
            Ok(p) => p,
            Err(e) => return error_response(&e),
        };

        let account = if parsed.account.is_empty() {
            // Rules match on host + escaped path, without the query string.
            let path = parsed
                .target
                .path_and_query
                .split('?')
                .next()
                .unwrap_or("/");
            let match_input = format!("{}{}", parsed.target.host, path);
            self.ctx.rules.derive_account(&match_input, req.headers())
        } else {
            parsed.account.clone()
        };

        let routed = match self
            .ctx
            .router
            .route_request(&parsed.platform, &account, &parsed.url, true)
        {
            Ok(r) => r,
            Err(e) => {
                self.emit(
                    &parsed.platform,
                    &account,
                    "",
                    &parsed.url,
                    method.as_str(),
                    err_status(&e),
                    0,
                    0,
                    started,
                    outcome_for(&e),
                );
                return error_response(&e);
            }
        };
        let Some(node) = self.ctx.pool.get(&routed.node_hash) else {
            let e = ResinError::NoHealthyNode(parsed.platform.clone());
            return error_response(&e);
        };

        let (parts, body) = req.into_parts();
        let boxed = body
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            .boxed();
        let mut upstream_req = match Request::builder()
            .method(parts.method.clone())
            .uri(parsed.target.path_and_query.clone())
            .body(boxed)
        {
            Ok(r) => r,
            Err(e) => return error_response(&ResinError::Internal(e.to_string())),
        };
        *upstream_req.headers_mut() = parts.headers;
        strip_hop_by_hop(upstream_req.headers_mut());
        if let Ok(host) = parsed.target.authority().parse() {
            upstream_req.headers_mut().insert(http::header::HOST, host);
        }
        let bytes_out = HttpBody::size_hint(upstream_req.body()).exact().unwrap_or(0);

        let result = self
            .ctx
            .transports
            .send(&node, &parsed.target, upstream_req, self.ctx.request_timeout())
            .await;

        match result {
            Ok(mut response) => {
                self.ctx.pool.record_result(&routed.node_hash, true);
                strip_hop_by_hop(response.headers_mut());
                let status = response.status().as_u16();
                let bytes_in = HttpBody::size_hint(response.body()).exact().unwrap_or(0);
                self.emit(
                    &parsed.platform,
                    &account,
                    &routed.node_hash,
                    &parsed.url,
                    method.as_str(),
                    status,
                    bytes_in,
                    bytes_out,
                    started,
                    RequestOutcome::Ok,
                );
                response.map(Body::new)
            }
            Err(e) => {
                self.ctx.pool.record_result(&routed.node_hash, false);
                self.emit(
                    &parsed.platform,
                    &account,
                    &routed.node_hash,
                    &parsed.url,
                    method.as_str(),
                    err_status(&e),
                    0,
                    bytes_out,
                    started,
                    outcome_for(&e),
                );
                error_response(&e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        platform: &str,
        account: &str,
        node_hash: &str,
        target: &str,
        method: &str,
        status: u16,
        bytes_in: u64,
        bytes_out: u64,
        started: Instant,
        outcome: RequestOutcome,
    ) {
        self.ctx.emit_finished(
            RequestFinished {
                platform_id: platform.to_string(),
                account: account.to_string(),
                node_hash: node_hash.to_string(),
                target: target.to_string(),
                bytes_in,
                bytes_out,
                duration: started.elapsed(),
                outcome,
            },
            method,
            status,
        );
    }
}

fn err_status(e: &ResinError) -> u16 {
    e.http_status()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_grammar() {
        let p = parse_reverse_path("Plat:acct/https/api.example.com/v1/users", Some("page=2"))
            .unwrap();
        assert_eq!(p.platform, "Plat");
        assert_eq!(p.account, "acct");
        assert_eq!(p.url, "https://api.example.com/v1/users?page=2");
        assert_eq!(p.target.host, "api.example.com");
        assert_eq!(p.target.port, 443);
    }

    #[test]
    fn test_parse_without_account_or_subpath() {
        let p = parse_reverse_path("Plat/http/example.com", None).unwrap();
        assert_eq!(p.platform, "Plat");
        assert_eq!(p.account, "");
        assert_eq!(p.url, "http://example.com/");
    }

    #[test]
    fn test_parse_percent_decoded_platform_and_account() {
        let p = parse_reverse_path("My%20Plat%3Aacct%2F1/https/example.com", None).unwrap();
        assert_eq!(p.platform, "My Plat");
        assert_eq!(p.account, "acct/1");
    }

    #[test]
    fn test_parse_rejects_bad_grammar() {
        assert!(parse_reverse_path("", None).is_err());
        assert!(parse_reverse_path("Plat", None).is_err());
        assert!(parse_reverse_path("Plat/ftp/example.com", None).is_err());
        assert!(parse_reverse_path("Plat/https", None).is_err());
        assert!(parse_reverse_path("Plat/https/", None).is_err());
        assert!(parse_reverse_path("%zz/https/example.com", None).is_err());
    }

    #[test]
    fn test_parse_host_with_port() {
        let p = parse_reverse_path("Plat/http/example.com:8080/x", None).unwrap();
        assert_eq!(p.target.port, 8080);
        assert_eq!(p.url, "http://example.com:8080/x");
    }
}
