// # Upstream HTTP over outbounds
//
// One HTTP/1 round-trip across a stream dialed through a node's outbound,
// with TLS layered on for https targets. Probes, the retrying downloader,
// and both proxies all come through here, so the upstream error staging
// (dial / tls / write / read / timeout) is in exactly one place.

use std::sync::Arc;
use std::time::Duration;

use http::uri::Uri;
use http::{HeaderMap, Request, Response};
use http_body_util::Empty;
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{ResinError, Result, UpstreamStage};
use crate::node::{BoxedStream, Outbound};

/// Shared TLS client config with the bundled webpki roots.
static TLS_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("ring provider supports the default protocol versions")
    .with_root_certificates(roots)
    .with_no_client_auth();
    Arc::new(config)
});

/// Decomposed request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path_and_query: String,
}

impl Target {
    pub fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|_| ResinError::InvalidArgument(format!("not a URL: {url}")))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ResinError::InvalidArgument(format!("URL has no scheme: {url}")))?
            .to_string();
        if scheme != "http" && scheme != "https" {
            return Err(ResinError::InvalidArgument(format!(
                "unsupported scheme: {scheme}"
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| ResinError::InvalidArgument(format!("URL has no host: {url}")))?
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        Ok(Self {
            scheme,
            host,
            port,
            path_and_query,
        })
    }

    pub fn authority(&self) -> String {
        let default_port = if self.scheme == "https" { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn hostport(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }
}

/// Dial `target` through `outbound`, wrapping TLS for https.
pub async fn dial(outbound: &Arc<dyn Outbound>, target: &Target) -> Result<BoxedStream> {
    let stream = outbound.dial(&target.hostport()).await?;
    if !target.is_tls() {
        return Ok(stream);
    }
    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|_| ResinError::upstream(UpstreamStage::Tls, format!("bad SNI: {}", target.host)))?;
    let connector = TlsConnector::from(TLS_CONFIG.clone());
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ResinError::upstream(UpstreamStage::Tls, e.to_string()))?;
    Ok(Box::new(tls))
}

/// Send one request over a freshly dialed connection, with an overall
/// deadline. The connection is dropped after the response; pooled reuse
/// lives in `node::transport`.
pub async fn send_once<B>(
    outbound: &Arc<dyn Outbound>,
    target: &Target,
    request: Request<B>,
    timeout: Duration,
) -> Result<Response<Incoming>>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let fut = async {
        let stream = dial(outbound, target).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ResinError::upstream(UpstreamStage::Write, e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "upstream connection closed");
            }
        });
        sender
            .send_request(request)
            .await
            .map_err(|e| ResinError::upstream(UpstreamStage::Read, e.to_string()))
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(ResinError::upstream(
            UpstreamStage::Timeout,
            format!("no response within {timeout:?}"),
        )),
    }
}

/// GET a URL through an outbound and return the response body, bounded by
/// `timeout`. Non-2xx statuses are read errors.
pub async fn fetch_body(
    outbound: &Arc<dyn Outbound>,
    url: &str,
    timeout: Duration,
) -> Result<Bytes> {
    let target = Target::parse(url)?;
    let request = Request::builder()
        .method(http::Method::GET)
        .uri(target.path_and_query.clone())
        .header(http::header::HOST, target.authority())
        .header(http::header::USER_AGENT, concat!("resin/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())
        .map_err(|e| ResinError::Internal(e.to_string()))?;
    let response = send_once(outbound, &target, request, timeout).await?;
    let status = response.status();
    if !status.is_success() && status.as_u16() != 204 {
        return Err(ResinError::upstream(
            UpstreamStage::Read,
            format!("unexpected status {status}"),
        ));
    }
    let collected = http_body_util::BodyExt::collect(response.into_body())
        .await
        .map_err(|e| ResinError::upstream(UpstreamStage::Read, e.to_string()))?;
    Ok(collected.to_bytes())
}

/// Hop-by-hop headers stripped when a request is re-issued upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers: the fixed set plus anything the Connection
/// header names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DirectOutbound;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_target_parse() {
        let t = Target::parse("http://x.example/a/b?c=1").unwrap();
        assert_eq!(t.scheme, "http");
        assert_eq!(t.host, "x.example");
        assert_eq!(t.port, 80);
        assert_eq!(t.path_and_query, "/a/b?c=1");
        assert_eq!(t.authority(), "x.example");

        let t = Target::parse("https://x.example:8443").unwrap();
        assert_eq!(t.port, 8443);
        assert!(t.is_tls());
        assert_eq!(t.path_and_query, "/");
        assert_eq!(t.authority(), "x.example:8443");

        assert!(Target::parse("not a url").is_err());
        assert!(Target::parse("ftp://x.example/").is_err());
        assert!(Target::parse("/relative/only").is_err());
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "close, x-custom-hop".parse().unwrap());
        headers.insert("x-custom-hop", "1".parse().unwrap());
        headers.insert("proxy-authorization", "secret".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("accept", "text/plain".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("accept").is_some());
    }

    async fn tiny_http_server(body: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let body = body.to_string();
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = sock.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = sock.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_fetch_body_over_direct_outbound() {
        let addr = tiny_http_server("203.0.113.9\n").await;
        let outbound: Arc<dyn Outbound> = Arc::new(DirectOutbound);
        let body = fetch_body(
            &outbound,
            &format!("http://{addr}/"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(&body[..], b"203.0.113.9\n");
    }

    #[tokio::test]
    async fn test_fetch_body_timeout() {
        // A listener that accepts but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let outbound: Arc<dyn Outbound> = Arc::new(DirectOutbound);
        let err = fetch_body(
            &outbound,
            &format!("http://{addr}/"),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_TIMEOUT");
    }
}
