// # Upstream transport pool
//
// Pooled HTTP/1 connections through a node's outbound, keyed by
// (node, origin). Proxied requests check a sender out, use it, and put it
// back; probes bypass the pool so their RTT includes connection setup.
// Evicting a node drops its senders, which closes the underlying
// connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::TokioIo;
use tracing::debug;

use super::entry::NodeEntry;
use super::identity::NodeHash;
use crate::error::{ResinError, Result, UpstreamStage};
use crate::proxy::upstream::{dial, Target};

pub type PooledBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;
type Sender = hyper::client::conn::http1::SendRequest<PooledBody>;

struct IdleConn {
    sender: Sender,
    parked_at: Instant,
}

pub struct TransportPool {
    idle: DashMap<(NodeHash, String), Vec<IdleConn>>,
    max_idle_per_key: usize,
    idle_timeout: Duration,
}

impl TransportPool {
    pub fn new(max_idle_per_key: usize, idle_timeout: Duration) -> Self {
        Self {
            idle: DashMap::new(),
            max_idle_per_key,
            idle_timeout,
        }
    }

    /// Send one request to `target` through `node`, reusing a pooled
    /// connection when one is alive.
    pub async fn send(
        &self,
        node: &Arc<NodeEntry>,
        target: &Target,
        request: Request<PooledBody>,
        timeout: Duration,
    ) -> Result<Response<Incoming>> {
        let key = (node.hash.clone(), origin_key(target));

        let fut = async {
            let mut sender = match self.checkout(&key).await {
                Some(s) => s,
                None => self.connect(node, target).await?,
            };
            let response = sender
                .send_request(request)
                .await
                .map_err(|e| ResinError::upstream(UpstreamStage::Read, e.to_string()))?;
            self.park(key, sender);
            Ok(response)
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ResinError::upstream(
                UpstreamStage::Timeout,
                format!("no response within {timeout:?}"),
            )),
        }
    }

    async fn checkout(&self, key: &(NodeHash, String)) -> Option<Sender> {
        loop {
            let candidate = {
                let mut idle = self.idle.get_mut(key)?;
                // Drop connections parked past the idle deadline.
                idle.retain(|c| c.parked_at.elapsed() < self.idle_timeout);
                idle.pop()
            }?;
            let mut sender = candidate.sender;
            if sender.ready().await.is_ok() {
                return Some(sender);
            }
            // Connection died while parked; try the next one.
        }
    }

    fn park(&self, key: (NodeHash, String), sender: Sender) {
        let mut idle = self.idle.entry(key).or_default();
        if idle.len() < self.max_idle_per_key {
            idle.push(IdleConn {
                sender,
                parked_at: Instant::now(),
            });
        }
    }

    async fn connect(&self, node: &Arc<NodeEntry>, target: &Target) -> Result<Sender> {
        let outbound = node.outbound().ok_or_else(|| {
            ResinError::upstream(UpstreamStage::Dial, "node has no outbound".to_string())
        })?;
        let stream = dial(&outbound, target).await?;
        let io = TokioIo::new(stream);
        let (sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ResinError::upstream(UpstreamStage::Write, e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "pooled upstream connection closed");
            }
        });
        Ok(sender)
    }

    /// Drop every pooled connection of a node.
    pub fn evict_node(&self, hash: &str) {
        self.idle.retain(|(node, _), _| node != hash);
    }

    pub fn idle_len(&self) -> usize {
        self.idle.iter().map(|e| e.value().len()).sum()
    }
}

fn origin_key(target: &Target) -> String {
    format!("{}://{}:{}", target.scheme, target.host, target.port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DirectOutbound;
    use http_body_util::{BodyExt, Empty};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn empty_body() -> PooledBody {
        Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
    }

    fn node() -> Arc<NodeEntry> {
        let entry = Arc::new(NodeEntry::new("h1".into(), json!({"type": "direct"}), 8, 0));
        entry.set_outbound(Some(Arc::new(DirectOutbound)));
        entry
    }

    async fn keepalive_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        let response = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";
                        if sock.write_all(response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connection_reuse_and_eviction() {
        let addr = keepalive_server().await;
        let pool = TransportPool::new(4, Duration::from_secs(30));
        let node = node();
        let target = Target::parse(&format!("http://{addr}/")).unwrap();

        for _ in 0..3 {
            let req = Request::builder()
                .uri("/")
                .header(http::header::HOST, target.authority())
                .body(empty_body())
                .unwrap();
            let resp = pool
                .send(&node, &target, req, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
            // Drain so the connection is reusable.
            let _ = resp.into_body().collect().await;
        }
        assert_eq!(pool.idle_len(), 1);

        pool.evict_node(&node.hash);
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn test_no_outbound_is_dial_error() {
        let pool = TransportPool::new(4, Duration::from_secs(30));
        let entry = Arc::new(NodeEntry::new("h2".into(), json!({}), 8, 0));
        let target = Target::parse("http://127.0.0.1:9/").unwrap();
        let req = Request::builder().uri("/").body(empty_body()).unwrap();
        let err = pool
            .send(&entry, &target, req, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_DIAL");
    }
}
