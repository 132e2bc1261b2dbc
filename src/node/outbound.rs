// # Outbound dialers
//
// The proxy-protocol layer is opaque to the routing core: an `Outbound` can
// dial a `host:port` and hand back a byte stream, nothing more. Protocol
// implementations (SOCKS, Shadowsocks, Trojan, ...) plug in through
// `OutboundFactory`; the bundled factory knows only the `direct` type, which
// dials plain TCP and is what the tests run against.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{ResinError, Result, UpstreamStage};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

impl std::fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxedStream")
    }
}

pub type BoxedStream = Box<dyn AsyncStream>;

/// An established upstream proxy endpoint.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Protocol name, for logs and node summaries.
    fn kind(&self) -> &'static str;

    /// Open a stream to `target` (`host:port`) through this node.
    async fn dial(&self, target: &str) -> Result<BoxedStream>;
}

/// Builds an `Outbound` from a node's raw options. Returning an error leaves
/// the node without an outbound, which keeps it out of every routable view.
pub trait OutboundFactory: Send + Sync {
    fn build(&self, options: &Value) -> Result<Arc<dyn Outbound>>;
}

/// Plain TCP dialer; `{"type": "direct"}`.
pub struct DirectOutbound;

#[async_trait]
impl Outbound for DirectOutbound {
    fn kind(&self) -> &'static str {
        "direct"
    }

    async fn dial(&self, target: &str) -> Result<BoxedStream> {
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| ResinError::upstream(UpstreamStage::Dial, e.to_string()))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

/// Factory for the bundled outbound types.
pub struct DefaultOutboundFactory;

impl OutboundFactory for DefaultOutboundFactory {
    fn build(&self, options: &Value) -> Result<Arc<dyn Outbound>> {
        let kind = options
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ResinError::InvalidArgument("node options missing \"type\"".into()))?;
        match kind {
            "direct" => Ok(Arc::new(DirectOutbound)),
            other => Err(ResinError::InvalidArgument(format!(
                "unsupported outbound type: {other}"
            ))),
        }
    }
}
