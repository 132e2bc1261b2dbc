// # Node topology
//
// Identity hashing, per-node state, outbound dialers, the pooled upstream
// transports, and the authoritative pool itself.

pub mod entry;
pub mod identity;
pub mod latency;
pub mod outbound;
pub mod pool;
pub mod transport;

pub use entry::{NodeEntry, NodeSummary};
pub use identity::{canonical_json, identity_of, NodeHash};
pub use latency::{LatencySample, LatencyTable};
pub use outbound::{
    AsyncStream, BoxedStream, DefaultOutboundFactory, DirectOutbound, Outbound, OutboundFactory,
};
pub use pool::NodePool;
pub use transport::TransportPool;
