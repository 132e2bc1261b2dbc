// # Event bus
//
// Lease and request events for observability sinks. Emission is synchronous
// on the mutating task; subscribers must be non-blocking and queue their own
// work if they need to do anything expensive.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseEventKind {
    Create,
    Replace,
    Touch,
    Expire,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseEvent {
    pub kind: LeaseEventKind,
    pub platform_id: String,
    pub account: String,
    pub node_hash: String,
    pub egress_ip: String,
    pub at_ns: i64,
}

/// Outcome of one proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Ok,
    UpstreamError,
    NoHealthyNode,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestFinished {
    pub platform_id: String,
    pub account: String,
    pub node_hash: String,
    pub target: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration: Duration,
    pub outcome: RequestOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub method: String,
    pub status: u16,
    #[serde(flatten)]
    pub finished: RequestFinished,
}

type LeaseListener = Arc<dyn Fn(&LeaseEvent) + Send + Sync>;
type RequestListener = Arc<dyn Fn(&RequestFinished) + Send + Sync>;
type RequestLogListener = Arc<dyn Fn(&RequestLog) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    lease: RwLock<Vec<LeaseListener>>,
    request: RwLock<Vec<RequestListener>>,
    request_log: RwLock<Vec<RequestLogListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_lease(&self, cb: LeaseListener) {
        self.lease.write().push(cb);
    }

    pub fn subscribe_request(&self, cb: RequestListener) {
        self.request.write().push(cb);
    }

    pub fn subscribe_request_log(&self, cb: RequestLogListener) {
        self.request_log.write().push(cb);
    }

    pub fn emit_lease(&self, event: &LeaseEvent) {
        for cb in self.lease.read().iter() {
            cb(event);
        }
    }

    pub fn emit_request(&self, event: &RequestFinished) {
        for cb in self.request.read().iter() {
            cb(event);
        }
    }

    pub fn emit_request_log(&self, event: &RequestLog) {
        for cb in self.request_log.read().iter() {
            cb(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lease_events_reach_all_subscribers() {
        let bus = EventBus::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        for counter in [a.clone(), b.clone()] {
            bus.subscribe_lease(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        bus.emit_lease(&LeaseEvent {
            kind: LeaseEventKind::Create,
            platform_id: "p".into(),
            account: "a".into(),
            node_hash: "h".into(),
            egress_ip: "1.2.3.4".into(),
            at_ns: 1,
        });
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }
}
