// # Subscription scheduler
//
// Drives periodic and on-demand refreshes. Different subscriptions refresh in
// parallel; refreshes of one subscription serialise on its state lock. The
// mandatory start-up pass force-refreshes everything before the periodic loop
// begins.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{parse_feed, Downloader, SubscriptionManager};
use crate::error::Result;
use crate::util::now_ns;

const TICK: Duration = Duration::from_secs(10);

pub struct SubscriptionScheduler {
    manager: Arc<SubscriptionManager>,
    downloader: Arc<Downloader>,
}

impl SubscriptionScheduler {
    pub fn new(manager: Arc<SubscriptionManager>, downloader: Arc<Downloader>) -> Self {
        Self {
            manager,
            downloader,
        }
    }

    /// Fetch and apply one subscription now, regardless of enablement or
    /// schedule. Two concurrent calls for the same subscription serialise.
    pub async fn refresh_now(&self, id: &str) -> Result<()> {
        let state = self
            .manager
            .state(id)
            .ok_or_else(|| crate::error::ResinError::NotFound(format!("subscription {id}")))?;
        let _serialised = state.refresh_lock.lock().await;
        let url = state.record.read().url.clone();

        match self.downloader.fetch(&url).await {
            Ok(body) => match parse_feed(&body) {
                Ok(feed) => {
                    self.manager.apply_feed(id, feed)?;
                    debug!(id, "subscription refreshed");
                    Ok(())
                }
                Err(e) => {
                    self.manager.record_refresh_error(id, &e.to_string());
                    Err(e)
                }
            },
            Err(e) => {
                self.manager.record_refresh_error(id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Refresh every subscription concurrently; errors are recorded on the
    /// subscription, not propagated.
    pub async fn refresh_all_now(self: Arc<Self>) {
        let ids = self.manager.ids();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = this.refresh_now(&id).await {
                    warn!(id = %id, error = %e, "refresh failed");
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    /// Periodic loop. The start-up pass refreshes everything immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("subscription scheduler started, force-refreshing all");
        self.clone().refresh_all_now().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(TICK) => {}
            }
            let now = now_ns();
            for sub in self.manager.list() {
                if !sub.enabled {
                    continue;
                }
                let due = now - sub.last_refresh_at_ns >= sub.update_interval_ns;
                if !due {
                    continue;
                }
                let this = self.clone();
                let id = sub.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.refresh_now(&id).await {
                        warn!(id = %id, error = %e, "scheduled refresh failed");
                    }
                });
            }
        }
        info!("subscription scheduler stopped");
    }
}
