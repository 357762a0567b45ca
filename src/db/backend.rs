use super::repo::{self, Pool};
use crate::backend::{NotificationBackend, Subscription, SubscriptionId};
use crate::model::{BroadcastNotification, ReadMarker};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

const FEED_BUFFER: usize = 64;

type Pollers = Arc<Mutex<HashMap<SubscriptionId, JoinHandle<()>>>>;

/// `NotificationBackend` over a SQLite pool. Inserts are pushed to subscribers
/// by a poll task per subscription that follows the `notifications.seq` cursor.
pub struct SqliteBackend {
    pool: Pool,
    poll_interval: Duration,
    next_subscription: AtomicU64,
    pollers: Pollers,
}

impl SqliteBackend {
    pub fn new(pool: Pool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
            next_subscription: AtomicU64::new(1),
            pollers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn active_subscriptions(&self) -> usize {
        self.pollers().len()
    }

    fn pollers(&self) -> MutexGuard<'_, HashMap<SubscriptionId, JoinHandle<()>>> {
        lock_pollers(&self.pollers)
    }
}

fn lock_pollers(pollers: &Pollers) -> MutexGuard<'_, HashMap<SubscriptionId, JoinHandle<()>>> {
    pollers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn poll_inserts(
    pool: Pool,
    id: SubscriptionId,
    mut cursor: i64,
    interval: Duration,
    tx: mpsc::Sender<BroadcastNotification>,
) {
    loop {
        match repo::notifications_after(&pool, cursor).await {
            Ok(rows) => {
                for (seq, notification) in rows {
                    cursor = seq;
                    if tx.send(notification).await.is_err() {
                        debug!(subscription = id.0, "subscriber gone; stopping poller");
                        return;
                    }
                }
            }
            Err(err) => warn!(?err, subscription = id.0, "change feed poll failed"),
        }
        if tx.is_closed() {
            debug!(subscription = id.0, "subscriber gone; stopping poller");
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        for (_, poller) in self.pollers().drain() {
            poller.abort();
        }
    }
}

#[async_trait]
impl NotificationBackend for SqliteBackend {
    async fn list_notifications(&self, limit: u32) -> Result<Vec<BroadcastNotification>> {
        repo::list_notifications(&self.pool, limit).await
    }

    async fn list_read_markers(&self, user_id: &str) -> Result<Vec<ReadMarker>> {
        repo::list_read_markers(&self.pool, user_id).await
    }

    async fn insert_read_marker(
        &self,
        user_id: &str,
        notification_id: &str,
        read: bool,
    ) -> Result<ReadMarker> {
        repo::insert_read_marker(&self.pool, user_id, notification_id, read).await
    }

    async fn update_read_marker(&self, marker_id: &str, read: bool) -> Result<()> {
        repo::update_read_marker(&self.pool, marker_id, read).await
    }

    #[instrument(skip_all)]
    async fn subscribe_inserts(&self) -> Result<Subscription> {
        let cursor = repo::max_notification_seq(&self.pool).await?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let pool = self.pool.clone();
        let interval = self.poll_interval;
        let registry = self.pollers.clone();

        // Held across the spawn so a poller that exits at once still finds its entry.
        let mut pollers = self.pollers();
        let poller = tokio::spawn(async move {
            poll_inserts(pool, id, cursor, interval, tx).await;
            lock_pollers(&registry).remove(&id);
        });
        pollers.insert(id, poller);
        drop(pollers);
        debug!(subscription = id.0, cursor, "subscribed to notification inserts");

        Ok(Subscription { id, events: rx })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(poller) = self.pollers().remove(&id) {
            poller.abort();
            debug!(subscription = id.0, "unsubscribed from notification inserts");
        }
    }
}
