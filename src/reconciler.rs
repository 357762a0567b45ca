//! Keeps a per-user view of broadcast notifications in sync with the backend.
//!
//! A fetch pulls the newest broadcasts plus the user's read markers and merges
//! them; marking an entry read writes (or lazily creates) the user's marker and
//! patches the entry in place; an active [`LiveFeed`] prepends newly broadcast
//! notifications for the user's level as they arrive.

use crate::backend::{AuthProvider, NotificationBackend, SubscriptionId};
use crate::chime::Chime;
use crate::model::{
    BroadcastNotification, CurrentUser, Level, MarkerLookup, NotificationView, ReadMarker,
};
use crate::store::{ApplyOutcome, NotificationStore, Phase, WriteStart};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_FETCH_LIMIT: u32 = 50;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to retrieve notifications: {0:#}")]
    Retrieval(anyhow::Error),
    #[error("failed to write read marker: {0:#}")]
    Write(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied { count: usize, chimed: bool },
    SignedOut,
    Stale,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked { marker_id: String },
    AlreadyRead,
    InFlight,
    SignedOut,
    Discarded,
}

/// What the UI layer renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationFeed {
    pub notifications: Vec<NotificationView>,
    pub unread_count: usize,
    pub is_loading: bool,
}

pub struct Reconciler {
    backend: Arc<dyn NotificationBackend>,
    auth: Arc<dyn AuthProvider>,
    chime: Arc<dyn Chime>,
    store: Arc<Mutex<NotificationStore>>,
    last_newest_id: Mutex<Option<String>>,
    live: Mutex<Option<LiveFeed>>,
    fetch_limit: u32,
}

impl Reconciler {
    pub fn new(
        backend: Arc<dyn NotificationBackend>,
        auth: Arc<dyn AuthProvider>,
        chime: Arc<dyn Chime>,
    ) -> Self {
        Self {
            backend,
            auth,
            chime,
            store: Arc::new(Mutex::new(NotificationStore::new())),
            last_newest_id: Mutex::new(None),
            live: Mutex::new(None),
            fetch_limit: DEFAULT_FETCH_LIMIT,
        }
    }

    pub fn with_fetch_limit(mut self, limit: u32) -> Self {
        self.fetch_limit = limit;
        self
    }

    pub async fn snapshot(&self) -> NotificationFeed {
        let store = self.store.lock().await;
        NotificationFeed {
            notifications: store.views().to_vec(),
            unread_count: store.unread_count(),
            is_loading: store.is_loading(),
        }
    }

    pub async fn unread_count(&self) -> usize {
        self.store.lock().await.unread_count()
    }

    pub async fn phase(&self) -> Phase {
        self.store.lock().await.phase()
    }

    /// Revision counter bumped on every change to the list.
    pub async fn changes(&self) -> watch::Receiver<u64> {
        self.store.lock().await.subscribe()
    }

    #[instrument(skip_all)]
    pub async fn fetch(&self) -> Result<FetchOutcome, SyncError> {
        let Some(user) = self.auth.current_user() else {
            self.store.lock().await.reset();
            return Ok(FetchOutcome::SignedOut);
        };

        let Some(ticket) = self.store.lock().await.begin_fetch() else {
            return Ok(FetchOutcome::Discarded);
        };

        let fetched = match self.retrieve(&user).await {
            Ok(views) => views,
            Err(err) => {
                warn!(%err, user_id = %user.id, "notification fetch failed; keeping previous list");
                self.store.lock().await.abort_fetch(ticket);
                return Err(err);
            }
        };

        let count = fetched.len();
        let outcome = self.store.lock().await.replace_on_fetch(ticket, fetched);
        let newest_id = match outcome {
            ApplyOutcome::Applied { newest_id } => newest_id,
            ApplyOutcome::Stale => {
                debug!("discarding outdated fetch result");
                return Ok(FetchOutcome::Stale);
            }
            ApplyOutcome::Closed => return Ok(FetchOutcome::Discarded),
        };

        let chimed = self.observe_newest(newest_id).await;
        if chimed {
            self.chime.play();
        }
        info!(count, chimed, "notifications fetched");
        Ok(FetchOutcome::Applied { count, chimed })
    }

    /// Fetch, logging instead of returning failures.
    pub async fn refetch(&self) {
        if let Err(err) = self.fetch().await {
            debug!(%err, "refetch failed");
        }
    }

    async fn retrieve(&self, user: &CurrentUser) -> Result<Vec<NotificationView>, SyncError> {
        let notifications = self
            .backend
            .list_notifications(self.fetch_limit)
            .await
            .map_err(SyncError::Retrieval)?;
        let markers = self
            .backend
            .list_read_markers(&user.id)
            .await
            .map_err(SyncError::Retrieval)?;
        Ok(merge(notifications, &markers, user.level))
    }

    /// Track the newest id; true when it changed from a previously seen one.
    async fn observe_newest(&self, newest_id: Option<String>) -> bool {
        let Some(newest_id) = newest_id else {
            return false;
        };
        let mut last = self.last_newest_id.lock().await;
        let changed = last.as_deref().is_some_and(|prev| prev != newest_id);
        *last = Some(newest_id);
        changed
    }

    #[instrument(skip_all, fields(notification_id = %view.id()))]
    pub async fn mark_as_read(&self, view: &NotificationView) -> Result<MarkOutcome, SyncError> {
        let Some(user) = self.auth.current_user() else {
            return Ok(MarkOutcome::SignedOut);
        };

        let marker = match self.store.lock().await.begin_write(view) {
            WriteStart::Proceed(marker) => marker,
            WriteStart::AlreadyRead => return Ok(MarkOutcome::AlreadyRead),
            WriteStart::InFlight => return Ok(MarkOutcome::InFlight),
            WriteStart::Closed => return Ok(MarkOutcome::Discarded),
        };

        let written = match marker {
            MarkerLookup::Existing(marker_id) => self
                .backend
                .update_read_marker(&marker_id, true)
                .await
                .map(|_| marker_id),
            MarkerLookup::Absent => self
                .backend
                .insert_read_marker(&user.id, view.id(), true)
                .await
                .map(|marker| marker.id),
        };

        let mut store = self.store.lock().await;
        match written {
            Ok(marker_id) => {
                if store.is_closed() {
                    return Ok(MarkOutcome::Discarded);
                }
                if !store.patch_read(view.id(), &marker_id) {
                    store.finish_write(view.id());
                    debug!("marked entry is no longer in the list");
                }
                Ok(MarkOutcome::Marked { marker_id })
            }
            Err(err) => {
                store.finish_write(view.id());
                let err = SyncError::Write(err);
                warn!(%err, "mark as read failed; entry stays unread");
                Err(err)
            }
        }
    }

    /// Open the live subscription. Replaces any feed already open.
    #[instrument(skip_all)]
    pub async fn activate(&self) -> Result<(), SyncError> {
        let feed = LiveFeed::open(
            self.backend.clone(),
            self.auth.clone(),
            self.chime.clone(),
            self.store.clone(),
        )
        .await?;
        if let Some(previous) = self.live.lock().await.replace(feed) {
            previous.close();
        }
        Ok(())
    }

    /// Open the live feed, then load the list, so nothing broadcast in between
    /// is missed.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.activate().await?;
        self.refetch().await;
        Ok(())
    }

    pub async fn deactivate(&self) {
        if let Some(feed) = self.live.lock().await.take() {
            feed.close();
        }
    }

    pub async fn is_active(&self) -> bool {
        self.live.lock().await.is_some()
    }

    /// Release the live feed and stop accepting results from in-flight requests.
    pub async fn teardown(&self) {
        self.deactivate().await;
        self.store.lock().await.close();
    }
}

/// Join broadcasts with the user's read markers, keeping only those for `level`.
pub fn merge(
    notifications: Vec<BroadcastNotification>,
    markers: &[ReadMarker],
    level: Option<Level>,
) -> Vec<NotificationView> {
    let by_notification: HashMap<&str, &ReadMarker> = markers
        .iter()
        .map(|m| (m.notification_id.as_str(), m))
        .collect();

    notifications
        .into_iter()
        .filter(|n| n.target_level.matches(level))
        .map(|notification| match by_notification.get(notification.id.as_str()) {
            Some(marker) => NotificationView {
                is_read: marker.read,
                marker: MarkerLookup::Existing(marker.id.clone()),
                notification,
            },
            None => NotificationView::unread(notification),
        })
        .collect()
}

/// Live subscription to newly inserted broadcasts. Closing (or dropping) it
/// stops the forwarding task and releases the backend subscription.
pub struct LiveFeed {
    backend: Arc<dyn NotificationBackend>,
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

impl LiveFeed {
    async fn open(
        backend: Arc<dyn NotificationBackend>,
        auth: Arc<dyn AuthProvider>,
        chime: Arc<dyn Chime>,
        store: Arc<Mutex<NotificationStore>>,
    ) -> Result<Self, SyncError> {
        let subscription = backend
            .subscribe_inserts()
            .await
            .map_err(SyncError::Retrieval)?;
        let id = subscription.id;
        let mut events = subscription.events;
        info!(subscription = id.0, "live notification feed opened");

        let task = tokio::spawn(async move {
            while let Some(notification) = events.recv().await {
                let Some(user) = auth.current_user() else {
                    debug!(id = %notification.id, "ignoring broadcast while signed out");
                    continue;
                };
                if !notification.target_level.matches(user.level) {
                    debug!(id = %notification.id, target = %notification.target_level, "ignoring broadcast for another level");
                    continue;
                }
                let id = notification.id.clone();
                let inserted = store
                    .lock()
                    .await
                    .prepend_insert(NotificationView::unread(notification));
                if inserted {
                    info!(%id, "new notification");
                    chime.play();
                }
            }
            debug!("live notification stream ended");
        });

        Ok(Self {
            backend,
            subscription: id,
            task,
        })
    }

    pub fn close(self) {
        // Drop does the work.
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        self.task.abort();
        self.backend.unsubscribe(self.subscription);
        debug!(subscription = self.subscription.0, "live notification feed closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TargetLevel;
    use chrono::{Duration, TimeZone, Utc};

    fn notification(id: &str, target: TargetLevel, minutes: i64) -> BroadcastNotification {
        BroadcastNotification {
            id: id.into(),
            title: id.to_uppercase(),
            message: "body".into(),
            target_level: target,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minutes),
            content_id: None,
        }
    }

    fn marker(id: &str, notification_id: &str, read: bool) -> ReadMarker {
        ReadMarker {
            id: id.into(),
            user_id: "u1".into(),
            notification_id: notification_id.into(),
            read,
        }
    }

    #[test]
    fn merge_joins_markers_by_notification() {
        let views = merge(
            vec![
                notification("n3", TargetLevel::All, 3),
                notification("n2", TargetLevel::All, 2),
                notification("n1", TargetLevel::All, 1),
            ],
            &[marker("m1", "n1", true), marker("m2", "n2", false)],
            Some(Level::L100),
        );

        assert_eq!(views.len(), 3);
        assert!(!views[0].is_read);
        assert_eq!(views[0].marker, MarkerLookup::Absent);
        assert!(!views[1].is_read);
        assert_eq!(views[1].marker, MarkerLookup::Existing("m2".into()));
        assert!(views[2].is_read);
        assert_eq!(views[2].marker, MarkerLookup::Existing("m1".into()));
    }

    #[test]
    fn merge_filters_other_levels() {
        let views = merge(
            vec![
                notification("n3", TargetLevel::Level(Level::L300), 3),
                notification("n2", TargetLevel::Level(Level::L200), 2),
                notification("n1", TargetLevel::All, 1),
            ],
            &[],
            Some(Level::L200),
        );
        let ids: Vec<_> = views.iter().map(|v| v.id()).collect();
        assert_eq!(ids, vec!["n2", "n1"]);

        let teacher = merge(
            vec![notification("n2", TargetLevel::Level(Level::L200), 2)],
            &[],
            None,
        );
        assert!(teacher.is_empty());
    }
}
