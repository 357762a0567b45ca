//! Contracts the reconciler depends on: the data source and the auth provider.
//!
//! The reconciler never talks to SQL directly. Anything that can list
//! notifications, store read markers and push newly inserted broadcasts can sit
//! behind [`NotificationBackend`]; `crate::db::SqliteBackend` is the bundled one.

use crate::model::{BroadcastNotification, CurrentUser, ReadMarker};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Handle identifying one live subscription on a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Push handle for newly inserted broadcast notifications.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::Receiver<BroadcastNotification>,
}

#[async_trait]
pub trait NotificationBackend: Send + Sync {
    /// Most recent broadcasts, newest first, at most `limit` of them.
    async fn list_notifications(&self, limit: u32) -> Result<Vec<BroadcastNotification>>;

    async fn list_read_markers(&self, user_id: &str) -> Result<Vec<ReadMarker>>;

    async fn insert_read_marker(
        &self,
        user_id: &str,
        notification_id: &str,
        read: bool,
    ) -> Result<ReadMarker>;

    async fn update_read_marker(&self, marker_id: &str, read: bool) -> Result<()>;

    async fn subscribe_inserts(&self) -> Result<Subscription>;

    /// Release the backend side of a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<CurrentUser>;
}

/// Auth provider for a session fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    user: Option<CurrentUser>,
}

impl StaticAuth {
    pub fn new(user: Option<CurrentUser>) -> Self {
        Self { user }
    }

    pub fn signed_in(user: CurrentUser) -> Self {
        Self { user: Some(user) }
    }
}

impl AuthProvider for StaticAuth {
    fn current_user(&self) -> Option<CurrentUser> {
        self.user.clone()
    }
}
