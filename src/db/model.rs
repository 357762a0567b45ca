//! Rows and inputs specific to the SQLite data source.
//!
//! The shared domain types live in `crate::model`; these only exist because the
//! bundled backend also plays the auth and teacher-upload roles.

use crate::model::{CurrentUser, Level, Role, TargetLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub full_name: String,
    pub role: Role,
    pub level: Option<Level>,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn as_current_user(&self) -> CurrentUser {
        CurrentUser {
            id: self.id.clone(),
            level: self.level,
        }
    }
}

/// Broadcast a teacher is about to publish.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub title: String,
    pub message: String,
    pub target_level: TargetLevel,
    pub content_id: Option<String>,
}
