use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("unknown level: {0:?}")]
    UnknownLevel(String),
    #[error("unknown role: {0:?}")]
    UnknownRole(String),
}

/// Cohort a student belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Level {
    #[serde(rename = "100")]
    L100,
    #[serde(rename = "200")]
    L200,
    #[serde(rename = "300")]
    L300,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::L100 => "100",
            Level::L200 => "200",
            Level::L300 => "300",
        }
    }
}

impl FromStr for Level {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "100" => Ok(Level::L100),
            "200" => Ok(Level::L200),
            "300" => Ok(Level::L300),
            other => Err(ModelError::UnknownLevel(other.to_string())),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Audience of a broadcast: one level, or the `all` wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetLevel {
    All,
    Level(Level),
}

impl TargetLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetLevel::All => "all",
            TargetLevel::Level(level) => level.as_str(),
        }
    }

    /// A user without a level (teachers) only sees `all` broadcasts.
    pub fn matches(&self, level: Option<Level>) -> bool {
        match self {
            TargetLevel::All => true,
            TargetLevel::Level(target) => level == Some(*target),
        }
    }
}

impl FromStr for TargetLevel {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(TargetLevel::All);
        }
        s.parse().map(TargetLevel::Level)
    }
}

impl fmt::Display for TargetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl Serialize for TargetLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TargetLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
        }
    }
}

impl FromStr for Role {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            other => Err(ModelError::UnknownRole(other.to_string())),
        }
    }
}

/// Identity handed out by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    pub level: Option<Level>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastNotification {
    pub id: String,
    pub title: String,
    pub message: String,
    pub target_level: TargetLevel,
    pub created_at: DateTime<Utc>,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMarker {
    pub id: String,
    pub user_id: String,
    pub notification_id: String,
    pub read: bool,
}

/// Result of looking up a user's read marker for one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "marker", content = "id", rename_all = "lowercase")]
pub enum MarkerLookup {
    Existing(String),
    Absent,
}

impl MarkerLookup {
    pub fn marker_id(&self) -> Option<&str> {
        match self {
            MarkerLookup::Existing(id) => Some(id),
            MarkerLookup::Absent => None,
        }
    }
}

/// A broadcast notification joined with the current user's read state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationView {
    #[serde(flatten)]
    pub notification: BroadcastNotification,
    pub is_read: bool,
    pub marker: MarkerLookup,
}

impl NotificationView {
    /// Fresh view for a notification the user has never touched.
    pub fn unread(notification: BroadcastNotification) -> Self {
        Self {
            notification,
            is_read: false,
            marker: MarkerLookup::Absent,
        }
    }

    pub fn id(&self) -> &str {
        &self.notification.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_level_matching() {
        let target: TargetLevel = "200".parse().unwrap();
        assert!(target.matches(Some(Level::L200)));
        assert!(!target.matches(Some(Level::L100)));
        assert!(!target.matches(Some(Level::L300)));
        assert!(!target.matches(None));

        assert!(TargetLevel::All.matches(Some(Level::L100)));
        assert!(TargetLevel::All.matches(None));
    }

    #[test]
    fn parse_levels_and_roles() {
        assert_eq!("ALL".parse::<TargetLevel>().unwrap(), TargetLevel::All);
        assert_eq!(
            "300".parse::<TargetLevel>().unwrap(),
            TargetLevel::Level(Level::L300)
        );
        assert_eq!(
            "400".parse::<Level>().unwrap_err(),
            ModelError::UnknownLevel("400".into())
        );
        assert_eq!("Teacher".parse::<Role>().unwrap(), Role::Teacher);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn view_serializes_flat() {
        let view = NotificationView::unread(BroadcastNotification {
            id: "n1".into(),
            title: "A".into(),
            message: "hello".into(),
            target_level: TargetLevel::Level(Level::L200),
            created_at: Utc::now(),
            content_id: None,
        });
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "n1");
        assert_eq!(json["target_level"], "200");
        assert_eq!(json["is_read"], false);
        assert_eq!(json["marker"]["marker"], "absent");
    }
}
