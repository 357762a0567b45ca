//! SQLite stand-in for the hosted backend.
//!
//! - `model`: profile rows and publish inputs.
//! - `repo`: SQL-only functions that map rows into domain types.
//! - `backend`: [`SqliteBackend`], the `NotificationBackend` implementation with
//!   a polling change feed.

pub mod backend;
pub mod model;
pub mod repo;

pub use backend::SqliteBackend;
pub use model::{NewNotification, Profile};
pub use repo::*;
