//! Broadcast notification feed with per-user read state.
//!
//! [`reconciler::Reconciler`] merges broadcast notifications with the signed-in
//! user's read markers, keeps the result current from a live insert feed, and
//! marks entries read. [`db::SqliteBackend`] is a bundled data source.

pub mod backend;
pub mod chime;
pub mod config;
pub mod db;
pub mod model;
pub mod reconciler;
pub mod store;
