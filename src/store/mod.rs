//! Persistent JSON document stores.
//!
//! Every durable piece of state (sessions, tasks, statistics) is a single
//! JSON document on disk wrapped in [`JsonDocument`], which serializes
//! access with a companion `<doc>.lock` file so that a control tool and the
//! server can safely touch the same files.

mod document;
pub mod sessions;
pub mod statistics;
pub mod tasks;

pub use document::{JsonDocument, StoreError};
