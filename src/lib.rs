//! # Claude API Server
//!
//! A long-running HTTP service that fronts the Claude CLI.
//!
//! This library provides:
//! - An HTTP API for synchronous and queued prompt execution
//! - Sessions with running cost and message counters
//! - A durable, priority-ordered task queue with webhook callbacks
//! - File-locked JSON stores shared safely with control tooling
//! - Hot-reloaded configuration
//!
//! ## Request Flow
//!
//! ```text
//!   HTTP request ──sync──▶ Agent Executor ──▶ inline response
//!        │
//!        └──async──▶ Task Queue ──▶ Task Store ──▶ scheduler
//!                                       │
//!                                       ▼
//!                               Agent Executor ──▶ Webhook Notifier
//! ```
//!
//! The executor records every attempt in the statistics store and
//! attributes cost to the owning session.
//!
//! ## Modules
//! - `api`: HTTP surface (routes, wire types)
//! - `executor`: agent CLI child process supervision and budgets
//! - `queue`: bounded-concurrency priority scheduler
//! - `store`: sessions, tasks, and statistics documents
//! - `config`: configuration, path detection, hot reload

pub mod api;
pub mod collector;
pub mod config;
pub mod executor;
pub mod logging;
pub mod queue;
pub mod rate_limit;
pub mod server;
pub mod store;
pub mod webhook;

pub use config::Config;
pub use executor::{CliExecutor, ExecuteOptions, ExecutionOutcome, Executor};
pub use queue::{QueueEvent, TaskQueue};
pub use webhook::WebhookNotifier;
