//! Escalade: escalation and notification dispatch engine for on-call
//! alerting.
//!
//! Alerts are ingested, deduplicated into alert groups, and walked through
//! escalation chains that page users via their personal notification
//! policies. All delayed work runs through a Postgres-backed task queue;
//! handlers are idempotent so the queue can be at-least-once.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod queue;
pub mod services;
