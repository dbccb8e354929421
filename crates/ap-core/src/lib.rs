//! Core data model and persistence for the autopilot engine.
//!
//! - **types**: goals, actions, work log entries, engine state
//! - **config**: TOML configuration with per-section defaults
//! - **goal_store**: durable, sequence-ordered goal records
//! - **work_log**: bounded append-only lifecycle history
//! - **risk**: pure auto/manual approval classification

pub mod config;
pub mod goal_store;
pub mod risk;
pub mod types;
pub mod work_log;
