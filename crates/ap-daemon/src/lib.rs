//! The autopilot daemon: engine loop, supervisor and their wiring.
//!
//! - **state_machine**: validated run-state transitions with history
//! - **activity**: shared liveness record the engine touches and the supervisor reads
//! - **lifecycle**: the start/stop seam the supervisor drives
//! - **supervisor**: stall detection, rest windows, bounded restarts with cooldown
//! - **engine**: one proposal/approval/dispatch cycle per tick
//! - **runner**: owns the engine state and recycles the loop task
//! - **daemon**: builds everything from [`Config`](ap_core::config::Config) and runs it

pub mod activity;
pub mod daemon;
pub mod engine;
pub mod lifecycle;
pub mod runner;
pub mod state_machine;
pub mod supervisor;
