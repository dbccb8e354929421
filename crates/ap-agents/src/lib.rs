//! Work-handling components that sit between proposals and execution.
//!
//! - **approval**: expiring queue of actions awaiting human sign-off
//! - **goal_manager**: goal selection, activation and progress sync
//! - **registry**: named executors and the configured dispatch chain
//! - **dispatcher**: single-flight execution with timeout and fallback

pub mod approval;
pub mod dispatcher;
pub mod goal_manager;
pub mod registry;
