//! Seams between the engine and the outside world.
//!
//! - **executor**: the [`Executor`](executor::Executor) trait plus a stub backend
//! - **command**: an executor that runs a local process
//! - **proposer**: action/goal proposal and context snapshot traits
//! - **signal**: one-shot stop signal used for dispatch abort and daemon shutdown

pub mod command;
pub mod executor;
pub mod proposer;
pub mod signal;
