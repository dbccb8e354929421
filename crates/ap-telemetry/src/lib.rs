//! Logging setup shared by the autopilot binaries.
//!
//! Output is either human-readable or JSON lines, selected by
//! `general.log_format`. `RUST_LOG` always wins over the configured level.

pub mod logging;
