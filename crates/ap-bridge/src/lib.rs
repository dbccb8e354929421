//! Engine event protocol and the in-process bus that carries it.

pub mod event_bus;
pub mod protocol;
