//! Shared data model for DomainOS.
//!
//! Every entity that crosses a subsystem boundary (store rows, automation
//! event payloads, parser outputs that get persisted) lives here so that the
//! core runtime, the storage layer, and the host shell agree on one shape.

pub mod entities;
pub mod events;

pub use entities::*;
pub use events::*;
