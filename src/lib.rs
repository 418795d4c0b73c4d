//! Purpose: Library crate behind the `rowrelay` CLI: SQL result → queue message relay.
//! Exports: `core` (errors, rows, payload codecs, step guard), `source`, `broker`,
//!          `relay`, `config`.
//! Role: Keeps every stage testable with in-memory backends; the CLI only wires settings.
//! Invariants: Stages exchange only `ResultSet` and `Payload` values.
//! Invariants: Stages take explicit inputs; no global settings or hardcoded endpoints.
pub mod broker;
pub mod config;
pub mod core;
pub mod relay;
pub mod source;

pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::payload::{Payload, PayloadFormat, decode, encode};
pub use crate::core::row::{Cell, ResultSet, Row};
pub use crate::relay::{Relay, RelayReport, RelaySettings};
