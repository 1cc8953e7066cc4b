//! ferry-core — wire format, exchange keys, envelopes, and configuration.
//! The engine and daemon crates depend on this one.

pub mod config;
pub mod envelope;
pub mod key;
pub mod wire;

pub use envelope::{Action, DirectKind, DirectMessage, Envelope};
pub use key::Key;
pub use wire::{PacketHeader, PayloadKind, WireError};
