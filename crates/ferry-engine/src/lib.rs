//! ferry-engine — the per-connection protocol engine and its tokio driver.
//!
//! [`Engine`] is the sans-I/O state machine: chunking, the one-slot send
//! serializer, the receive multiplexer, cancellation and deadlines.
//! [`connection`] runs an engine over a byte stream and [`listener`] accepts
//! many of them.

pub mod cancel;
pub mod connection;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod listener;
pub mod multiplexer;
pub mod receive_task;
pub mod send_queue;
pub mod send_task;
pub mod telemetry;

pub use connection::{connect, spawn, ConnectionHandle, ConnectionId};
pub use engine::{Engine, EngineConfig, Inbound};
pub use error::EngineError;
pub use exchange::{Direction, Exchange, Outcome, TransferEvent};
pub use handler::{EnvelopeHandler, NoopHandler};
pub use listener::{new_peer_table, Listener, PeerTable};
pub use send_task::Payload;
