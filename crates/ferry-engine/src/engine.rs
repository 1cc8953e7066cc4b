//! The per-connection protocol engine.
//!
//! `Engine` owns everything one connection needs: the send serializer, the
//! receive multiplexer and its reassembly tasks, and the cancellation
//! tombstones. It performs no I/O of its own. The driver feeds it arrived
//! bytes, write completions and clock ticks, and drains outbound packets
//! from `poll_transmit`. Every entry point takes `now` so tests can drive
//! time explicitly.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;

use ferry_core::config::TransferConfig;
use ferry_core::{Action, Envelope, Key};

use crate::error::EngineError;
use crate::exchange::{Notify, Outcome};
use crate::multiplexer::Multiplexer;
use crate::receive_task::{self, Body, Completed};
use crate::send_queue::SendQueue;
use crate::send_task::{Payload, Submission};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub staging_dir: PathBuf,
    pub receive_timeout: Duration,
    pub sample_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for EngineConfig {
    fn from(transfer: &TransferConfig) -> Self {
        Self {
            staging_dir: transfer.staging_dir.clone(),
            receive_timeout: transfer.receive_timeout(),
            sample_interval: transfer.sample_interval(),
        }
    }
}

/// Something the engine could not settle on its own and hands upward.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// An unsolicited structured exchange, decoded.
    Envelope(Envelope),
    /// An unsolicited file-kind exchange, staged at `path`.
    FileReceived { key: Key, path: PathBuf },
    /// An unsolicited data exchange that is not an envelope, persisted at
    /// `path` for later recovery.
    Unrecognized { key: Key, path: PathBuf },
}

#[derive(Debug)]
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) sends: SendQueue,
    pub(crate) receives: Multiplexer,
    closed: bool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let sends = SendQueue::new(config.sample_interval);
        let receives = Multiplexer::new(
            config.staging_dir.clone(),
            config.receive_timeout,
            config.sample_interval,
        );
        Self {
            config,
            sends,
            receives,
            closed: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Nothing queued, nothing being written.
    pub fn is_idle(&self) -> bool {
        self.sends.is_idle()
    }

    /// Inbound exchanges currently being reassembled or awaited.
    pub fn receives_in_flight(&self) -> usize {
        self.receives.in_flight()
    }

    // ── Submission ───────────────────────────────────────────────────────────

    /// Queue an outbound exchange under `key`.
    ///
    /// With `reply`, a placeholder is registered under the same key before
    /// anything is written, so the peer's answer resolves `reply` instead of
    /// going through envelope dispatch. The placeholder's deadline starts now.
    pub fn submit(&mut self, key: Key, payload: Payload, reply: Option<Notify>, now: Instant) {
        if self.closed {
            if let Some(reply) = reply {
                reply.resolve(Outcome::Disconnected);
            }
            return;
        }
        let events = reply.as_ref().map(Notify::observer);
        if let Some(reply) = reply {
            self.receives.register(key, reply, now);
        }
        self.sends.submit(Submission { key, payload, events });
    }

    /// Serialize and queue an envelope under its own message key.
    pub fn send_envelope(
        &mut self,
        envelope: &Envelope,
        reply: Option<Notify>,
        now: Instant,
    ) -> Result<(), EngineError> {
        let body = envelope.to_bytes()?;
        self.submit(envelope.message_key, Payload::Data(Bytes::from(body)), reply, now);
        Ok(())
    }

    /// Push `key`'s receive deadline to a full timeout from now.
    pub fn rearm(&mut self, key: Key, now: Instant) -> bool {
        let found = self.receives.rearm(key, now);
        if !found {
            tracing::debug!(%key, "rearm for unknown exchange ignored");
        }
        found
    }

    // ── Transport events ─────────────────────────────────────────────────────

    /// The next packet to write, if one may be written now.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Bytes> {
        if self.closed {
            return None;
        }
        let packet = self.sends.poll_transmit(now);
        for (key, reason) in self.sends.take_failures() {
            self.receives.fail(key, reason);
        }
        packet
    }

    pub fn on_write_complete(&mut self, _now: Instant) {
        self.sends.on_write_complete();
    }

    /// Bytes arrived from the peer.
    pub fn on_bytes(&mut self, data: &[u8], now: Instant) -> Vec<Inbound> {
        if self.closed {
            return Vec::new();
        }
        let completed = self.receives.feed(data, now);
        completed
            .into_iter()
            .filter_map(|done| self.settle(done, now))
            .collect()
    }

    /// Periodic housekeeping: deadlines and throughput samples.
    /// Returns the keys that timed out.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Key> {
        if self.closed {
            return Vec::new();
        }
        let expired = self.receives.expire(now);
        self.receives.sample(now);
        self.sends.sample(now);
        expired
    }

    /// The transport is gone. Every waiter is released with
    /// `Outcome::Disconnected` and the engine accepts no further work.
    pub fn on_disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sends.clear();
        self.receives.clear();
    }

    // ── Completion ───────────────────────────────────────────────────────────

    fn settle(&mut self, done: Completed, now: Instant) -> Option<Inbound> {
        let Completed { key, body, notify } = done;

        if let Some(notify) = notify {
            let outcome = match body {
                Body::Data(bytes) => Outcome::Data(bytes),
                Body::File(path) => Outcome::File(path),
            };
            notify.resolve(outcome);
            return None;
        }

        match body {
            Body::File(path) => Some(Inbound::FileReceived { key, path }),
            Body::Data(bytes) => match Envelope::from_bytes(&bytes, key) {
                Ok(envelope) => {
                    tracing::debug!(%key, action = envelope.action.name(), "envelope received");
                    if envelope.action == Action::CancelRequest {
                        self.handle_cancel_request(&envelope, now);
                    }
                    Some(Inbound::Envelope(envelope))
                }
                Err(e) => {
                    tracing::debug!(%key, error = %e, "payload is not an envelope");
                    self.persist_unrecognized(key, &bytes)
                }
            },
        }
    }

    fn persist_unrecognized(&self, key: Key, bytes: &[u8]) -> Option<Inbound> {
        let path = receive_task::staging_path(&self.config.staging_dir, key, "data");
        let written = receive_task::create_staging(&path).and_then(|mut file| {
            file.write_all(bytes)
                .map_err(|e| receive_task::ReceiveError::Staging(path.clone(), e))
        });
        match written {
            Ok(()) => {
                tracing::info!(%key, bytes = bytes.len(), path = %path.display(), "unrecognized payload persisted");
                Some(Inbound::Unrecognized { key, path })
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "failed to persist unrecognized payload");
                None
            }
        }
    }
}
