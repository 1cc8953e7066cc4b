//! Reassembly of one inbound exchange.
//!
//! Data-kind payloads accumulate in memory; file-kind payloads stream to a
//! staging file named after the key. Chunks must arrive in index order:
//! nothing is reorder-buffered, an inconsistent chunk is refused.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use ferry_core::wire::{PacketHeader, PayloadKind};
use ferry_core::Key;

use crate::exchange::{Direction, Notify, Outcome};
use crate::telemetry::Sampler;

/// Upper bound on the up-front allocation for a data exchange; the buffer
/// still grows past it as chunks arrive.
const MAX_PREALLOC: usize = 1024 * 1024;

/// Framing fixed by the first chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Framing {
    kind: PayloadKind,
    chunk_count: u64,
    total: u64,
}

#[derive(Debug)]
enum Target {
    Memory(BytesMut),
    File { file: File, path: PathBuf },
}

/// Reassembled payload of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Data(Bytes),
    File(PathBuf),
}

#[derive(Debug)]
pub struct Completed {
    pub key: Key,
    pub body: Body,
    /// Present when the exchange was reply-correlated.
    pub notify: Option<Notify>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Refusal {
    #[error("chunk {got} arrived, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("chunk index {index} is outside chunk count {count}")]
    IndexOutOfRange { index: u64, count: u64 },
    #[error("framing changed mid-exchange")]
    FramingChanged,
    #[error("chunk would overrun declared total of {0} bytes")]
    Overrun(u64),
    #[error("empty chunk in a non-empty exchange")]
    EmptyChunk,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    /// The chunk is dropped; the exchange continues.
    #[error(transparent)]
    Refused(#[from] Refusal),
    /// The exchange cannot continue.
    #[error("staging file {0}: {1}")]
    Staging(PathBuf, std::io::Error),
}

#[derive(Debug)]
pub struct ReceiveTask {
    key: Key,
    framing: Option<Framing>,
    last_index: Option<u64>,
    received: u64,
    target: Option<Target>,
    notify: Option<Notify>,
    deadline: Instant,
    sample_interval: Duration,
    /// Started by the first accepted chunk, so a reply's samples leave out
    /// the request round trip.
    sampler: Option<Sampler>,
}

impl ReceiveTask {
    /// `notify` is present for a reply-correlated placeholder registered
    /// before the request goes out, absent for an unsolicited exchange.
    pub fn new(key: Key, notify: Option<Notify>, now: Instant, timeout: Duration, sample_interval: Duration) -> Self {
        Self {
            key,
            framing: None,
            last_index: None,
            received: 0,
            target: None,
            notify,
            deadline: now + timeout,
            sample_interval,
            sampler: None,
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_correlated(&self) -> bool {
        self.notify.is_some()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn rearm(&mut self, now: Instant, timeout: Duration) {
        self.deadline = now + timeout;
    }

    /// Take one chunk. Returns `true` when the exchange is complete.
    pub fn accept(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
        staging_dir: &Path,
        now: Instant,
    ) -> Result<bool, ReceiveError> {
        let framing = Framing {
            kind: header.kind,
            chunk_count: header.chunk_count,
            total: header.total_len,
        };
        self.check(header, framing, payload.len() as u64)?;

        if self.target.is_none() {
            self.target = Some(self.open_target(framing, staging_dir)?);
            self.framing = Some(framing);
        }

        match &mut self.target {
            Some(Target::Memory(buf)) => buf.extend_from_slice(payload),
            Some(Target::File { file, path }) => file
                .write_all(payload)
                .map_err(|e| ReceiveError::Staging(path.clone(), e))?,
            None => {}
        }

        if self.sampler.is_none() {
            self.sampler = Some(Sampler::new(self.sample_interval, now));
        }
        self.received += payload.len() as u64;
        self.last_index = Some(header.chunk_index);
        if let Some(notify) = &self.notify {
            notify.progress(self.received, framing.total);
        }

        // Either condition ends the exchange; the caller removes the task,
        // so completion is reported once even when both hold.
        Ok(self.received == framing.total || header.is_last_chunk())
    }

    fn check(&self, header: &PacketHeader, framing: Framing, len: u64) -> Result<(), Refusal> {
        let expected = self.last_index.map_or(0, |i| i + 1);
        if header.chunk_index != expected {
            return Err(Refusal::OutOfOrder {
                expected,
                got: header.chunk_index,
            });
        }
        if header.chunk_index >= header.chunk_count {
            return Err(Refusal::IndexOutOfRange {
                index: header.chunk_index,
                count: header.chunk_count,
            });
        }
        if self.framing.is_some_and(|f| f != framing) {
            return Err(Refusal::FramingChanged);
        }
        if self.received + len > framing.total {
            return Err(Refusal::Overrun(framing.total));
        }
        if len == 0 && framing.total != 0 {
            return Err(Refusal::EmptyChunk);
        }
        Ok(())
    }

    fn open_target(&self, framing: Framing, staging_dir: &Path) -> Result<Target, ReceiveError> {
        match framing.kind {
            PayloadKind::Data => Ok(Target::Memory(BytesMut::with_capacity(
                (framing.total as usize).min(MAX_PREALLOC),
            ))),
            PayloadKind::File => {
                let path = staging_path(staging_dir, self.key, "tmp");
                let file = create_staging(&path)?;
                tracing::debug!(key = %self.key, path = %path.display(), "staging inbound file");
                Ok(Target::File { file, path })
            }
        }
    }

    pub fn sample(&mut self, now: Instant) {
        let received = self.received;
        if let Some(bytes) = self.sampler.as_mut().and_then(|s| s.poll(received, now)) {
            self.report_rate(bytes);
        }
    }

    /// Close out a complete exchange. A correlated waiter is resolved as
    /// failed if the staging file cannot be flushed.
    pub fn complete(mut self) -> Result<Completed, ReceiveError> {
        self.final_sample();
        let body = match self.target.take() {
            Some(Target::Memory(buf)) => Body::Data(buf.freeze()),
            Some(Target::File { mut file, path }) => {
                if let Err(e) = file.flush() {
                    drop(file);
                    let _ = std::fs::remove_file(&path);
                    if let Some(notify) = self.notify.take() {
                        notify.resolve(Outcome::Failed(e.to_string()));
                    }
                    return Err(ReceiveError::Staging(path, e));
                }
                Body::File(path)
            }
            // Unreachable in practice: completion requires an accepted chunk.
            None => Body::Data(Bytes::new()),
        };
        Ok(Completed {
            key: self.key,
            body,
            notify: self.notify.take(),
        })
    }

    /// End the exchange without a payload. Any partial staging file is removed.
    pub fn abort(mut self, outcome: Outcome) {
        self.final_sample();
        if let Some(Target::File { file, path }) = self.target.take() {
            drop(file);
            let _ = std::fs::remove_file(&path);
        }
        if let Some(notify) = self.notify.take() {
            notify.resolve(outcome);
        }
    }

    fn final_sample(&mut self) {
        let received = self.received;
        if let Some(bytes) = self.sampler.as_mut().and_then(|s| s.finish(received)) {
            self.report_rate(bytes);
        }
    }

    fn report_rate(&self, bytes: u64) {
        tracing::debug!(key = %self.key, bytes, direction = "inbound", "throughput sample");
        if let Some(notify) = &self.notify {
            notify.rate(Direction::Inbound, bytes);
        }
    }
}

/// `<dir>/<key>.<ext>`
pub fn staging_path(dir: &Path, key: Key, ext: &str) -> PathBuf {
    dir.join(format!("{key}.{ext}"))
}

/// Create (or replace) a staging file.
pub fn create_staging(path: &Path) -> Result<File, ReceiveError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ReceiveError::Staging(path.to_path_buf(), e))?;
    }
    File::create(path).map_err(|e| ReceiveError::Staging(path.to_path_buf(), e))
}
