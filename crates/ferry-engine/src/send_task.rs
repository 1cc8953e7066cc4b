//! Outbound chunker — splits one exchange's payload into header-prefixed
//! packets, one packet per call.
//!
//! File sources are read span by span straight from the handle; the file is
//! never held in memory as a whole.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;

use ferry_core::wire::{self, PacketHeader, PayloadKind, MAX_CHUNK_PAYLOAD};
use ferry_core::Key;

use crate::error::EngineError;
use crate::exchange::{Direction, Notify};
use crate::telemetry::Sampler;

/// What to send.
#[derive(Debug, Clone)]
pub enum Payload {
    Data(Bytes),
    File(PathBuf),
}

/// A queued send that has not started yet.
#[derive(Debug)]
pub struct Submission {
    pub key: Key,
    pub payload: Payload,
    /// Observes the outbound side (rate samples only).
    pub events: Option<Notify>,
}

#[derive(Debug)]
enum Source {
    Memory(Bytes),
    File { file: File, path: PathBuf },
}

/// The single active outbound exchange on a connection.
#[derive(Debug)]
pub struct SendTask {
    key: Key,
    kind: PayloadKind,
    source: Source,
    total: u64,
    chunk_count: u64,
    next_index: u64,
    offset: u64,
    done: bool,
    sampler: Sampler,
    events: Option<Notify>,
}

impl SendTask {
    /// Open the source and size the exchange.
    pub fn start(
        submission: Submission,
        sample_interval: Duration,
        now: Instant,
    ) -> Result<Self, EngineError> {
        let Submission {
            key,
            payload,
            events,
        } = submission;

        let (kind, source, total) = match payload {
            Payload::Data(bytes) => {
                let total = bytes.len() as u64;
                (PayloadKind::Data, Source::Memory(bytes), total)
            }
            Payload::File(path) => {
                let (file, total) = open_for_send(&path)?;
                (PayloadKind::File, Source::File { file, path }, total)
            }
        };

        let chunk_count = wire::chunk_count_for(total);
        check_fits(total, chunk_count)?;

        Ok(Self {
            key,
            kind,
            source,
            total,
            chunk_count,
            next_index: 0,
            offset: 0,
            done: false,
            sampler: Sampler::new(sample_interval, now),
            events,
        })
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// True once the final chunk has been produced.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Produce the next packet. Returns `Ok(None)` once every chunk has
    /// been produced.
    pub fn next_packet(&mut self) -> Result<Option<Bytes>, EngineError> {
        if self.done {
            return Ok(None);
        }

        let span = (self.total - self.offset).min(MAX_CHUNK_PAYLOAD as u64) as usize;
        let chunk = match &mut self.source {
            Source::Memory(bytes) => {
                let start = self.offset as usize;
                bytes.slice(start..start + span)
            }
            Source::File { file, path } => read_span(file, path, self.offset, span)?,
        };

        let header = PacketHeader::for_chunk(
            self.key,
            self.kind,
            self.chunk_count,
            self.next_index,
            chunk.len(),
            self.total,
        );
        let packet = wire::encode_packet(&header, &chunk)?;

        self.offset += chunk.len() as u64;
        self.next_index += 1;
        self.done = self.next_index == self.chunk_count;
        Ok(Some(packet))
    }

    pub fn sample(&mut self, now: Instant) {
        if let Some(bytes) = self.sampler.poll(self.offset, now) {
            self.report_rate(bytes);
        }
    }

    /// Final telemetry sample. Called on completion and on discard.
    pub fn finish(&mut self) {
        if let Some(bytes) = self.sampler.finish(self.offset) {
            self.report_rate(bytes);
        }
    }

    fn report_rate(&self, bytes: u64) {
        tracing::debug!(key = %self.key, bytes, direction = "outbound", "throughput sample");
        if let Some(events) = &self.events {
            events.rate(Direction::Outbound, bytes);
        }
    }
}

fn open_for_send(path: &Path) -> Result<(File, u64), EngineError> {
    let file = File::open(path).map_err(|e| EngineError::Open(path.to_path_buf(), e))?;
    let total = file
        .metadata()
        .map_err(|e| EngineError::Open(path.to_path_buf(), e))?
        .len();
    Ok((file, total))
}

/// Read up to `span` bytes at `offset`. The handle is repositioned to the
/// bytes consumed so far before every read.
fn read_span(file: &mut File, path: &Path, offset: u64, span: usize) -> Result<Bytes, EngineError> {
    let read_err = |e| EngineError::Read(path.to_path_buf(), e);
    file.seek(SeekFrom::Start(offset)).map_err(read_err)?;

    let mut chunk = vec![0u8; span];
    file.read_exact(&mut chunk).map_err(read_err)?;
    Ok(Bytes::from(chunk))
}

fn check_fits(total: u64, chunk_count: u64) -> Result<(), EngineError> {
    let widest = PacketHeader::for_chunk(Key::generate(), PayloadKind::Data, chunk_count, 0, 0, total);
    let mut scratch = bytes::BytesMut::new();
    widest
        .encode(&mut scratch)
        .map_err(|_| EngineError::PayloadTooLarge(total))
}
