//! Receive multiplexer — frames the inbound byte stream into packets and
//! routes each packet to its exchange by key.
//!
//! One read event may carry a partial packet, several packets, or the tail
//! of one and the whole of the next. Every complete packet buffered is
//! processed before control returns to the transport.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use ferry_core::wire::{self, PacketHeader, HEADER_LEN};
use ferry_core::Key;

use crate::exchange::{Notify, Outcome};
use crate::receive_task::{Completed, ReceiveError, ReceiveTask};

#[derive(Debug)]
pub struct Multiplexer {
    buffer: BytesMut,
    tasks: HashMap<Key, ReceiveTask>,
    /// Recently cancelled keys; late chunks for them are dropped until the
    /// recorded instant.
    tombstones: HashMap<Key, Instant>,
    staging_dir: PathBuf,
    timeout: Duration,
    sample_interval: Duration,
}

impl Multiplexer {
    pub fn new(staging_dir: PathBuf, timeout: Duration, sample_interval: Duration) -> Self {
        Self {
            buffer: BytesMut::new(),
            tasks: HashMap::new(),
            tombstones: HashMap::new(),
            staging_dir,
            timeout,
            sample_interval,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.tasks.contains_key(&key)
    }

    /// Pre-register a reply-correlated exchange. Its deadline starts now.
    pub fn register(&mut self, key: Key, notify: Notify, now: Instant) {
        let task = ReceiveTask::new(key, Some(notify), now, self.timeout, self.sample_interval);
        if let Some(previous) = self.tasks.insert(key, task) {
            tracing::warn!(%key, "replacing in-flight receive with a new registration");
            previous.abort(Outcome::Cancelled);
        }
        self.tombstones.remove(&key);
    }

    /// Push `key`'s deadline a full timeout past `now`.
    pub fn rearm(&mut self, key: Key, now: Instant) -> bool {
        match self.tasks.get_mut(&key) {
            Some(task) => {
                task.rearm(now, self.timeout);
                true
            }
            None => false,
        }
    }

    /// Append inbound bytes and return every exchange they completed, in
    /// arrival order.
    pub fn feed(&mut self, data: &[u8], now: Instant) -> Vec<Completed> {
        self.buffer.extend_from_slice(data);

        let mut completed = Vec::new();
        loop {
            let len = match wire::peek_packet_len(&self.buffer) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        discarded = self.buffer.len(),
                        "stream desynchronized, discarding receive buffer"
                    );
                    self.buffer.clear();
                    break;
                }
            };
            if self.buffer.len() < len {
                break;
            }
            let packet = self.buffer.split_to(len).freeze();
            if let Some(done) = self.route(packet, now) {
                completed.push(done);
            }
        }
        completed
    }

    fn route(&mut self, packet: Bytes, now: Instant) -> Option<Completed> {
        let header = match PacketHeader::decode(&packet) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable packet");
                return None;
            }
        };
        let key = header.key;

        if self.tombstones.get(&key).is_some_and(|until| now < *until) {
            tracing::debug!(%key, index = header.chunk_index, "dropping chunk for cancelled exchange");
            return None;
        }

        if !self.tasks.contains_key(&key) {
            if header.chunk_index != 0 {
                tracing::warn!(%key, index = header.chunk_index, "chunk for unknown exchange, dropping");
                return None;
            }
            tracing::debug!(%key, kind = ?header.kind, bytes = header.total_len, "inbound exchange started");
            let task = ReceiveTask::new(key, None, now, self.timeout, self.sample_interval);
            self.tasks.insert(key, task);
        }
        let task = self.tasks.get_mut(&key)?;

        let payload = &packet[HEADER_LEN..];
        match task.accept(&header, payload, &self.staging_dir, now) {
            Ok(false) => {
                tracing::trace!(%key, index = header.chunk_index, received = task.received(), "chunk accepted");
                None
            }
            Ok(true) => {
                let task = self.tasks.remove(&key)?;
                match task.complete() {
                    Ok(done) => {
                        tracing::info!(%key, chunks = header.chunk_count, bytes = header.total_len, "inbound exchange complete");
                        Some(done)
                    }
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "inbound exchange failed at completion");
                        None
                    }
                }
            }
            Err(ReceiveError::Refused(refusal)) => {
                tracing::warn!(%key, index = header.chunk_index, reason = %refusal, "chunk refused");
                None
            }
            Err(e @ ReceiveError::Staging(..)) => {
                tracing::warn!(%key, error = %e, "inbound exchange failed");
                if let Some(task) = self.tasks.remove(&key) {
                    task.abort(Outcome::Failed(e.to_string()));
                }
                None
            }
        }
    }

    /// Release `key` without a payload and ignore its stragglers for one
    /// timeout window.
    pub fn cancel(&mut self, key: Key, now: Instant) -> bool {
        self.tombstones.insert(key, now + self.timeout);
        match self.tasks.remove(&key) {
            Some(task) => {
                tracing::info!(%key, received = task.received(), "inbound exchange cancelled");
                task.abort(Outcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// The request awaiting this reply could not be sent: resolve its
    /// waiter as failed now rather than at the deadline.
    pub fn fail(&mut self, key: Key, reason: String) -> bool {
        if !self.tasks.get(&key).is_some_and(ReceiveTask::is_correlated) {
            return false;
        }
        match self.tasks.remove(&key) {
            Some(task) => {
                tracing::info!(%key, reason = %reason, "awaited reply abandoned, request not sent");
                task.abort(Outcome::Failed(reason));
                true
            }
            None => false,
        }
    }

    /// Time out every exchange past its deadline. Returns the expired keys.
    pub fn expire(&mut self, now: Instant) -> Vec<Key> {
        self.tombstones.retain(|_, until| now < *until);

        let expired: Vec<Key> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.is_expired(now))
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            if let Some(task) = self.tasks.remove(key) {
                tracing::warn!(
                    %key,
                    received = task.received(),
                    correlated = task.is_correlated(),
                    "inbound exchange timed out"
                );
                task.abort(Outcome::TimedOut);
            }
        }
        expired
    }

    pub fn sample(&mut self, now: Instant) {
        for task in self.tasks.values_mut() {
            task.sample(now);
        }
    }

    /// Connection teardown: release every waiter and drop buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.tombstones.clear();
        for (_, task) in self.tasks.drain() {
            task.abort(Outcome::Disconnected);
        }
    }
}
