//! Send serializer — a per-connection FIFO with exactly one execution slot.
//!
//! One exchange drains completely before the next starts, and within the
//! active exchange the next packet is not produced until the transport has
//! reported the previous write complete.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use ferry_core::Key;

use crate::send_task::{SendTask, Submission};

#[derive(Debug)]
pub struct SendQueue {
    pending: VecDeque<Submission>,
    active: Option<SendTask>,
    write_in_flight: bool,
    sample_interval: Duration,
    /// Exchanges that could not be sent, with the reason, until collected.
    failed: Vec<(Key, String)>,
}

impl SendQueue {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            active: None,
            write_in_flight: false,
            sample_interval,
            failed: Vec::new(),
        }
    }

    pub fn submit(&mut self, submission: Submission) {
        tracing::debug!(key = %submission.key, queued = self.pending.len(), "send queued");
        self.pending.push_back(submission);
    }

    pub fn active_key(&self) -> Option<Key> {
        self.active.as_ref().map(SendTask::key)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty() && !self.write_in_flight
    }

    pub fn write_in_flight(&self) -> bool {
        self.write_in_flight
    }

    /// Next packet to hand to the transport, if the slot allows one.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Bytes> {
        if self.write_in_flight {
            return None;
        }
        loop {
            if self.active.is_none() {
                let submission = self.pending.pop_front()?;
                self.activate(submission, now);
                continue;
            }
            let task = self.active.as_mut()?;
            match task.next_packet() {
                Ok(Some(packet)) => {
                    self.write_in_flight = true;
                    return Some(packet);
                }
                Ok(None) => self.finish_active(),
                Err(e) => {
                    tracing::warn!(key = %task.key(), error = %e, "send failed, abandoning exchange");
                    task.finish();
                    self.failed.push((task.key(), e.to_string()));
                    self.active = None;
                }
            }
        }
    }

    /// The transport finished the outstanding write.
    pub fn on_write_complete(&mut self) {
        self.write_in_flight = false;
        if self.active.as_ref().is_some_and(SendTask::is_done) {
            self.finish_active();
        }
    }

    /// Drop the active exchange if it is `key`. No further packets are
    /// produced for it; a write already handed to the transport still
    /// completes normally.
    pub fn discard_active(&mut self, key: Key) -> bool {
        match self.active.take() {
            Some(mut task) if task.key() == key => {
                task.finish();
                tracing::info!(%key, "active send discarded");
                true
            }
            other => {
                self.active = other;
                false
            }
        }
    }

    /// Remove queued, not-yet-started submissions for `key`.
    pub fn remove_pending(&mut self, key: Key) -> usize {
        let before = self.pending.len();
        self.pending.retain(|s| s.key != key);
        before - self.pending.len()
    }

    /// Sends abandoned since the last call.
    pub fn take_failures(&mut self) -> Vec<(Key, String)> {
        std::mem::take(&mut self.failed)
    }

    pub fn sample(&mut self, now: Instant) {
        if let Some(task) = &mut self.active {
            task.sample(now);
        }
    }

    /// Drop everything; used when the connection goes away.
    pub fn clear(&mut self) {
        if let Some(mut task) = self.active.take() {
            task.finish();
        }
        self.pending.clear();
        self.failed.clear();
        self.write_in_flight = false;
    }

    fn activate(&mut self, submission: Submission, now: Instant) {
        let key = submission.key;
        match SendTask::start(submission, self.sample_interval, now) {
            Ok(task) => {
                tracing::info!(
                    %key,
                    kind = ?task.kind(),
                    bytes = task.total(),
                    chunks = task.chunk_count(),
                    "send started"
                );
                self.active = Some(task);
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "send could not start");
                self.failed.push((key, e.to_string()));
            }
        }
    }

    fn finish_active(&mut self) {
        if let Some(mut task) = self.active.take() {
            task.finish();
            tracing::info!(key = %task.key(), bytes = task.total(), "send finished");
        }
    }
}
