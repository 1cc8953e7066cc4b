//! Exchange handles — how callers learn what happened to an exchange.
//!
//! Every reply-correlated exchange gets a one-shot [`Outcome`] and an
//! unbounded stream of [`TransferEvent`]s. Timeout, cancellation and
//! disconnect are outcomes of their own, never an empty `Data`.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use ferry_core::Key;

/// Terminal result of an exchange. Delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A data-kind reply, fully reassembled.
    Data(Bytes),
    /// A file-kind reply, staged at this local path.
    File(PathBuf),
    /// Cancelled locally or by the peer.
    Cancelled,
    /// The receive deadline passed before the reply was complete.
    TimedOut,
    /// The connection went away first.
    Disconnected,
    /// A local resource error ended this exchange (and only this one).
    Failed(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Data(_) | Outcome::File(_))
    }

    pub fn into_data(self) -> Option<Bytes> {
        match self {
            Outcome::Data(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn into_path(self) -> Option<PathBuf> {
        match self {
            Outcome::File(path) => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Non-terminal observations of an exchange in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// Fired for every accepted inbound chunk.
    Progress { received: u64, total: u64 },
    /// Bytes moved during the last sampling interval.
    Rate { direction: Direction, bytes: u64 },
}

/// Caller side of an exchange.
#[derive(Debug)]
pub struct Exchange {
    key: Key,
    outcome: oneshot::Receiver<Outcome>,
    events: mpsc::UnboundedReceiver<TransferEvent>,
}

impl Exchange {
    /// A connected caller/engine pair for `key`.
    pub fn channel(key: Key) -> (Exchange, Notify) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Exchange {
                key,
                outcome: outcome_rx,
                events: events_rx,
            },
            Notify {
                outcome: Some(outcome_tx),
                events: Some(events_tx),
            },
        )
    }

    pub fn key(&self) -> Key {
        self.key
    }

    /// Wait for the terminal outcome. If the engine dropped the exchange
    /// without resolving it, the connection is gone.
    pub async fn outcome(&mut self) -> Outcome {
        (&mut self.outcome).await.unwrap_or(Outcome::Disconnected)
    }

    /// Wait for the terminal outcome, handing every event to `on_event` as
    /// it arrives. Events queued before the outcome are all delivered first.
    pub async fn outcome_with(&mut self, mut on_event: impl FnMut(TransferEvent)) -> Outcome {
        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => on_event(event),
                outcome = &mut self.outcome => {
                    while let Ok(event) = self.events.try_recv() {
                        on_event(event);
                    }
                    return outcome.unwrap_or(Outcome::Disconnected);
                }
            }
        }
    }

    /// Non-blocking check for the terminal outcome.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Outcome::Disconnected),
        }
    }

    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<TransferEvent> {
        &mut self.events
    }
}

/// Engine side of an exchange. Dropped receivers are ignored.
#[derive(Debug, Default)]
pub struct Notify {
    outcome: Option<oneshot::Sender<Outcome>>,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl Notify {
    /// A second sink for the same event stream that can never resolve the
    /// outcome. The send side of a request reports rates through this.
    pub(crate) fn observer(&self) -> Notify {
        Notify {
            outcome: None,
            events: self.events.clone(),
        }
    }

    pub(crate) fn progress(&self, received: u64, total: u64) {
        self.event(TransferEvent::Progress { received, total });
    }

    pub(crate) fn rate(&self, direction: Direction, bytes: u64) {
        self.event(TransferEvent::Rate { direction, bytes });
    }

    fn event(&self, event: TransferEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Deliver the outcome and detach both channels.
    pub(crate) fn resolve(mut self, outcome: Outcome) {
        self.events = None;
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
    }
}
