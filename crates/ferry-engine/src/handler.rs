//! Envelope dispatch — the contract between a connection and the
//! application on top of it.
//!
//! The driver calls these on its own task, one at a time per connection.
//! Implementations must not block; answering is done by queueing sends on
//! the supplied handle, which never waits.

use std::path::PathBuf;

use ferry_core::{Action, Envelope, Key};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::engine::Inbound;

/// Callbacks for unsolicited inbound exchanges. Every method defaults to
/// doing nothing.
pub trait EnvelopeHandler: Send + Sync {
    fn connected(&self, _conn: &ConnectionHandle) {}

    fn disconnected(&self, _id: ConnectionId) {}

    fn list_requested(&self, _conn: &ConnectionHandle, _request: Envelope) {}

    /// `request.content` names the wanted path; answer under
    /// `request.message_key`.
    fn download_requested(&self, _conn: &ConnectionHandle, _request: Envelope) {}

    /// Called after the engine has already stopped the named exchange and
    /// queued the cancel response.
    fn cancel_requested(&self, _conn: &ConnectionHandle, _request: Envelope) {}

    /// A cancel response nobody was waiting for.
    fn cancel_confirmed(&self, _conn: &ConnectionHandle, _response: Envelope) {}

    fn direct_data(&self, _conn: &ConnectionHandle, _envelope: Envelope) {}

    /// An unsolicited file, staged at `path`. The handler owns the file.
    fn file_received(&self, _conn: &ConnectionHandle, _key: Key, _path: PathBuf) {}

    /// A data exchange that did not decode as an envelope, kept at `path`.
    fn unrecognized(&self, _conn: &ConnectionHandle, _key: Key, _path: PathBuf) {}
}

/// Accepts everything, does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EnvelopeHandler for NoopHandler {}

pub(crate) fn dispatch(handler: &dyn EnvelopeHandler, conn: &ConnectionHandle, inbound: Inbound) {
    match inbound {
        Inbound::Envelope(envelope) => match envelope.action {
            Action::ListRequest => handler.list_requested(conn, envelope),
            Action::DownloadRequest => handler.download_requested(conn, envelope),
            Action::CancelRequest => handler.cancel_requested(conn, envelope),
            Action::CancelResponse => handler.cancel_confirmed(conn, envelope),
            Action::DirectData => handler.direct_data(conn, envelope),
            Action::ListResponse | Action::DownloadResponse => {
                tracing::debug!(
                    conn = %conn.id(),
                    key = %envelope.message_key,
                    action = envelope.action.name(),
                    "uncorrelated response dropped"
                );
            }
        },
        Inbound::FileReceived { key, path } => handler.file_received(conn, key, path),
        Inbound::Unrecognized { key, path } => handler.unrecognized(conn, key, path),
    }
}
