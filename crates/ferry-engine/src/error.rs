//! Engine errors. Everything here is local to one exchange except
//! `ConnectionClosed`.

use std::path::PathBuf;

use ferry_core::envelope::EnvelopeError;
use ferry_core::key::KeyError;
use ferry_core::WireError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("connection is closed")]
    ConnectionClosed,

    #[error("failed to open {0}: {1}")]
    Open(PathBuf, std::io::Error),

    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("payload of {0} bytes does not fit the wire format")]
    PayloadTooLarge(u64),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Key(#[from] KeyError),
}
