//! Server-side handler: shares a directory, echoes direct messages, and
//! files away uploads.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use ferry_core::{Action, DirectMessage, Envelope, Key};
use ferry_engine::{ConnectionHandle, ConnectionId, EnvelopeHandler};

/// Error code for a list request the root cannot satisfy.
const LIST_FAILED: &str = "list_failed";
/// Error code for a requested folder outside the root or not a folder.
const BAD_PATH: &str = "bad_path";

/// One entry of a folder listing, as it goes over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub file_name: String,
    /// Relative to the serve root, `/`-separated.
    pub file_path: String,
    /// Zero for folders.
    pub file_size: u64,
    pub is_folder: bool,
    pub path_extension: String,
}

#[derive(Debug)]
pub enum ListError {
    BadPath,
    Io(std::io::Error),
}

impl ListError {
    fn code(&self) -> &'static str {
        match self {
            ListError::BadPath => BAD_PATH,
            ListError::Io(_) => LIST_FAILED,
        }
    }
}

impl From<std::io::Error> for ListError {
    fn from(e: std::io::Error) -> Self {
        ListError::Io(e)
    }
}

pub struct ServeHandler {
    root: PathBuf,
}

impl ServeHandler {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn incoming_dir(&self) -> PathBuf {
        self.root.join("incoming")
    }
}

impl EnvelopeHandler for ServeHandler {
    fn connected(&self, conn: &ConnectionHandle) {
        tracing::info!(conn = %conn.id(), "peer connected");
    }

    fn disconnected(&self, id: ConnectionId) {
        tracing::info!(conn = %id, "peer disconnected");
    }

    fn list_requested(&self, conn: &ConnectionHandle, request: Envelope) {
        let key = request.message_key;
        let folder = request.content.unwrap_or_default();
        let reply = match list_folder(&self.root, &folder) {
            Ok(entries) => match serde_json::to_string(&entries) {
                Ok(json) => Envelope::new(Action::ListResponse, Some(json), key),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "failed to encode listing");
                    Envelope::new(Action::ListResponse, None, key).with_error(LIST_FAILED)
                }
            },
            Err(e) => {
                tracing::warn!(%key, folder = %folder, error = ?e, "failed to list folder");
                Envelope::new(Action::ListResponse, None, key).with_error(e.code())
            }
        };
        if let Err(e) = conn.send_envelope(&reply) {
            tracing::warn!(%key, error = %e, "failed to answer list request");
        }
    }

    fn download_requested(&self, conn: &ConnectionHandle, request: Envelope) {
        let key = request.message_key;
        let wanted = request.content.unwrap_or_default();
        let result = match resolve(&self.root, &wanted).filter(|p| p.is_file()) {
            Some(path) => {
                tracing::info!(conn = %conn.id(), %key, path = %path.display(), "serving download");
                conn.send_file(path, Some(key))
            }
            None => {
                // An empty reply releases the requester instead of leaving it
                // to time out.
                tracing::info!(conn = %conn.id(), %key, wanted = %wanted, "download not found");
                conn.send_structured(Bytes::new(), Some(key))
            }
        };
        if let Err(e) = result {
            tracing::warn!(%key, error = %e, "failed to answer download request");
        }
    }

    fn cancel_requested(&self, conn: &ConnectionHandle, request: Envelope) {
        tracing::info!(conn = %conn.id(), target = ?request.content, "peer cancelled an exchange");
    }

    fn direct_data(&self, conn: &ConnectionHandle, envelope: Envelope) {
        let key = envelope.message_key;
        match envelope.content.as_deref().map(DirectMessage::from_json) {
            Some(Ok(message)) => tracing::info!(
                conn = %conn.id(),
                %key,
                kind = ?message.kind,
                content = ?message.content,
                "direct message"
            ),
            _ => tracing::info!(conn = %conn.id(), %key, content = ?envelope.content, "direct data"),
        }
        let echo = Envelope::new(Action::DirectData, envelope.content, key);
        if let Err(e) = conn.send_envelope(&echo) {
            tracing::warn!(%key, error = %e, "failed to echo direct data");
        }
    }

    fn file_received(&self, conn: &ConnectionHandle, key: Key, path: PathBuf) {
        let dest = self.incoming_dir().join(key.as_str());
        match move_file(&path, &dest) {
            Ok(()) => tracing::info!(conn = %conn.id(), %key, dest = %dest.display(), "upload stored"),
            Err(e) => tracing::warn!(%key, staged = %path.display(), error = %e, "failed to store upload"),
        }
    }

    fn unrecognized(&self, conn: &ConnectionHandle, key: Key, path: PathBuf) {
        tracing::warn!(conn = %conn.id(), %key, path = %path.display(), "unrecognized payload kept for inspection");
    }
}

/// Map a requested path onto the serve root. Anything that could escape the
/// root is refused.
pub fn resolve(root: &Path, requested: &str) -> Option<PathBuf> {
    let requested = Path::new(requested);
    let mut parts = requested.components().peekable();
    parts.peek()?;
    if parts.all(|c| matches!(c, Component::Normal(_))) {
        Some(root.join(requested))
    } else {
        None
    }
}

/// List `folder` under the serve root; empty means the root itself.
/// Folders come first by name, then files largest first.
pub fn list_folder(root: &Path, folder: &str) -> Result<Vec<FileEntry>, ListError> {
    let (dir, prefix) = if folder.is_empty() {
        (root.to_path_buf(), String::new())
    } else {
        let dir = resolve(root, folder).ok_or(ListError::BadPath)?;
        let prefix = folder.trim_end_matches('/').to_string() + "/";
        (dir, prefix)
    };
    if !dir.is_dir() {
        return Err(ListError::BadPath);
    }

    let mut folders = Vec::new();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = Path::new(&name);
        let is_folder = file_type.is_dir();
        if !is_folder && !file_type.is_file() {
            continue;
        }
        let item = FileEntry {
            file_path: format!("{prefix}{name}"),
            file_size: if is_folder { 0 } else { entry.metadata()?.len() },
            is_folder,
            path_extension: path
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_name: name,
        };
        if is_folder {
            folders.push(item);
        } else {
            files.push(item);
        }
    }
    folders.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    files.sort_by(|a, b| b.file_size.cmp(&a.file_size).then_with(|| a.file_name.cmp(&b.file_name)));
    folders.append(&mut files);
    Ok(folders)
}

/// Rename, falling back to copy + remove across filesystems.
pub fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}
