//! Ferry integration test harness.
//!
//! Every test runs a real listener and real clients over loopback TCP
//! through the public API. Nothing here needs privileges:
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=ferry_engine=debug to see the engine's view of a failure.
//! Each test uses its own scratch directory and removes it when done.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use ferry_core::{Action, Envelope, Key};
use ferry_engine::{
    ConnectionHandle, ConnectionId, EngineConfig, EnvelopeHandler, Listener, NoopHandler, PeerTable,
};

mod cancel;
mod exchange;
mod files;
mod listener;
mod slow;
mod timeout;

// ── Harness ───────────────────────────────────────────────────────────────────

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh, empty directory for one test.
pub fn scratch_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ferry-it-{}-{test}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn engine_config(staging: &Path, timeout: Duration) -> EngineConfig {
    EngineConfig {
        staging_dir: staging.to_path_buf(),
        receive_timeout: timeout,
        sample_interval: Duration::from_millis(100),
    }
}

/// Write `len` bytes of a repeating, position-dependent pattern.
pub fn write_pattern(path: &Path, len: usize) -> Vec<u8> {
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8 ^ (i >> 12) as u8).collect();
    std::fs::write(path, &content).unwrap();
    content
}

pub fn direct(content: &str, key: Key) -> Bytes {
    Bytes::from(Envelope::new(Action::DirectData, Some(content.into()), key).to_bytes().unwrap())
}

/// Test-side server behaviour, recording what it saw.
#[derive(Default)]
pub struct TestServer {
    /// Download requests resolve under this directory.
    pub root: PathBuf,
    /// Ignore direct data instead of answering it.
    pub silent: bool,
    pub connected: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub cancels: Mutex<Vec<Envelope>>,
    pub direct: Mutex<Vec<Envelope>>,
    pub files: Mutex<Vec<(Key, PathBuf)>>,
    pub unrecognized: Mutex<Vec<(Key, PathBuf)>>,
}

impl TestServer {
    pub fn serving(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }
}

impl EnvelopeHandler for TestServer {
    fn connected(&self, _conn: &ConnectionHandle) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnected(&self, _id: ConnectionId) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn download_requested(&self, conn: &ConnectionHandle, request: Envelope) {
        let path = self.root.join(request.content.unwrap_or_default());
        if path.is_file() {
            conn.send_file(path, Some(request.message_key)).unwrap();
        } else {
            conn.send_structured(Bytes::new(), Some(request.message_key)).unwrap();
        }
    }

    fn cancel_requested(&self, _conn: &ConnectionHandle, request: Envelope) {
        self.cancels.lock().unwrap().push(request);
    }

    fn direct_data(&self, conn: &ConnectionHandle, envelope: Envelope) {
        self.direct.lock().unwrap().push(envelope.clone());
        if self.silent {
            return;
        }
        let answer = match envelope.content.as_deref() {
            Some("ping") => "pong".to_string(),
            other => other.unwrap_or_default().to_string(),
        };
        conn.send_structured(direct(&answer, envelope.message_key), Some(envelope.message_key))
            .unwrap();
    }

    fn file_received(&self, _conn: &ConnectionHandle, key: Key, path: PathBuf) {
        self.files.lock().unwrap().push((key, path));
    }

    fn unrecognized(&self, _conn: &ConnectionHandle, key: Key, path: PathBuf) {
        self.unrecognized.lock().unwrap().push((key, path));
    }
}

pub struct Server {
    pub port: u16,
    pub peers: PeerTable,
    pub handler: Arc<TestServer>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Server {
    pub async fn start(handler: TestServer, config: EngineConfig) -> Result<Self> {
        init_logging();
        let handler = Arc::new(handler);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let listener = Listener::bind("127.0.0.1", 0, config, handler.clone(), shutdown_rx).await?;
        let port = listener.local_addr()?.port();
        let peers = listener.peers();
        let task = tokio::spawn(listener.run());
        Ok(Self {
            port,
            peers,
            handler,
            shutdown,
            task,
        })
    }

    pub async fn client(&self, config: EngineConfig) -> Result<ConnectionHandle> {
        let (conn, _task) = ferry_engine::connect("127.0.0.1", self.port, config, Arc::new(NoopHandler)).await?;
        Ok(conn)
    }

    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await.context("listener task panicked")?
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
