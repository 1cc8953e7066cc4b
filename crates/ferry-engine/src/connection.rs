//! Connection driver — runs one [`Engine`] over one byte stream.
//!
//! Each connection is a single tokio task that owns its engine outright, so
//! reads, write completions, timers and caller commands are all serialized
//! onto that task. Callers hold a cloneable [`ConnectionHandle`] and talk to
//! the task over a channel. A second task performs the actual writes and
//! reports each completion back; the engine produces the next packet only
//! after that report.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use ferry_core::{Action, Envelope, Key};

use crate::engine::{Engine, EngineConfig};
use crate::error::EngineError;
use crate::exchange::{Exchange, Notify, Outcome, TransferEvent};
use crate::handler::{dispatch, EnvelopeHandler};
use crate::send_task::Payload;

/// Read buffer size; a little over one maximum packet.
const READ_BUF: usize = 16 * 1024;

/// Housekeeping period. Deadlines and samples are checked at this cadence,
/// so a timeout fires at most this late.
const TICK: Duration = Duration::from_millis(250);

/// Engine time, taken from tokio's clock so paused-time tests drive it.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Engine-assigned identity of a connection. Never derived from the
/// transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        key: Key,
        payload: Payload,
        reply: Option<Notify>,
    },
    Cancel {
        key: Key,
        request_key: Key,
        confirm: Notify,
    },
    Rearm(Key),
    Close,
}

/// Cloneable caller side of a connection. Every method queues a command and
/// returns immediately, so it is safe to call from inside a handler.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// True once the connection task has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Send a data exchange without waiting for a reply. A reply under the
    /// same key, if any, goes through envelope dispatch.
    pub fn send_structured(&self, payload: impl Into<Bytes>, key: Option<Key>) -> Result<Key, EngineError> {
        let key = key.unwrap_or_else(Key::generate);
        self.command(Command::Submit {
            key,
            payload: Payload::Data(payload.into()),
            reply: None,
        })?;
        Ok(key)
    }

    /// Send a data exchange and wait for the peer's reply under the same key.
    pub fn request(&self, payload: impl Into<Bytes>, key: Option<Key>) -> Result<Exchange, EngineError> {
        let key = key.unwrap_or_else(Key::generate);
        let (exchange, reply) = Exchange::channel(key);
        self.command(Command::Submit {
            key,
            payload: Payload::Data(payload.into()),
            reply: Some(reply),
        })?;
        Ok(exchange)
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), EngineError> {
        self.send_structured(envelope.to_bytes()?, Some(envelope.message_key))?;
        Ok(())
    }

    /// Send an envelope under a fresh key and wait for the answer.
    pub fn request_envelope(&self, action: Action, content: Option<String>) -> Result<Exchange, EngineError> {
        let envelope = Envelope::new(action, content, Key::generate());
        self.request(envelope.to_bytes()?, Some(envelope.message_key))
    }

    /// Stream a file. The file is read chunk by chunk while sending.
    pub fn send_file(&self, path: impl Into<PathBuf>, key: Option<Key>) -> Result<Key, EngineError> {
        let key = key.unwrap_or_else(Key::generate);
        self.command(Command::Submit {
            key,
            payload: Payload::File(path.into()),
            reply: None,
        })?;
        Ok(key)
    }

    /// Cancel `key` locally and on the peer. The returned exchange carries
    /// the cancel request's own key and resolves with the peer's
    /// cancel-response envelope.
    pub fn cancel(&self, key: Key) -> Result<Exchange, EngineError> {
        let request_key = Key::generate();
        let (exchange, confirm) = Exchange::channel(request_key);
        self.command(Command::Cancel {
            key,
            request_key,
            confirm,
        })?;
        Ok(exchange)
    }

    /// Wait for `exchange` to finish, handing every event to `on_event` and
    /// rearming its deadline on each chunk. A transfer that keeps making
    /// progress never times out; a stalled one still does.
    pub async fn follow(&self, exchange: &mut Exchange, mut on_event: impl FnMut(TransferEvent)) -> Outcome {
        let key = exchange.key();
        exchange
            .outcome_with(|event| {
                if matches!(event, TransferEvent::Progress { .. }) {
                    let _ = self.rearm(key);
                }
                on_event(event);
            })
            .await
    }

    /// Restart the receive deadline of an awaited exchange.
    pub fn rearm(&self, key: Key) -> Result<(), EngineError> {
        self.command(Command::Rearm(key))
    }

    /// Close the connection once everything already queued has been
    /// written. Exchanges still awaiting a reply resolve as disconnected.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    fn command(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::ConnectionClosed)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::next(),
                commands,
            },
            rx,
        )
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Start driving `stream`. The returned task ends when either side closes.
pub fn spawn<S>(
    stream: S,
    config: EngineConfig,
    handler: Arc<dyn EnvelopeHandler>,
) -> (ConnectionHandle, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (commands, command_rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle {
        id: ConnectionId::next(),
        commands,
    };
    handler.connected(&handle);
    // The task holds only a weak sender: once every handle is gone the
    // command channel closes and the connection shuts itself down.
    let weak = handle.commands.downgrade();
    let task = tokio::spawn(run(stream, Engine::new(config), handler, handle.id, weak, command_rx));
    (handle, task)
}

/// Dial a peer over TCP.
pub async fn connect(
    host: &str,
    port: u16,
    config: EngineConfig,
    handler: Arc<dyn EnvelopeHandler>,
) -> Result<(ConnectionHandle, JoinHandle<()>)> {
    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
    tracing::debug!(host, port, "connected");
    Ok(spawn(stream, config, handler))
}

async fn run<S>(
    stream: S,
    mut engine: Engine,
    handler: Arc<dyn EnvelopeHandler>,
    id: ConnectionId,
    sender: mpsc::WeakUnboundedSender<Command>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (packet_tx, packet_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, packet_rx, done_tx));

    let mut buf = vec![0u8; READ_BUF];
    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(conn = %id, "connection up");

    let mut closing = false;
    let reason = loop {
        if let Some(packet) = engine.poll_transmit(now()) {
            if packet_tx.send(packet).is_err() {
                break "writer gone";
            }
        }
        if closing && engine.is_idle() {
            break "closed locally";
        }

        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break "peer closed",
                Ok(n) => {
                    let inbound = engine.on_bytes(&buf[..n], now());
                    if !inbound.is_empty() {
                        match sender.upgrade() {
                            Some(commands) => {
                                let handle = ConnectionHandle { id, commands };
                                for item in inbound {
                                    dispatch(handler.as_ref(), &handle, item);
                                }
                            }
                            None => tracing::debug!(conn = %id, dropped = inbound.len(), "no handles left, inbound dropped"),
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(conn = %id, error = %e, "read failed");
                    break "read error";
                }
            },

            Some(written) = done_rx.recv() => match written {
                Ok(()) => engine.on_write_complete(now()),
                Err(e) => {
                    tracing::warn!(conn = %id, error = %e, "write failed");
                    break "write error";
                }
            },

            command = commands.recv(), if !closing => match command {
                Some(Command::Close) | None => {
                    tracing::debug!(conn = %id, "close requested, draining sends");
                    closing = true;
                }
                Some(command) => apply(&mut engine, id, command),
            },

            _ = tick.tick() => {
                for key in engine.on_tick(now()) {
                    tracing::debug!(conn = %id, %key, "receive deadline passed");
                }
            }
        }
    };

    tracing::info!(conn = %id, reason, "connection down");
    engine.on_disconnect();
    drop(packet_tx);
    let _ = writer_task.await;
    handler.disconnected(id);
}

fn apply(engine: &mut Engine, id: ConnectionId, command: Command) {
    let now = now();
    match command {
        Command::Submit { key, payload, reply } => engine.submit(key, payload, reply, now),
        Command::Cancel {
            key,
            request_key,
            confirm,
        } => {
            if let Err(e) = engine.cancel_under(key, request_key, Some(confirm), now) {
                tracing::warn!(conn = %id, %key, error = %e, "cancel could not be sent");
            }
        }
        Command::Rearm(key) => {
            engine.rearm(key, now);
        }
        Command::Close => {}
    }
}

/// Performs one write at a time and reports each completion.
async fn write_loop<W>(
    mut writer: W,
    mut packets: mpsc::UnboundedReceiver<Bytes>,
    done: mpsc::UnboundedSender<std::io::Result<()>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = packets.recv().await {
        let mut written = writer.write_all(&packet).await;
        if written.is_ok() {
            written = writer.flush().await;
        }
        let failed = written.is_err();
        if done.send(written).is_err() || failed {
            return;
        }
    }
    let _ = writer.shutdown().await;
}
