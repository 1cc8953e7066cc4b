//! One-shot client commands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;

use ferry_core::wire::DEFAULT_PORT;
use ferry_core::{Action, DirectKind, DirectMessage, Envelope};
use ferry_engine::{
    connect, ConnectionHandle, EngineConfig, Exchange, NoopHandler, Outcome, TransferEvent,
};

use crate::serve::{move_file, FileEntry};

/// `host` or `host:port`.
fn parse_peer(peer: &str) -> Result<(String, u16)> {
    match peer.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse().with_context(|| format!("bad port in {peer}"))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((peer.to_string(), DEFAULT_PORT)),
    }
}

async fn dial(peer: &str, config: EngineConfig) -> Result<(ConnectionHandle, JoinHandle<()>)> {
    let (host, port) = parse_peer(peer)?;
    connect(&host, port, config, Arc::new(NoopHandler)).await
}

/// Wait for the outcome, printing progress as it arrives. Each chunk
/// pushes the receive deadline out again.
async fn follow(conn: &ConnectionHandle, exchange: &mut Exchange) -> Outcome {
    let mut last_percent = None;
    conn.follow(exchange, |event| match event {
        TransferEvent::Progress { received, total } if total > 0 => {
            let percent = received * 100 / total;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                eprint!("\r{percent:>3}%  {received}/{total} bytes");
            }
        }
        TransferEvent::Progress { .. } => {}
        TransferEvent::Rate { direction, bytes } => {
            tracing::debug!(?direction, bytes_per_sec = bytes, "rate");
        }
    })
    .await
}

fn reply_envelope(outcome: Outcome, exchange: &Exchange) -> Result<Envelope> {
    match outcome {
        Outcome::Data(bytes) => {
            Envelope::from_bytes(&bytes, exchange.key()).context("reply is not an envelope")
        }
        other => bail!("no reply: {other:?}"),
    }
}

pub async fn send(peer: &str, text: &str, config: EngineConfig) -> Result<()> {
    let (conn, _task) = dial(peer, config).await?;
    let body = DirectMessage::new(DirectKind::Common, text).to_json()?;
    let mut exchange = conn.request_envelope(Action::DirectData, Some(body))?;

    let outcome = exchange.outcome().await;
    let reply = reply_envelope(outcome, &exchange)?;
    let content = reply.content.unwrap_or_default();
    match DirectMessage::from_json(&content) {
        Ok(message) => println!("{}", message.content.unwrap_or_default()),
        Err(_) => println!("{content}"),
    }
    conn.close();
    Ok(())
}

pub async fn list(peer: &str, folder: Option<&str>, config: EngineConfig) -> Result<()> {
    let (conn, _task) = dial(peer, config).await?;
    let mut exchange = conn.request_envelope(Action::ListRequest, folder.map(str::to_string))?;

    let outcome = exchange.outcome().await;
    let reply = reply_envelope(outcome, &exchange)?;
    if let Some(code) = reply.error_code {
        bail!("peer could not list {}: {code}", folder.unwrap_or("its files"));
    }
    let entries: Vec<FileEntry> = serde_json::from_str(reply.content.as_deref().unwrap_or("[]"))
        .context("listing is not a JSON array of file entries")?;
    for entry in entries {
        if entry.is_folder {
            println!("{:>12}  {}/", "-", entry.file_path);
        } else {
            println!("{:>12}  {}", entry.file_size, entry.file_path);
        }
    }
    conn.close();
    Ok(())
}

pub async fn fetch(
    peer: &str,
    path: &str,
    cancel_after: Option<Duration>,
    config: EngineConfig,
) -> Result<()> {
    let (conn, _task) = dial(peer, config).await?;
    let mut exchange = conn.request_envelope(Action::DownloadRequest, Some(path.to_string()))?;
    let key = exchange.key();

    let canceller = cancel_after.map(|delay| {
        let conn = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match conn.cancel(key) {
                Ok(mut confirm) => match confirm.outcome().await {
                    Outcome::Data(_) => eprintln!("\npeer confirmed cancellation of {key}"),
                    other => eprintln!("\ncancellation of {key} unconfirmed: {other:?}"),
                },
                Err(e) => eprintln!("\ncould not cancel {key}: {e}"),
            }
        })
    });

    let outcome = follow(&conn, &mut exchange).await;
    eprintln!();
    let result = match outcome {
        Outcome::File(staged) => {
            let name = Path::new(path)
                .file_name()
                .context("requested path has no file name")?;
            move_file(&staged, Path::new(name))
                .with_context(|| format!("failed to move {} into place", staged.display()))?;
            println!("{}", Path::new(name).display());
            Ok(())
        }
        Outcome::Data(bytes) if bytes.is_empty() => Err(anyhow::anyhow!("{path}: not found on peer")),
        Outcome::Data(_) => Err(anyhow::anyhow!("{path}: peer answered with data, not a file")),
        Outcome::Cancelled => {
            if let Some(task) = canceller {
                let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
            }
            Err(anyhow::anyhow!("{path}: download cancelled"))
        }
        other => Err(anyhow::anyhow!("{path}: download failed: {other:?}")),
    };
    conn.close();
    result
}

pub async fn push(peer: &str, file: &str, config: EngineConfig) -> Result<()> {
    let path = Path::new(file);
    if !path.is_file() {
        bail!("{file} is not a file");
    }
    let (conn, task) = dial(peer, config).await?;
    let key = conn.send_file(path, None)?;

    // Uploads are not acknowledged; closing drains the send queue first.
    conn.close();
    task.await.context("connection task panicked")?;
    println!("{key}");
    Ok(())
}
