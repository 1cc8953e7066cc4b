use crate::*;

use ferry_core::wire::{chunk_count_for, MAX_CHUNK_PAYLOAD};
use ferry_engine::{Outcome, TransferEvent};

const MIB: usize = 1024 * 1024;

/// Request a 1 MiB file: it arrives in ceil(1 MiB / max chunk) chunks, the
/// waiter fires once, and the staged copy is byte-identical.
#[tokio::test]
async fn test_download_one_mib_round_trip() {
    let dir = scratch_dir("download");
    let root = dir.join("root");
    std::fs::create_dir_all(&root).unwrap();
    let content = write_pattern(&root.join("big.bin"), MIB);

    let server = Server::start(TestServer::serving(&root), engine_config(&dir.join("server"), Duration::from_secs(5)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir.join("client"), Duration::from_secs(5))).await.unwrap();

    let mut exchange = client
        .request_envelope(Action::DownloadRequest, Some("big.bin".into()))
        .unwrap();
    let key = exchange.key();

    let mut progress = Vec::new();
    let outcome = exchange
        .outcome_with(|event| {
            if let TransferEvent::Progress { received, total } = event {
                progress.push((received, total));
            }
        })
        .await;

    let path = outcome.into_path().expect("file reply");
    assert_eq!(path, dir.join("client").join(format!("{key}.tmp")));
    assert_eq!(std::fs::read(&path).unwrap(), content);

    let expected_chunks = (MIB as u64).div_ceil(MAX_CHUNK_PAYLOAD as u64);
    assert_eq!(expected_chunks, chunk_count_for(MIB as u64));
    assert_eq!(progress.len() as u64, expected_chunks);
    assert_eq!(progress.last(), Some(&(MIB as u64, MIB as u64)));
    assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));

    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

/// A missing file is answered with an empty data reply, not silence.
#[tokio::test]
async fn test_download_missing_file() {
    let dir = scratch_dir("download-missing");
    let server = Server::start(TestServer::serving(&dir), engine_config(&dir, Duration::from_secs(5)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir, Duration::from_secs(5))).await.unwrap();

    let mut exchange = client
        .request_envelope(Action::DownloadRequest, Some("nope.bin".into()))
        .unwrap();
    assert_eq!(exchange.outcome().await, Outcome::Data(Bytes::new()));

    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

/// An unsolicited upload lands in the server's staging directory intact.
#[tokio::test]
async fn test_upload_reaches_handler() {
    let dir = scratch_dir("upload");
    let staging = dir.join("server");
    let server = Server::start(TestServer::default(), engine_config(&staging, Duration::from_secs(5)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir.join("client"), Duration::from_secs(5))).await.unwrap();

    let source = dir.join("upload.bin");
    let content = write_pattern(&source, 3 * MAX_CHUNK_PAYLOAD + 123);
    let key = client.send_file(&source, None).unwrap();

    let handler = server.handler.clone();
    eventually("upload", || !handler.files.lock().unwrap().is_empty()).await;
    let (got_key, path) = handler.files.lock().unwrap()[0].clone();
    assert_eq!(got_key, key);
    assert_eq!(path, staging.join(format!("{key}.tmp")));
    assert_eq!(std::fs::read(&path).unwrap(), content);

    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

/// An empty file still travels as one empty chunk.
#[tokio::test]
async fn test_download_empty_file() {
    let dir = scratch_dir("download-empty");
    let root = dir.join("root");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("empty"), b"").unwrap();

    let server = Server::start(TestServer::serving(&root), engine_config(&dir.join("server"), Duration::from_secs(5)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir.join("client"), Duration::from_secs(5))).await.unwrap();

    let mut exchange = client
        .request_envelope(Action::DownloadRequest, Some("empty".into()))
        .unwrap();
    let path = exchange.outcome().await.into_path().expect("file reply");
    assert_eq!(std::fs::read(&path).unwrap(), b"");

    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}
