use crate::*;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use ferry_core::wire::encode_packet;
use ferry_core::{PacketHeader, PayloadKind};
use ferry_engine::Outcome;

const CHUNKS: usize = 4;
const CHUNK: usize = 1000;
const GAP: Duration = Duration::from_millis(600);

/// A bare TCP peer that answers one request under `key` with a file, one
/// chunk every `GAP`. The whole reply takes far longer than the receive
/// timeout while no single gap does.
async fn trickling_peer(key: Key, content: Vec<u8>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut rd, mut wr) = stream.into_split();
        tokio::spawn(async move {
            let mut sink = vec![0u8; 4096];
            while matches!(rd.read(&mut sink).await, Ok(n) if n > 0) {}
        });

        let total = content.len() as u64;
        for (index, chunk) in content.chunks(CHUNK).enumerate() {
            tokio::time::sleep(GAP).await;
            let header =
                PacketHeader::for_chunk(key, PayloadKind::File, CHUNKS as u64, index as u64, chunk.len(), total);
            let packet = encode_packet(&header, chunk).unwrap();
            if wr.write_all(&packet).await.is_err() {
                return;
            }
        }
        // Hold the connection open until the client goes away.
        tokio::time::sleep(Duration::from_secs(10)).await;
    });
    port
}

async fn dial(port: u16, dir: &Path) -> ConnectionHandle {
    init_logging();
    let config = engine_config(dir, Duration::from_secs(1));
    let (conn, _task) = ferry_engine::connect("127.0.0.1", port, config, Arc::new(NoopHandler))
        .await
        .unwrap();
    conn
}

/// A download that keeps arriving outlives the receive timeout when the
/// caller follows it.
#[tokio::test]
async fn test_followed_slow_download_completes() {
    let dir = scratch_dir("slow-followed");
    let content: Vec<u8> = (0..CHUNKS * CHUNK).map(|i| (i % 253) as u8).collect();
    let key = Key::generate();
    let port = trickling_peer(key, content.clone()).await;
    let client = dial(port, &dir).await;

    let mut exchange = client.request(direct("slow please", key), Some(key)).unwrap();
    let mut progress = 0;
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        client.follow(&mut exchange, |event| {
            if matches!(event, ferry_engine::TransferEvent::Progress { .. }) {
                progress += 1;
            }
        }),
    )
    .await
    .expect("download finishes");

    let Outcome::File(path) = outcome else {
        panic!("expected a file, got {outcome:?}");
    };
    assert_eq!(std::fs::read(&path).unwrap(), content);
    assert_eq!(progress, CHUNKS);

    client.close();
    std::fs::remove_dir_all(&dir).ok();
}

/// Without rearming the same download hits the deadline part-way.
#[tokio::test]
async fn test_unfollowed_slow_download_times_out() {
    let dir = scratch_dir("slow-unfollowed");
    let content: Vec<u8> = vec![7u8; CHUNKS * CHUNK];
    let key = Key::generate();
    let port = trickling_peer(key, content).await;
    let client = dial(port, &dir).await;

    let mut exchange = client.request(direct("slow please", key), Some(key)).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), exchange.outcome())
        .await
        .expect("deadline fires");
    assert_eq!(outcome, Outcome::TimedOut);

    client.close();
    std::fs::remove_dir_all(&dir).ok();
}
