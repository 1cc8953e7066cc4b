use crate::*;

use std::time::Instant;

use ferry_engine::Outcome;

/// A request the peer never answers times out once, after the deadline.
#[tokio::test]
async fn test_unanswered_request_times_out() {
    let dir = scratch_dir("timeout");
    let server = Server::start(TestServer::silent(), engine_config(&dir, Duration::from_secs(5)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir, Duration::from_secs(1))).await.unwrap();

    let key = Key::generate();
    let started = Instant::now();
    let mut exchange = client.request(direct("anyone?", key), Some(key)).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), exchange.outcome())
        .await
        .expect("timeout fires");

    assert_eq!(outcome, Outcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(!client.is_closed(), "a timeout is local to the exchange");

    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

/// Rearming pushes the deadline out by a full timeout.
#[tokio::test]
async fn test_rearm_extends_deadline() {
    let dir = scratch_dir("rearm");
    let server = Server::start(TestServer::silent(), engine_config(&dir, Duration::from_secs(5)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir, Duration::from_secs(1))).await.unwrap();

    let key = Key::generate();
    let started = Instant::now();
    let mut exchange = client.request(direct("anyone?", key), Some(key)).unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    client.rearm(key).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), exchange.outcome())
        .await
        .expect("timeout fires");
    assert_eq!(outcome, Outcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(1700));

    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}
