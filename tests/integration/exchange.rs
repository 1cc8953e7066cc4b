use crate::*;

use ferry_engine::Outcome;

/// Client sends "ping" under K1; the server sees it under K1 and answers
/// "pong" under K1; the client's waiter for K1 gets the pong.
#[tokio::test]
async fn test_ping_pong_reply_correlation() {
    let dir = scratch_dir("ping-pong");
    let server = Server::start(TestServer::default(), engine_config(&dir.join("server"), Duration::from_secs(5)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir.join("client"), Duration::from_secs(5))).await.unwrap();

    let k1 = Key::parse("K1").unwrap();
    let mut exchange = client.request(direct("ping", k1), Some(k1)).unwrap();
    let reply = exchange.outcome().await.into_data().expect("data reply");

    let pong = Envelope::from_bytes(&reply, k1).unwrap();
    assert_eq!(pong.action, Action::DirectData);
    assert_eq!(pong.content.as_deref(), Some("pong"));

    let seen = server.handler.direct.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].content.as_deref(), Some("ping"));
    assert_eq!(seen[0].message_key, k1);

    client.close();
    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

/// Many requests in flight on one connection each get their own answer.
#[tokio::test]
async fn test_concurrent_requests_on_one_connection() {
    let dir = scratch_dir("concurrent");
    let server = Server::start(TestServer::default(), engine_config(&dir, Duration::from_secs(5)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir, Duration::from_secs(5))).await.unwrap();

    let mut pending = Vec::new();
    for i in 0..20 {
        let key = Key::generate();
        // Some of these span several packets.
        let body = format!("{i}:{}", "x".repeat(i * 3000));
        let exchange = client.request(direct(&body, key), Some(key)).unwrap();
        pending.push((body, exchange));
    }

    for (body, mut exchange) in pending {
        let key = exchange.key();
        let reply = exchange.outcome().await.into_data().expect("data reply");
        let envelope = Envelope::from_bytes(&reply, key).unwrap();
        assert_eq!(envelope.content.as_deref(), Some(body.as_str()));
    }

    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

/// A fire-and-forget send whose payload is not an envelope is persisted on
/// the receiving side under the exchange key.
#[tokio::test]
async fn test_unrecognized_payload_is_persisted() {
    let dir = scratch_dir("unrecognized");
    let staging = dir.join("server");
    let server = Server::start(TestServer::default(), engine_config(&staging, Duration::from_secs(5)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir.join("client"), Duration::from_secs(5))).await.unwrap();

    let key = client
        .send_structured(Bytes::from_static(b"\x01\x02 definitely not json"), None)
        .unwrap();

    let handler = server.handler.clone();
    eventually("unrecognized payload", || !handler.unrecognized.lock().unwrap().is_empty()).await;
    let (got_key, path) = handler.unrecognized.lock().unwrap()[0].clone();
    assert_eq!(got_key, key);
    assert_eq!(path, staging.join(format!("{key}.data")));
    assert_eq!(std::fs::read(&path).unwrap(), b"\x01\x02 definitely not json");

    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

/// Closing a connection releases the requests still waiting on it.
#[tokio::test]
async fn test_disconnect_releases_waiters() {
    let dir = scratch_dir("disconnect");
    let server = Server::start(TestServer::silent(), engine_config(&dir, Duration::from_secs(30)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir, Duration::from_secs(30))).await.unwrap();

    let key = Key::generate();
    let mut exchange = client.request(direct("hello?", key), Some(key)).unwrap();
    let handler = server.handler.clone();
    eventually("request delivered", || !handler.direct.lock().unwrap().is_empty()).await;

    server.stop().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), exchange.outcome())
        .await
        .expect("waiter released");
    assert_eq!(outcome, Outcome::Disconnected);
    std::fs::remove_dir_all(&dir).ok();
}
