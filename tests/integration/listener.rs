use crate::*;

/// Several peers on one listener run independent engines: the same key on
/// two connections never crosses over, and the peer table follows
/// connections coming and going.
#[tokio::test]
async fn test_multi_peer_listener() {
    let dir = scratch_dir("multi-peer");
    let server = Server::start(TestServer::default(), engine_config(&dir.join("server"), Duration::from_secs(5)))
        .await
        .unwrap();

    let mut clients = Vec::new();
    for i in 0..4 {
        let client = server
            .client(engine_config(&dir.join(format!("client-{i}")), Duration::from_secs(5)))
            .await
            .unwrap();
        clients.push(client);
    }
    let peers = server.peers.clone();
    eventually("four peers", || peers.len() == 4).await;
    assert_eq!(server.handler.connected.load(Ordering::SeqCst), 4);

    let shared = Key::parse("shared").unwrap();
    let mut exchanges = Vec::new();
    for (i, client) in clients.iter().enumerate() {
        exchanges.push(client.request(direct(&format!("from {i}"), shared), Some(shared)).unwrap());
    }
    for (i, exchange) in exchanges.iter_mut().enumerate() {
        let reply = exchange.outcome().await.into_data().expect("data reply");
        let envelope = Envelope::from_bytes(&reply, shared).unwrap();
        assert_eq!(envelope.content, Some(format!("from {i}")));
    }

    clients.remove(0).close();
    eventually("three peers", || peers.len() == 3).await;
    let handler = server.handler.clone();
    eventually("disconnect hook", || handler.disconnected.load(Ordering::SeqCst) == 1).await;

    server.stop().await.unwrap();
    eventually("empty peer table", || peers.is_empty()).await;
    for client in &clients {
        let closed = client.clone();
        eventually("client sees shutdown", move || closed.is_closed()).await;
    }
    std::fs::remove_dir_all(&dir).ok();
}
