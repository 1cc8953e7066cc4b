use crate::*;

use ferry_engine::Outcome;

/// Cancelling an outstanding request releases the local waiter, reaches the
/// peer exactly once, and is confirmed exactly once.
#[tokio::test]
async fn test_cancel_is_requested_and_confirmed_once() {
    let dir = scratch_dir("cancel");
    let server = Server::start(TestServer::silent(), engine_config(&dir.join("server"), Duration::from_secs(30)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir.join("client"), Duration::from_secs(30))).await.unwrap();

    let key = Key::generate();
    let mut exchange = client.request(direct("never answered", key), Some(key)).unwrap();
    let handler = server.handler.clone();
    eventually("request delivered", || !handler.direct.lock().unwrap().is_empty()).await;

    let mut confirm = client.cancel(key).unwrap();
    assert_eq!(exchange.outcome().await, Outcome::Cancelled);

    let body = tokio::time::timeout(Duration::from_secs(5), confirm.outcome())
        .await
        .expect("confirmation arrives")
        .into_data()
        .expect("data reply");
    let cancels = handler.cancels.lock().unwrap().clone();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].content, Some(key.to_string()));
    assert_eq!(cancels[0].message_key, confirm.key());
    assert_ne!(confirm.key(), key);

    let response = Envelope::from_bytes(&body, cancels[0].message_key).unwrap();
    assert_eq!(response.action, Action::CancelResponse);
    assert_eq!(response.content, Some(key.to_string()));
    assert_eq!(response.error_code, None);

    // Give any duplicate a chance to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handler.cancels.lock().unwrap().len(), 1);

    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

/// Cancelling a large download part-way through ends it as cancelled
/// (unless it already finished), and the connection keeps working.
#[tokio::test]
async fn test_cancel_mid_download_keeps_connection() {
    let dir = scratch_dir("cancel-download");
    let root = dir.join("root");
    std::fs::create_dir_all(&root).unwrap();
    write_pattern(&root.join("large.bin"), 32 * 1024 * 1024);

    let server = Server::start(TestServer::serving(&root), engine_config(&dir.join("server"), Duration::from_secs(30)))
        .await
        .unwrap();
    let client = server.client(engine_config(&dir.join("client"), Duration::from_secs(30))).await.unwrap();

    let mut download = client
        .request_envelope(Action::DownloadRequest, Some("large.bin".into()))
        .unwrap();
    let key = download.key();

    // Wait for the first chunk, then cancel.
    let first = download.events().recv().await;
    assert!(first.is_some());
    let mut confirm = client.cancel(key).unwrap();

    match download.outcome().await {
        Outcome::Cancelled => {
            let staged = dir.join("client").join(format!("{key}.tmp"));
            assert!(!staged.exists(), "partial file removed");
        }
        // Loopback can outrun the cancel; the file must then be whole.
        Outcome::File(path) => assert_eq!(std::fs::metadata(path).unwrap().len(), 32 * 1024 * 1024),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(confirm.outcome().await.is_success());

    let handler = server.handler.clone();
    eventually("cancel seen by server", || handler.cancels.lock().unwrap().len() == 1).await;

    // Same connection, next exchange.
    let ping = Key::generate();
    let mut again = client.request(direct("ping", ping), Some(ping)).unwrap();
    let reply = again.outcome().await.into_data().expect("data reply");
    assert_eq!(Envelope::from_bytes(&reply, ping).unwrap().content.as_deref(), Some("pong"));

    server.stop().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}
