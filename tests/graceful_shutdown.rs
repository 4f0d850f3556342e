//! Controlled shutdown must end attached WebSocket clients, not wait on
//! them: the connection drain only finishes once every session has ended.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use termhub::api::{self, AppState};
use termhub::config::Config;
use termhub::session::SessionRegistry;

#[tokio::test]
async fn shutdown_with_attached_client_terminates() {
    let tmp = tempfile::tempdir().unwrap();
    let sessions = SessionRegistry::new(Config {
        workspace_root: tmp.path().to_path_buf(),
        shell: Some("/bin/sh".to_string()),
        ..Config::default()
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (trigger_tx, trigger_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(api::serve(
        listener,
        AppState {
            sessions: sessions.clone(),
        },
        async move {
            let _ = trigger_rx.await;
        },
    ));

    let session = sessions.create("demo", "attached").await.unwrap();
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/sessions/{}", session.id))
        .await
        .expect("websocket connect");
    ws.send(Message::text("echo attached-client\n"))
        .await
        .unwrap();

    trigger_tx.send(()).unwrap();

    // The server comes down even though a client is still attached.
    let served = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("graceful shutdown should not wait on attached clients");
    served.unwrap().unwrap();

    // The client observes end-of-session rather than hanging.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => break,
            Err(_) => panic!("client never saw the session end"),
        }
    }
    assert!(sessions.is_empty());
}
