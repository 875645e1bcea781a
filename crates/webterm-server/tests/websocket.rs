//! Tests of the HTTP front end over real sockets.

use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio_tungstenite::tungstenite::Message;
use webterm_config::DisconnectPolicy;
use webterm_protocol::{ClientMessage, Reply, Request, ServerMessage};
use webterm_server::ServerOptions;
use webterm_server::liveness::LivenessSweeper;
use webterm_server::pty::SpawnOptions;

const WAIT: Duration = Duration::from_secs(10);

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<eyre::Result<()>>,
}

impl TestServer {
    async fn start(index: Option<std::path::PathBuf>) -> Self {
        let mut spawn = SpawnOptions::new(vec!["/bin/sh".to_string()]);
        spawn.kill_grace = Duration::from_millis(200);
        let options = ServerOptions {
            spawn,
            max_sessions: None,
            share: false,
            on_disconnect: DisconnectPolicy::Destroy,
            sweeper: LivenessSweeper::new(Duration::from_secs(1), Duration::from_secs(60)),
            outbound_capacity: 1024,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(webterm_server::serve(listener, options, index, async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            shutdown: Some(tx),
            task,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, webterm_protocol::WS_PATH)
    }

    async fn get(&self, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(self.addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        response
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();
    }
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn send(socket: &mut Socket, message: &ClientMessage) {
    let json = serde_json::to_string(message).unwrap();
    socket.send(Message::Text(json)).await.unwrap();
}

async fn next_message(socket: &mut Socket) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_websocket_session() {
    let server = TestServer::start(None).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(server.ws_url())
        .await
        .unwrap();

    send(&mut socket, &ClientMessage::with_seq(1, Request::Spawn)).await;
    let session_id = loop {
        if let ServerMessage::Reply {
            seq: 1,
            reply: Reply::Spawned { session_id },
        } = next_message(&mut socket).await
        {
            break session_id;
        }
    };

    send(
        &mut socket,
        &ClientMessage::new(Request::Data {
            session_id,
            data: b"echo ws-$((2 + 3))\n".to_vec(),
        }),
    )
    .await;

    let mut output = Vec::new();
    while !String::from_utf8_lossy(&output).contains("ws-5") {
        if let ServerMessage::Data { data, .. } = next_message(&mut socket).await {
            output.extend_from_slice(&data);
        }
    }

    send(&mut socket, &ClientMessage::new(Request::Destroy { session_id })).await;
    loop {
        if next_message(&mut socket).await == (ServerMessage::Kill { session_id }) {
            break;
        }
    }

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let server = TestServer::start(None).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(server.ws_url())
        .await
        .unwrap();

    socket
        .send(Message::Text("{\"type\":\"launch\"}".to_string()))
        .await
        .unwrap();
    socket.send(Message::Text("not json".to_string())).await.unwrap();

    send(
        &mut socket,
        &ClientMessage::with_seq(
            9,
            Request::Process {
                session_id: webterm_protocol::SessionId(77),
            },
        ),
    )
    .await;
    assert_eq!(
        next_message(&mut socket).await,
        ServerMessage::Reply {
            seq: 9,
            reply: Reply::Process {
                name: webterm_protocol::UNKNOWN_PROCESS.to_string()
            },
        }
    );

    server.stop().await;
}

#[tokio::test]
async fn test_builtin_index_page() {
    let server = TestServer::start(None).await;
    let response = server.get("/").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("<title>webterm</title>"));
    server.stop().await;
}

#[tokio::test]
async fn test_custom_index_page() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.html");
    std::fs::write(&path, "<html>custom page</html>").unwrap();

    let server = TestServer::start(Some(path)).await;
    let response = server.get("/").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("custom page"));
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_with_open_socket() {
    let server = TestServer::start(None).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(server.ws_url())
        .await
        .unwrap();
    send(&mut socket, &ClientMessage::with_seq(1, Request::Spawn)).await;
    next_message(&mut socket).await;

    server.stop().await;
}
