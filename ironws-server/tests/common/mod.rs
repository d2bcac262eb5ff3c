#![allow(dead_code)]

use futures::StreamExt;
use ironws_server::{ServerBuilder, ServerHandle};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn loopback() -> ServerBuilder {
    ServerBuilder::new().bind("127.0.0.1:0".parse().unwrap())
}

/// Starts a server that echoes every text message back to its sender.
pub fn echo_server() -> ServerHandle {
    let server = loopback()
        .on_accept(|session| {
            let echo = session.clone();
            session.on_message(move |text| {
                let _ = echo.send(text);
            });
        })
        .build()
        .unwrap();
    server.run().unwrap();
    server
}

pub async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = tokio::time::timeout(
        TIMEOUT,
        tokio_tungstenite::connect_async(format!("ws://{addr}")),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed");
    client
}

/// Returns the next text message, or `None` once the server closed.
pub async fn next_text(client: &mut Client) -> Option<String> {
    loop {
        let next = tokio::time::timeout(TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a message");
        match next {
            Some(Ok(Message::Text(text))) => return Some(text.as_str().to_owned()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => {}
        }
    }
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for the server")
        .expect("channel closed")
}

/// Asserts nothing arrives on `rx` for a short while.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected event: {extra:?}");
}

/// Drops the server off the async runtime; the drop joins the worker.
pub async fn shutdown(server: ServerHandle) {
    tokio::time::timeout(
        Duration::from_secs(10),
        tokio::task::spawn_blocking(move || drop(server)),
    )
    .await
    .expect("shutdown deadlocked")
    .unwrap();
}
