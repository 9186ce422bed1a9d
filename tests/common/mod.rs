//! Shared helpers for integration tests: start a server on an ephemeral
//! port and talk to it over raw TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use plum::{ServeConfig, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub head: String,
    pub body: String,
}

impl Reply {
    /// Value of header `name` (case-insensitive), if present.
    #[allow(dead_code)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

/// Runs `server` on `127.0.0.1:0` in the background.
pub async fn start(server: Arc<Server>) -> (SocketAddr, JoinHandle<Result<(), plum::Error>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move { server.run_with_listener(listener, ServeConfig::default()).await });
    // Let the accept loop start before the first connect.
    tokio::task::yield_now().await;
    (addr, handle)
}

/// Sends `request` verbatim and reads until the server closes the connection.
pub async fn raw(addr: SocketAddr, request: &str) -> Reply {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    socket.read_to_end(&mut buf).await.unwrap();
    parse(&String::from_utf8_lossy(&buf))
}

/// `GET path` with `Connection: close`.
pub async fn get(addr: SocketAddr, path: &str) -> Reply {
    raw(addr, &format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")).await
}

/// `GET path` with extra header lines (each ending in `\r\n`).
#[allow(dead_code)]
pub async fn get_with(addr: SocketAddr, path: &str, headers: &str) -> Reply {
    raw(addr, &format!("GET {path} HTTP/1.1\r\nHost: test\r\n{headers}Connection: close\r\n\r\n")).await
}

fn parse(text: &str) -> Reply {
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text, ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Reply { status, head: head.to_owned(), body: body.to_owned() }
}
