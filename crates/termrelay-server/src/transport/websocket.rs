//! WebSocket listener using tokio-tungstenite.
//!
//! The HTTP upgrade is split in two: [`UpgradeRequest::read`] parses the
//! request without answering it, so the server can authenticate the caller
//! and negotiate SSH first. Only then is the connection either upgraded with
//! [`UpgradeRequest::accept`] or refused with a plain HTTP status via
//! [`UpgradeRequest::reject`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use termrelay_core::{RelayError, RelayResult, WireMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::relay::ClientLink;

/// Largest accepted request head.
const MAX_REQUEST_HEAD: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A TCP connection that has not been upgraded yet.
pub struct PendingConnection {
    pub stream: TcpStream,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted TCP connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> RelayResult<(SocketAddr, mpsc::Receiver<PendingConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<PendingConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, remote_addr)) => {
                    debug!(remote = %remote_addr, "TCP connection accepted");
                    let conn = PendingConnection {
                        stream,
                        remote_addr,
                    };
                    if tx.send(conn).await.is_err() {
                        warn!("connection channel closed, stopping listener");
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// A parsed but unanswered WebSocket upgrade request.
pub struct UpgradeRequest {
    stream: TcpStream,
    remote_addr: SocketAddr,
    path: String,
    query: String,
    key: String,
    /// Bytes read past the end of the request head.
    leftover: Vec<u8>,
}

impl UpgradeRequest {
    /// Read and validate the request head. Malformed requests are answered
    /// with `400 Bad Request` before the error is returned.
    pub async fn read(conn: PendingConnection) -> RelayResult<Self> {
        let PendingConnection {
            mut stream,
            remote_addr,
        } = conn;

        let head = tokio::time::timeout(REQUEST_TIMEOUT, read_head(&mut stream))
            .await
            .map_err(|_| RelayError::Transport("timed out reading upgrade request".into()))
            .and_then(|r| r);

        match head {
            Ok(parsed) => Ok(Self {
                stream,
                remote_addr,
                path: parsed.path,
                query: parsed.query,
                key: parsed.key,
                leftover: parsed.leftover,
            }),
            Err(e) => {
                write_status(&mut stream, 400, "Bad Request", &e.to_string()).await;
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// First value of query parameter `name`, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Complete the upgrade. Messages and frames larger than
    /// `max_frame_size` are refused by the protocol reader before they are
    /// buffered.
    pub async fn accept(mut self, max_frame_size: usize) -> RelayResult<WsClientLink> {
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            derive_accept_key(self.key.as_bytes())
        );
        self.stream
            .write_all(response.as_bytes())
            .await
            .map_err(|e| RelayError::Transport(format!("upgrade response failed: {e}")))?;

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(max_frame_size);
        config.max_frame_size = Some(max_frame_size);
        let ws = WebSocketStream::from_partially_read(
            self.stream,
            self.leftover,
            Role::Server,
            Some(config),
        )
        .await;
        debug!(remote = %self.remote_addr, max_frame_size, "WebSocket connection accepted");
        Ok(WsClientLink { ws, closed: false })
    }

    /// Refuse the upgrade with a plain HTTP status.
    pub async fn reject(mut self, status: u16, reason: &str, body: &str) {
        debug!(remote = %self.remote_addr, status, "rejecting upgrade");
        write_status(&mut self.stream, status, reason, body).await;
    }
}

struct RequestHead {
    path: String,
    query: String,
    key: String,
    leftover: Vec<u8>,
}

async fn read_head(stream: &mut TcpStream) -> RelayResult<RequestHead> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RelayError::Transport("connection closed during upgrade".into()));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(head) = parse_head(&buf)? {
            return Ok(head);
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(RelayError::Decode("request head too large".into()));
        }
    }
}

/// Parse an HTTP upgrade request head. Returns `None` if more bytes are needed.
fn parse_head(buf: &[u8]) -> RelayResult<Option<RequestHead>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let head_len = match request
        .parse(buf)
        .map_err(|e| RelayError::Decode(format!("malformed request: {e}")))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    if request.method != Some("GET") {
        return Err(RelayError::Decode("upgrade must use GET".into()));
    }
    let target = request.path.unwrap_or("/");
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    };

    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::trim)
    };

    let upgrade_ok = header("Upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection_ok = header("Connection").is_some_and(|v| {
        v.split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    });
    if !upgrade_ok || !connection_ok {
        return Err(RelayError::Decode("not a WebSocket upgrade".into()));
    }
    if header("Sec-WebSocket-Version") != Some("13") {
        return Err(RelayError::Decode("unsupported WebSocket version".into()));
    }
    let key = header("Sec-WebSocket-Key")
        .filter(|k| !k.is_empty())
        .ok_or_else(|| RelayError::Decode("missing Sec-WebSocket-Key".into()))?
        .to_string();

    Ok(Some(RequestHead {
        path,
        query,
        key,
        leftover: buf[head_len..].to_vec(),
    }))
}

async fn write_status(stream: &mut TcpStream, status: u16, reason: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "failed to write HTTP response");
    }
    let _ = stream.shutdown().await;
}

/// An upgraded client connection.
pub struct WsClientLink {
    ws: WebSocketStream<TcpStream>,
    closed: bool,
}

#[async_trait]
impl ClientLink for WsClientLink {
    async fn send(&mut self, message: WireMessage) -> RelayResult<()> {
        let message = match message {
            WireMessage::Text(text) => Message::Text(text.into()),
            WireMessage::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.ws
            .send(message)
            .await
            .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))
    }

    async fn recv(&mut self) -> RelayResult<Option<WireMessage>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(WireMessage::Text(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(WireMessage::Binary(data))),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(RelayError::Transport(format!("WS recv failed: {e}")));
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "WS close failed");
        }
    }
}
