//! Per-connection multiplexer.
//!
//! Every accepted connection starts in `Sniffing`. Once the first bytes
//! arrive the request head is accumulated (`HeaderParsing`) until it is
//! complete, times out, or proves not to be HTTP. A complete head either
//! upgrades into a tenant session (control path + `Upgrade`), is answered
//! locally (control path, favicon), is refused with the bad-gateway page (no
//! tenant for the host), or starts `Forwarding` to the tenant on
//! `web/<hostname>/<socketId>`. A `Connection: close` request whose body has
//! not fully arrived is held in `BufferingBody` until the declared length is
//! reached or the body timer fires; a declared body larger than the buffer
//! cap is streamed as it arrives. A request that no tenant session can take
//! any more is answered with the bad-gateway page unless a reply already
//! started. `Closed` always deregisters the socket and tells the bound
//! tenant, if any, on `web/<hostname>/<socketId>/close`, including when the
//! driving task unwinds early.

use crate::control;
use crate::server::Gateway;
use crate::sockets::SocketCommand;
use crate::tunnel;
use relaygate_core::http::{simple_response, BAD_GATEWAY_RESPONSE};
use relaygate_core::{topic, HeadParser, ParseOutcome, RequestHead};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

const READ_BUF_SIZE: usize = 16 * 1024;

/// Payload of the close notification sent to a tenant.
pub const CLOSE_PAYLOAD: &[u8] = b"close";

/// Where a connection is in its lifecycle.
#[derive(Debug)]
enum State {
    Sniffing,
    HeaderParsing(HeadParser),
    Forwarding,
    BufferingBody {
        buffer: Vec<u8>,
        /// Total bytes (head + body) that complete the request.
        expected: usize,
        deadline: Instant,
    },
    Closed,
}

/// What to do once the request head is known.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Tunnel,
    Control,
    NoHost,
    BadGateway,
    /// Hostname and the tenant session serving it.
    Forward(String, u64),
}

struct Connection {
    gw: Arc<Gateway>,
    socket_id: String,
    remote: SocketAddr,
    /// Tenant the socket was attributed to.
    hostname: Option<String>,
    state: State,
    /// Set once the socket is deregistered or handed off.
    released: bool,
}

/// Drive one accepted connection to completion.
pub async fn handle_connection(gw: Arc<Gateway>, mut stream: TcpStream, remote: SocketAddr) {
    let (tx, mut commands) = mpsc::unbounded_channel();
    let socket_id = gw.sockets.register(tx).await;
    debug!(socket_id = %socket_id, remote = %remote, "connection accepted");

    let mut conn = Connection {
        gw,
        socket_id,
        remote,
        hostname: None,
        state: State::Sniffing,
        released: false,
    };

    let head = match conn.sniff(&mut stream).await {
        Some(head) => head,
        None => return conn.close(&mut stream).await,
    };

    match conn.route(&head).await {
        Route::Tunnel => {
            let State::HeaderParsing(parser) = std::mem::replace(&mut conn.state, State::Closed)
            else {
                return conn.close(&mut stream).await;
            };
            // No longer an external socket.
            conn.gw.sockets.remove(&conn.socket_id).await;
            conn.released = true;
            let gw = conn.gw.clone();
            if let Err(e) = tunnel::run_tunnel(gw, stream, parser.into_buffer(), remote).await {
                debug!(remote = %remote, error = %e, "tenant session ended with error");
            }
        }
        Route::Control => {
            let response = match conn.read_body(&mut stream, &head).await {
                Ok(body) => control::respond(&conn.gw, &head, &body).await,
                Err(refusal) => refusal,
            };
            let _ = stream.write_all(&response).await;
            conn.close(&mut stream).await;
        }
        Route::NoHost => {
            debug!(socket_id = %conn.socket_id, "request without host, closing");
            conn.close(&mut stream).await;
        }
        Route::BadGateway => {
            debug!(socket_id = %conn.socket_id, host = ?head.host, "no tenant connected");
            let _ = stream.write_all(BAD_GATEWAY_RESPONSE).await;
            conn.close(&mut stream).await;
        }
        Route::Forward(hostname, conn_id) => {
            if conn.start_forwarding(hostname, conn_id, &head).await {
                conn.pump(&mut stream, &mut commands).await;
            } else {
                let _ = stream.write_all(BAD_GATEWAY_RESPONSE).await;
            }
            conn.close(&mut stream).await;
        }
    }
}

impl Connection {
    /// Read until the request head is complete. `None` means the connection
    /// must be closed without forwarding anything.
    async fn sniff(&mut self, stream: &mut TcpStream) -> Option<RequestHead> {
        let config = &self.gw.config;
        let parser = HeadParser::with_limits(config.header_parse_timeout, config.max_header_bytes);
        let deadline = Instant::from_std(parser.deadline());
        let mut parser = Some(parser);
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let n = match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
                Err(_) => {
                    debug!(socket_id = %self.socket_id, "header parse timed out");
                    return None;
                }
                Ok(Ok(0)) => return None,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!(socket_id = %self.socket_id, error = %e, "socket error while sniffing");
                    return None;
                }
            };

            // First bytes seen: the parser takes over.
            if let Some(parser) = parser.take() {
                self.state = State::HeaderParsing(parser);
            }
            let State::HeaderParsing(parser) = &mut self.state else {
                return None;
            };

            match parser.feed(&buf[..n]) {
                ParseOutcome::NeedMore => {}
                ParseOutcome::Complete(head) => return Some(head),
                ParseOutcome::Failed(e) => {
                    debug!(socket_id = %self.socket_id, remote = %self.remote, error = %e, "header parse failed");
                    return None;
                }
            }
        }
    }

    async fn route(&self, head: &RequestHead) -> Route {
        let path = control::request_path(&head.url);
        let control_path = self.gw.config.control_path();
        let is_control = control::is_control_path(path, &control_path);

        if is_control && head.is_upgrade() {
            return Route::Tunnel;
        }
        if is_control || path == "/favicon.ico" {
            return Route::Control;
        }
        let Some(host) = head.host.clone() else {
            return Route::NoHost;
        };
        match self.gw.tenants.get(&host).await {
            Some(tenant) => Route::Forward(host, tenant.conn_id),
            None => Route::BadGateway,
        }
    }

    /// Collect the body of a locally answered request. `Err` holds the
    /// response to send instead.
    async fn read_body(&mut self, stream: &mut TcpStream, head: &RequestHead) -> Result<Vec<u8>, Vec<u8>> {
        let limit = self.gw.config.max_body_buffer_bytes;
        let declared = match head.content_length.map(usize::try_from) {
            None | Some(Ok(0)) => return Ok(Vec::new()),
            Some(Ok(n)) if n <= limit => n,
            Some(_) => {
                return Err(simple_response(413, "Payload Too Large", "text/plain", b"body too large"))
            }
        };

        let mut body = match &self.state {
            State::HeaderParsing(parser) => parser
                .buffered()
                .get(head.head_len..)
                .unwrap_or_default()
                .to_vec(),
            _ => Vec::new(),
        };
        let deadline = Instant::now() + self.gw.config.body_wait;
        let mut buf = vec![0u8; READ_BUF_SIZE];
        while body.len() < declared {
            match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => body.extend_from_slice(&buf[..n]),
                _ => {
                    debug!(socket_id = %self.socket_id, declared, received = body.len(), "control body incomplete");
                    return Err(simple_response(400, "Bad Request", "text/plain", b"incomplete body"));
                }
            }
        }
        body.truncate(declared);
        Ok(body)
    }

    /// Bind the socket to its tenant and send what has arrived so far.
    /// False when no tenant session took the bytes.
    async fn start_forwarding(&mut self, hostname: String, conn_id: u64, head: &RequestHead) -> bool {
        self.gw.sockets.bind_host(&self.socket_id, &hostname, conn_id).await;
        self.hostname = Some(hostname);

        let State::HeaderParsing(parser) = std::mem::replace(&mut self.state, State::Forwarding)
        else {
            return false;
        };
        let data = parser.into_buffer();

        match buffer_target(head, data.len(), self.gw.config.max_body_buffer_bytes) {
            Some(expected) => {
                debug!(
                    socket_id = %self.socket_id,
                    expected,
                    received = data.len(),
                    "waiting for request body"
                );
                self.state = State::BufferingBody {
                    buffer: data,
                    expected,
                    deadline: Instant::now() + self.gw.config.body_wait,
                };
                true
            }
            None => self.forward(&data).await,
        }
    }

    /// `Forwarding` / `BufferingBody`: move bytes both ways until either side
    /// closes.
    async fn pump(
        &mut self,
        stream: &mut TcpStream,
        commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    ) {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let (mut reader, mut writer) = stream.split();
        let mut replied = false;

        loop {
            let body_deadline = match &self.state {
                State::BufferingBody { deadline, .. } => Some(*deadline),
                _ => None,
            };

            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if !self.on_data(&buf[..n]).await {
                            refuse_unserved(&mut writer, replied).await;
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(socket_id = %self.socket_id, error = %e, "socket read error");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(SocketCommand::Write(bytes)) => {
                        replied = true;
                        if let Err(e) = writer.write_all(&bytes).await {
                            debug!(socket_id = %self.socket_id, error = %e, "socket write error");
                            break;
                        }
                    }
                    Some(SocketCommand::End) | None => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                    Some(SocketCommand::Orphaned) => {
                        debug!(socket_id = %self.socket_id, "tenant session ended");
                        refuse_unserved(&mut writer, replied).await;
                        break;
                    }
                },
                _ = sleep_until(body_deadline), if body_deadline.is_some() => {
                    if !self.flush_buffered("body wait elapsed").await {
                        refuse_unserved(&mut writer, replied).await;
                        break;
                    }
                }
            }
        }
    }

    /// Returns false once the bytes have nowhere to go.
    async fn on_data(&mut self, data: &[u8]) -> bool {
        match &mut self.state {
            State::BufferingBody {
                buffer, expected, ..
            } => {
                buffer.extend_from_slice(data);
                if buffer.len() >= *expected {
                    return self.flush_buffered("body complete").await;
                }
                true
            }
            _ => self.forward(data).await,
        }
    }

    async fn flush_buffered(&mut self, reason: &str) -> bool {
        match std::mem::replace(&mut self.state, State::Forwarding) {
            State::BufferingBody { buffer, .. } => {
                debug!(socket_id = %self.socket_id, bytes = buffer.len(), reason, "forwarding buffered request");
                self.forward(&buffer).await
            }
            _ => true,
        }
    }

    /// Publish on the socket's web topic. False if no tenant session received it.
    async fn forward(&self, data: &[u8]) -> bool {
        let Some(hostname) = &self.hostname else {
            return false;
        };
        let topic = topic::web(hostname, &self.socket_id);
        if self.gw.broker.publish(&topic, data).await == 0 {
            warn!(socket_id = %self.socket_id, hostname = %hostname, "no subscriber for forwarded bytes");
            return false;
        }
        true
    }

    /// Enter `Closed`: deregister, notify the bound tenant, then shut the
    /// socket down.
    async fn close(&mut self, stream: &mut TcpStream) {
        self.state = State::Closed;
        self.released = true;
        release(&self.gw, &self.socket_id, self.hostname.take()).await;
        let _ = stream.shutdown().await;
        debug!(socket_id = %self.socket_id, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // The driving task unwound before reaching `close`.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(socket_id = %self.socket_id, "connection dropped outside a runtime, socket leaked");
            return;
        };
        let gw = self.gw.clone();
        let socket_id = std::mem::take(&mut self.socket_id);
        let hostname = self.hostname.take();
        runtime.spawn(async move {
            release(&gw, &socket_id, hostname).await;
            debug!(socket_id = %socket_id, "released dropped connection");
        });
    }
}

/// Deregister the socket and tell the tenant it was bound to.
async fn release(gw: &Gateway, socket_id: &str, hostname: Option<String>) {
    gw.sockets.remove(socket_id).await;
    if let Some(hostname) = hostname {
        let topic = topic::web_close(&hostname, socket_id);
        gw.broker.publish(&topic, CLOSE_PAYLOAD).await;
    }
}

/// Total bytes (head plus body) to hold back before forwarding, or `None` to
/// forward what has arrived. Only `Connection: close` requests whose declared
/// body is still in flight and no larger than `max_body` are held.
fn buffer_target(head: &RequestHead, received: usize, max_body: usize) -> Option<usize> {
    if !head.wants_close() {
        return None;
    }
    let declared = usize::try_from(head.content_length?)
        .ok()
        .filter(|declared| *declared <= max_body)?;
    let expected = head.head_len.checked_add(declared)?;
    (expected > received).then_some(expected)
}

/// Answer with the bad-gateway page unless the tenant already replied.
async fn refuse_unserved<W: AsyncWrite + Unpin>(writer: &mut W, replied: bool) {
    if !replied {
        let _ = writer.write_all(BAD_GATEWAY_RESPONSE).await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::time::Duration;

    fn head(raw: &str) -> RequestHead {
        match HeadParser::new().feed(raw.as_bytes()) {
            ParseOutcome::Complete(head) => head,
            other => panic!("bad test request: {other:?}"),
        }
    }

    #[test]
    fn only_close_requests_with_pending_body_are_held() {
        let close = head("POST / HTTP/1.1\r\nConnection: close\r\nContent-Length: 10\r\n\r\n");
        let keep_alive = head("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
        let no_length = head("POST / HTTP/1.1\r\nConnection: close\r\n\r\n");

        assert_eq!(buffer_target(&close, close.head_len, 1024), Some(close.head_len + 10));
        assert_eq!(buffer_target(&close, close.head_len + 10, 1024), None);
        assert_eq!(buffer_target(&keep_alive, keep_alive.head_len, 1024), None);
        assert_eq!(buffer_target(&no_length, no_length.head_len, 1024), None);
    }

    #[test]
    fn huge_declared_length_is_not_held() {
        let huge = head(&format!(
            "POST / HTTP/1.1\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
            u64::MAX
        ));
        assert_eq!(huge.content_length, Some(u64::MAX));
        assert_eq!(buffer_target(&huge, huge.head_len, usize::MAX), None);

        let over_cap = head("POST / HTTP/1.1\r\nConnection: close\r\nContent-Length: 2048\r\n\r\n");
        assert_eq!(buffer_target(&over_cap, over_cap.head_len, 1024), None);
    }

    #[tokio::test]
    async fn dropped_connection_still_releases_its_socket() {
        let gw = Gateway::new(ServerConfig::default());
        let (tx, _commands) = mpsc::unbounded_channel();
        let socket_id = gw.sockets.register(tx).await;
        gw.sockets.bind_host(&socket_id, "alice.example", 1).await;
        let (deliveries_tx, mut deliveries) = mpsc::unbounded_channel();
        gw.broker
            .subscribe(1, topic::web_filter("alice.example"), deliveries_tx)
            .await;

        let conn = Connection {
            gw: gw.clone(),
            socket_id: socket_id.clone(),
            remote: "127.0.0.1:9".parse().unwrap(),
            hostname: Some("alice.example".into()),
            state: State::Forwarding,
            released: false,
        };
        drop(conn);

        let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.topic, topic::web_close("alice.example", &socket_id));
        assert_eq!(delivery.payload, CLOSE_PAYLOAD);
        assert!(!gw.sockets.contains(&socket_id).await);
    }
}
