//! WebSocket plumbing for tenant sessions.
//!
//! The gateway sniffs a request head before it knows a connection is a
//! tunnel upgrade, so the handshake must see those bytes again: [`Rewind`]
//! replays them ahead of the live stream.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relaygate_core::codec::MAX_FRAME_SIZE;
use relaygate_core::{cbor_encode, GateError, GateResult, ServerFrame};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// A stream that yields `prefix` before reading from `inner`.
pub struct Rewind<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            if self.pos == self.prefix.len() {
                self.prefix = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
pub type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// Helper: send a binary message over a WebSocket.
pub async fn ws_send_binary<S>(ws: &mut WsSink<S>, data: Vec<u8>) -> GateResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(Message::Binary(data.into()))
        .await
        .map_err(|e| GateError::Transport(format!("WS send failed: {e}")))
}

/// Helper: encode and send one session frame.
pub async fn ws_send_frame<S>(ws: &mut WsSink<S>, frame: &ServerFrame) -> GateResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws_send_binary(ws, cbor_encode(frame)?).await
}

/// Helper: receive the next binary message from a WebSocket.
///
/// Returns `None` if the connection is closed. Text and control messages are
/// skipped (tungstenite answers pings itself). Rejects frames over 1 MiB.
pub async fn ws_recv_binary<S>(ws: &mut WsSource<S>) -> GateResult<Option<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                if data.len() > MAX_FRAME_SIZE {
                    return Err(GateError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {})",
                        data.len(),
                        MAX_FRAME_SIZE
                    )));
                }
                return Ok(Some(data.into()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(GateError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
