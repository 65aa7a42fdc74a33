//! Tenant sessions: the WebSocket a relay client holds open on the control
//! path.
//!
//! Session lifecycle: handshake (replaying sniffed bytes) → rate limit →
//! `Connect` within the connect timeout → authenticate → subscribe, build the
//! RPC peer, evict any previous session and register → pump frames until
//! either side closes or the gateway signals shutdown → clean up.

use crate::relay::{Delivery, TenantHandle};
use crate::rpc::{GatewayMethods, RpcPeer, TopicTransport};
use crate::server::Gateway;
use crate::transport::websocket::{ws_recv_binary, ws_send_frame, Rewind, WsSink, WsSource};
use futures_util::{SinkExt, StreamExt};
use relaygate_core::{cbor_decode, topic, ClientFrame, GateError, GateResult, ServerFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

type TunnelStream = Rewind<TcpStream>;

/// Whether `hostname` can be used as a topic segment.
fn valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= 253
        && !hostname
            .chars()
            .any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace())
}

/// Run a tenant session on a connection whose request head (already read
/// into `sniffed`) asked for an upgrade on the control path.
pub async fn run_tunnel(
    gw: Arc<Gateway>,
    stream: TcpStream,
    sniffed: Vec<u8>,
    remote: SocketAddr,
) -> GateResult<()> {
    let ws = tokio_tungstenite::accept_async(Rewind::new(sniffed, stream))
        .await
        .map_err(|e| GateError::Transport(format!("WS handshake failed: {e}")))?;
    let (mut sink, mut source) = ws.split();
    debug!(remote = %remote, "tunnel handshake complete");

    let allowed = gw.connect_limiter.lock().await.check_and_record(remote.ip());
    if !allowed {
        refuse(&mut sink, "rate limited: too many connect attempts").await;
        return Err(GateError::AuthFailed("rate limited".into()));
    }

    let first = tokio::time::timeout(gw.config.tunnel_connect_timeout, ws_recv_binary(&mut source))
        .await
        .map_err(|_| GateError::Timeout)??;
    let Some(bytes) = first else {
        debug!(remote = %remote, "tunnel closed before connect");
        return Ok(());
    };

    let (hostname, secret) = match cbor_decode::<ClientFrame>(&bytes) {
        Ok(ClientFrame::Connect { hostname, secret }) => (hostname, secret),
        Ok(_) => {
            refuse(&mut sink, "expected connect").await;
            return Err(GateError::InvalidMessage("expected connect as first frame".into()));
        }
        Err(e) => {
            refuse(&mut sink, "malformed connect").await;
            return Err(e);
        }
    };

    if !valid_hostname(&hostname) {
        refuse(&mut sink, "invalid hostname").await;
        return Err(GateError::AuthFailed(format!("invalid hostname {hostname:?}")));
    }
    if !gw.identities.authenticate(&hostname, &secret).await {
        warn!(remote = %remote, hostname = %hostname, "tenant authentication failed");
        refuse(&mut sink, "authentication failed").await;
        return Err(GateError::AuthFailed(hostname));
    }

    // Subscribe, build the peer, then evict-and-register.
    let conn_id = gw.tenants.next_conn_id();
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
    gw.broker
        .subscribe(conn_id, topic::web_filter(&hostname), delivery_tx.clone())
        .await;
    gw.broker
        .subscribe(conn_id, topic::msg_filter(&hostname), delivery_tx)
        .await;

    let peer = Arc::new(RpcPeer::new(
        hostname.clone(),
        Arc::new(TopicTransport::new(gw.broker.clone(), &hostname)),
        Arc::new(GatewayMethods::new(&gw.bridge)),
        gw.config.rpc_timeout,
    ));
    let (handle, shutdown_rx) = TenantHandle::new(hostname.clone(), conn_id, peer.clone());
    if let Some(evicted) = gw.tenants.register(handle).await {
        // The evicted session drains on its own task; it must not see this
        // hostname's traffic meanwhile.
        gw.broker.unsubscribe_all(evicted.conn_id).await;
    }
    info!(remote = %remote, hostname = %hostname, conn_id, "tenant connected");

    let result = match ws_send_frame(&mut sink, &ServerFrame::accepted()).await {
        Ok(()) => {
            let session = Session {
                gw: &gw,
                hostname: &hostname,
                peer: &peer,
            };
            session.run(&mut sink, &mut source, delivery_rx, shutdown_rx).await
        }
        Err(e) => Err(e),
    };

    gw.broker.unsubscribe_all(conn_id).await;
    gw.tenants.unregister(&hostname, conn_id).await;
    gw.sockets.orphan_session(conn_id).await;
    peer.fail_all().await;
    info!(hostname = %hostname, conn_id, "tenant disconnected");

    result
}

async fn refuse(sink: &mut WsSink<TunnelStream>, reason: &str) {
    let _ = ws_send_frame(sink, &ServerFrame::refused(reason)).await;
    let _ = sink.close().await;
}

struct Session<'a> {
    gw: &'a Gateway,
    hostname: &'a str,
    peer: &'a Arc<RpcPeer>,
}

impl Session<'_> {
    async fn run(
        &self,
        sink: &mut WsSink<TunnelStream>,
        source: &mut WsSource<TunnelStream>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) -> GateResult<()> {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(hostname = %self.hostname, "closing tenant session");
                        let _ = sink.close().await;
                        return Ok(());
                    }
                }
                Some(delivery) = deliveries.recv() => {
                    let frame = ServerFrame::Message {
                        topic: delivery.topic,
                        payload: delivery.payload,
                    };
                    ws_send_frame(sink, &frame).await?;
                }
                incoming = ws_recv_binary(source) => {
                    match incoming? {
                        Some(bytes) => self.on_frame(sink, &bytes).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn on_frame(&self, sink: &mut WsSink<TunnelStream>, bytes: &[u8]) -> GateResult<()> {
        let frame = match cbor_decode::<ClientFrame>(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(hostname = %self.hostname, error = %e, "ignoring undecodable frame");
                return Ok(());
            }
        };

        match frame {
            ClientFrame::Publish { topic, payload } => {
                let outcome = self
                    .gw
                    .router
                    .handle_publish(self.hostname, self.peer, &topic, payload)
                    .await;
                if let Err(e) = outcome {
                    let reply = ServerFrame::PublishError {
                        topic,
                        reason: e.to_string(),
                    };
                    ws_send_frame(sink, &reply).await?;
                }
            }
            ClientFrame::Ping { id } => ws_send_frame(sink, &ServerFrame::Pong { id }).await?,
            ClientFrame::Connect { .. } => {
                debug!(hostname = %self.hostname, "ignoring repeated connect");
            }
        }
        Ok(())
    }
}
