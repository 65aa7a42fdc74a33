//! Tenant publish path: authorize a topic for its publisher, decode the
//! payload once, and apply it.

use crate::relay::Broker;
use crate::rpc::RpcPeer;
use crate::sockets::SocketRegistry;
use relaygate_core::rpc::RpcFrame;
use relaygate_core::{GateError, GateResult, Topic};
use std::sync::Arc;
use tracing::{debug, warn};

/// A tenant publish, decoded at the router boundary.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Bytes for an external socket.
    ForwardBytes { socket_id: String, bytes: Vec<u8> },
    /// End an external socket.
    CloseSignal { socket_id: String },
    /// An RPC frame for the publisher's gateway peer.
    Rpc(RpcFrame),
    /// Pass through to broker subscribers.
    Deliver { topic: String, payload: Vec<u8> },
}

/// What happened to an accepted publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handled by the gateway itself.
    Consumed,
    /// Fanned out to this many subscribers.
    Delivered(usize),
}

pub struct TopicRouter {
    sockets: Arc<SocketRegistry>,
    broker: Arc<Broker>,
}

impl TopicRouter {
    pub fn new(sockets: Arc<SocketRegistry>, broker: Arc<Broker>) -> Self {
        Self { sockets, broker }
    }

    /// Decide whether `publisher` may publish on `topic`.
    pub async fn authorize(&self, publisher: &str, topic: &Topic) -> GateResult<()> {
        match topic {
            Topic::Web { .. } | Topic::WebClose { .. } => Err(GateError::PermissionDenied(
                "web topics are server-originated".into(),
            )),
            Topic::Reply { socket_id } | Topic::Close { socket_id } => {
                match self.sockets.owner(socket_id).await {
                    Some(owner) if owner == publisher => Ok(()),
                    _ => Err(GateError::PermissionDenied(format!(
                        "socket {socket_id} does not belong to {publisher}"
                    ))),
                }
            }
            Topic::Msg { to, from } => {
                if from != publisher {
                    Err(GateError::PermissionDenied(
                        "must specify own name on 3rd topic segment".into(),
                    ))
                } else if to == publisher {
                    Err(GateError::PermissionDenied("cannot send message to self".into()))
                } else {
                    Ok(())
                }
            }
            Topic::Srpc { hostname } if hostname != publisher => Err(GateError::PermissionDenied(
                format!("cannot rpc to the gateway as {hostname}"),
            )),
            Topic::Srpc { .. } => Ok(()),
            Topic::Malformed { verb } => Err(GateError::PermissionDenied(format!(
                "malformed {verb} topic"
            ))),
            Topic::Other => Ok(()),
        }
    }

    /// Decode an authorized publish.
    pub fn decode(topic: Topic, raw_topic: &str, payload: Vec<u8>) -> GateResult<Inbound> {
        Ok(match topic {
            Topic::Reply { socket_id } => Inbound::ForwardBytes {
                socket_id,
                bytes: payload,
            },
            Topic::Close { socket_id } => Inbound::CloseSignal { socket_id },
            Topic::Srpc { .. } => Inbound::Rpc(RpcFrame::decode(&payload)?),
            _ => Inbound::Deliver {
                topic: raw_topic.to_string(),
                payload,
            },
        })
    }

    /// Apply a decoded publish.
    pub async fn dispatch(&self, inbound: Inbound, peer: &Arc<RpcPeer>) -> PublishOutcome {
        match inbound {
            Inbound::ForwardBytes { socket_id, bytes } => {
                if !self.sockets.write(&socket_id, bytes).await {
                    debug!(socket_id = %socket_id, "reply for closed socket");
                }
                PublishOutcome::Consumed
            }
            Inbound::CloseSignal { socket_id } => {
                self.sockets.end(&socket_id).await;
                PublishOutcome::Consumed
            }
            Inbound::Rpc(frame) => {
                peer.receive(frame).await;
                PublishOutcome::Consumed
            }
            Inbound::Deliver { topic, payload } => {
                PublishOutcome::Delivered(self.broker.publish(&topic, &payload).await)
            }
        }
    }

    /// Authorize, decode and apply one publish from `publisher`.
    ///
    /// A rejected publish has no effect. An `srpc` payload that is not a
    /// valid RPC frame is logged and dropped.
    pub async fn handle_publish(
        &self,
        publisher: &str,
        peer: &Arc<RpcPeer>,
        raw_topic: &str,
        payload: Vec<u8>,
    ) -> GateResult<PublishOutcome> {
        let topic = Topic::parse(raw_topic);
        if let Err(e) = self.authorize(publisher, &topic).await {
            debug!(hostname = %publisher, topic = %raw_topic, error = %e, "publish rejected");
            return Err(e);
        }

        match Self::decode(topic, raw_topic, payload) {
            Ok(inbound) => Ok(self.dispatch(inbound, peer).await),
            Err(e) => {
                warn!(hostname = %publisher, topic = %raw_topic, error = %e, "dropping malformed rpc payload");
                Ok(PublishOutcome::Consumed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::peer::tests::{ChannelTransport, EchoMethods};
    use crate::sockets::SocketCommand;
    use relaygate_core::topic;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        sockets: Arc<SocketRegistry>,
        broker: Arc<Broker>,
        router: TopicRouter,
    }

    fn harness() -> Harness {
        let sockets = Arc::new(SocketRegistry::new());
        let broker = Arc::new(Broker::new());
        let router = TopicRouter::new(sockets.clone(), broker.clone());
        Harness {
            sockets,
            broker,
            router,
        }
    }

    fn peer(hostname: &str) -> (Arc<RpcPeer>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(RpcPeer::new(
            hostname,
            Arc::new(ChannelTransport(tx)),
            Arc::new(EchoMethods),
            Duration::from_secs(5),
        ));
        (peer, rx)
    }

    fn denied(result: GateResult<PublishOutcome>) -> bool {
        matches!(result, Err(GateError::PermissionDenied(_)))
    }

    #[tokio::test]
    async fn msg_requires_own_sender_and_other_recipient() {
        let h = harness();
        let (carol, _) = peer("carol");
        let (alice, _) = peer("alice");

        assert!(denied(
            h.router.handle_publish("carol", &carol, "msg/alice/bob", b"x".to_vec()).await
        ));
        assert!(denied(
            h.router.handle_publish("alice", &alice, "msg/alice/alice", b"x".to_vec()).await
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.broker.subscribe(1, topic::msg_filter("bob"), tx).await;
        assert_eq!(
            h.router
                .handle_publish("alice", &alice, "msg/bob/alice", b"hi".to_vec())
                .await
                .unwrap(),
            PublishOutcome::Delivered(1)
        );
        assert_eq!(rx.recv().await.unwrap().payload, b"hi");
    }

    #[tokio::test]
    async fn web_topics_are_never_publishable() {
        let h = harness();
        let (alice, _) = peer("alice");
        assert!(denied(
            h.router.handle_publish("alice", &alice, "web/alice/s1", vec![]).await
        ));
        assert!(denied(
            h.router.handle_publish("alice", &alice, "web/alice/s1/close", vec![]).await
        ));
    }

    #[tokio::test]
    async fn reply_and_close_require_socket_ownership() {
        let h = harness();
        let (alice, _) = peer("alice");
        let (bob, _) = peer("bob");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket_id = h.sockets.register(tx).await;
        h.sockets.bind_host(&socket_id, "alice", 1).await;

        let reply = format!("reply/x/{socket_id}");
        assert!(denied(
            h.router.handle_publish("bob", &bob, &reply, b"evil".to_vec()).await
        ));
        assert_eq!(
            h.router
                .handle_publish("alice", &alice, &reply, b"HTTP/1.1 200 OK\r\n\r\n".to_vec())
                .await
                .unwrap(),
            PublishOutcome::Consumed
        );
        assert_eq!(
            rx.recv().await,
            Some(SocketCommand::Write(b"HTTP/1.1 200 OK\r\n\r\n".to_vec()))
        );

        let close = format!("close/x/{socket_id}");
        assert!(denied(h.router.handle_publish("bob", &bob, &close, vec![]).await));
        assert!(h.sockets.contains(&socket_id).await);
        h.router
            .handle_publish("alice", &alice, &close, vec![])
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(SocketCommand::End));
        assert!(!h.sockets.contains(&socket_id).await);

        // unknown socket ids are rejected too
        assert!(denied(
            h.router.handle_publish("alice", &alice, "reply/x/ffff", vec![]).await
        ));
    }

    #[tokio::test]
    async fn srpc_feeds_the_publishers_peer() {
        let h = harness();
        let (alice, mut out) = peer("alice");

        assert!(denied(
            h.router
                .handle_publish("bob", &alice, "srpc/alice", b"{}".to_vec())
                .await
        ));

        let call = br#"{"id":1,"method":"echo","params":[42]}"#.to_vec();
        assert_eq!(
            h.router
                .handle_publish("alice", &alice, "msg/alice/srpc", call)
                .await
                .unwrap(),
            PublishOutcome::Consumed
        );
        let reply = RpcFrame::decode(&out.recv().await.unwrap()).unwrap();
        assert!(matches!(reply, RpcFrame::Result { result, .. } if result == 42));

        // malformed payloads are dropped, not fatal
        assert_eq!(
            h.router
                .handle_publish("alice", &alice, "srpc/alice", b"{oops".to_vec())
                .await
                .unwrap(),
            PublishOutcome::Consumed
        );
    }

    #[tokio::test]
    async fn malformed_and_unknown_topics() {
        let h = harness();
        let (alice, _) = peer("alice");
        assert!(denied(
            h.router.handle_publish("alice", &alice, "reply/x", vec![]).await
        ));
        assert_eq!(
            h.router
                .handle_publish("alice", &alice, "status/alice", b"up".to_vec())
                .await
                .unwrap(),
            PublishOutcome::Delivered(0)
        );
    }
}
