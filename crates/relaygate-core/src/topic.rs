//! Topic grammar: the `/`-delimited addresses used for both pub/sub routing
//! and authorization scoping.
//!
//! | topic | meaning |
//! |---|---|
//! | `web/<hostname>/<socketId>` | request bytes from an external socket |
//! | `web/<hostname>/<socketId>/close` | the external socket closed |
//! | `reply/<ignored>/<socketId>` | bytes to write back to an external socket |
//! | `close/<ignored>/<socketId>` | end an external socket |
//! | `msg/<hostname>/srpc` | RPC frames for the gateway peer of `hostname` |
//! | `srpc/<hostname>` | same, tenant-published form |
//! | `msg/<msgTo>/<senderName>` | tenant to tenant message |

/// Segment delimiter.
pub const DELIMITER: char = '/';

pub const VERB_WEB: &str = "web";
pub const VERB_REPLY: &str = "reply";
pub const VERB_CLOSE: &str = "close";
pub const VERB_MSG: &str = "msg";
pub const VERB_SRPC: &str = "srpc";

/// A parsed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Web { hostname: String, socket_id: String },
    WebClose { hostname: String, socket_id: String },
    Reply { socket_id: String },
    Close { socket_id: String },
    Srpc { hostname: String },
    Msg { to: String, from: String },
    /// A known verb whose required segments are missing or empty.
    Malformed { verb: String },
    /// Anything outside the table; passed through untouched.
    Other,
}

impl Topic {
    /// Parse a topic string. Never fails: unknown shapes become [`Topic::Other`].
    pub fn parse(topic: &str) -> Self {
        fn filled(segment: &str) -> bool {
            !segment.is_empty()
        }

        let segments: Vec<&str> = topic.split(DELIMITER).collect();

        match segments.as_slice() {
            [VERB_WEB, host, socket] if filled(host) && filled(socket) => Topic::Web {
                hostname: host.to_string(),
                socket_id: socket.to_string(),
            },
            [VERB_WEB, host, socket, "close"] if filled(host) && filled(socket) => {
                Topic::WebClose {
                    hostname: host.to_string(),
                    socket_id: socket.to_string(),
                }
            }
            [VERB_REPLY, _, socket, ..] if filled(socket) => Topic::Reply {
                socket_id: socket.to_string(),
            },
            [VERB_CLOSE, _, socket, ..] if filled(socket) => Topic::Close {
                socket_id: socket.to_string(),
            },
            [VERB_MSG, host, VERB_SRPC] if filled(host) => Topic::Srpc {
                hostname: host.to_string(),
            },
            [VERB_SRPC, host, ..] if filled(host) => Topic::Srpc {
                hostname: host.to_string(),
            },
            [VERB_MSG, to, from] if filled(to) && filled(from) => Topic::Msg {
                to: to.to_string(),
                from: from.to_string(),
            },
            [verb, ..] if is_reserved_verb(verb) => Topic::Malformed {
                verb: verb.to_string(),
            },
            _ => Topic::Other,
        }
    }
}

fn is_reserved_verb(verb: &str) -> bool {
    matches!(
        verb,
        VERB_WEB | VERB_REPLY | VERB_CLOSE | VERB_MSG | VERB_SRPC
    )
}

/// `web/<hostname>/<socketId>`
pub fn web(hostname: &str, socket_id: &str) -> String {
    format!("{VERB_WEB}/{hostname}/{socket_id}")
}

/// `web/<hostname>/<socketId>/close`
pub fn web_close(hostname: &str, socket_id: &str) -> String {
    format!("{VERB_WEB}/{hostname}/{socket_id}/close")
}

/// `msg/<hostname>/srpc`, where the gateway publishes RPC frames for a tenant.
pub fn srpc_outbound(hostname: &str) -> String {
    format!("{VERB_MSG}/{hostname}/{VERB_SRPC}")
}

/// `web/<hostname>/#`
pub fn web_filter(hostname: &str) -> String {
    format!("{VERB_WEB}/{hostname}/#")
}

/// `msg/<hostname>/#`
pub fn msg_filter(hostname: &str) -> String {
    format!("{VERB_MSG}/{hostname}/#")
}

/// MQTT-style filter match: `+` matches one segment, a trailing `#` matches
/// the rest (including nothing).
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_segs = filter.split(DELIMITER);
    let mut topic_segs = topic.split(DELIMITER);

    loop {
        match (filter_segs.next(), topic_segs.next()) {
            (Some("#"), _) => return filter_segs.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_routing_verbs() {
        assert_eq!(
            Topic::parse("web/a.b/s1"),
            Topic::Web {
                hostname: "a.b".into(),
                socket_id: "s1".into()
            }
        );
        assert_eq!(
            Topic::parse("web/a.b/s1/close"),
            Topic::WebClose {
                hostname: "a.b".into(),
                socket_id: "s1".into()
            }
        );
        assert_eq!(
            Topic::parse("reply/whatever/s1"),
            Topic::Reply {
                socket_id: "s1".into()
            }
        );
        assert_eq!(
            Topic::parse("close/whatever/s1"),
            Topic::Close {
                socket_id: "s1".into()
            }
        );
        assert_eq!(
            Topic::parse("msg/alice/bob"),
            Topic::Msg {
                to: "alice".into(),
                from: "bob".into()
            }
        );
    }

    #[test]
    fn srpc_has_two_spellings() {
        let expected = Topic::Srpc {
            hostname: "alice".into(),
        };
        assert_eq!(Topic::parse("msg/alice/srpc"), expected);
        assert_eq!(Topic::parse("srpc/alice"), expected);
        assert_eq!(Topic::parse("srpc/alice/extra"), expected);
    }

    #[test]
    fn missing_segments_are_malformed() {
        assert!(matches!(Topic::parse("reply/x"), Topic::Malformed { .. }));
        assert!(matches!(Topic::parse("msg//bob"), Topic::Malformed { .. }));
        assert!(matches!(Topic::parse("close/x/"), Topic::Malformed { .. }));
    }

    #[test]
    fn unknown_verbs_pass_through() {
        assert_eq!(Topic::parse("$SYS/broker/uptime"), Topic::Other);
        assert_eq!(Topic::parse("status"), Topic::Other);
    }

    #[test]
    fn builders_round_trip_through_parse() {
        assert!(matches!(Topic::parse(&web("h", "1")), Topic::Web { .. }));
        assert!(matches!(
            Topic::parse(&web_close("h", "1")),
            Topic::WebClose { .. }
        ));
        assert!(matches!(
            Topic::parse(&srpc_outbound("h")),
            Topic::Srpc { .. }
        ));
    }

    #[test]
    fn filter_matching() {
        assert!(matches("web/a.b/#", "web/a.b/s1"));
        assert!(matches("web/a.b/#", "web/a.b/s1/close"));
        assert!(matches("web/a.b/#", "web/a.b"));
        assert!(!matches("web/a.b/#", "web/c.d/s1"));
        assert!(matches("msg/+/srpc", "msg/alice/srpc"));
        assert!(!matches("msg/+/srpc", "msg/alice/bob"));
        assert!(matches("msg/alice/bob", "msg/alice/bob"));
        assert!(!matches("msg/alice", "msg/alice/bob"));
        assert!(!matches("msg/alice/bob/x", "msg/alice/bob"));
    }
}
