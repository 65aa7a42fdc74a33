//! relaygate-core: protocol library for the relaygate tunnel gateway.
//!
//! Provides the topic grammar, the incremental HTTP head sniffer, RPC frame
//! and peer-envelope types, tunnel session frames with their CBOR codec,
//! identity secrets, and the abstract RPC transport trait.

pub mod codec;
pub mod error;
pub mod http;
pub mod rpc;
pub mod secret;
pub mod session;
pub mod topic;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode};
pub use error::{GateError, GateResult};
pub use http::{HeadParser, ParseOutcome, RequestHead};
pub use rpc::{PeerEnvelope, PeerMessage, RpcErrorBody, RpcFrame, RpcId};
pub use session::{ClientFrame, ServerFrame};
pub use topic::Topic;
pub use transport::RpcTransport;
