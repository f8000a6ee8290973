//! Wire formats for the graph-node protocol.
//!
//! Everything here is schema-agnostic plumbing:
//!
//! - [`header`]: the `key=value` connection header exchanged once per peer
//!   connection (topic or service) before payload frames flow.
//! - [`frame`]: `u32 LE` length-prefixed frames as a `tokio_util` codec.
//! - [`service`]: request frames and status-byte replies of service calls.
//! - [`xmlrpc`]: values, calls and responses of the registry/slave RPC APIs.
//! - [`msg`]: the [`RosMessage`] serialization boundary plus the few
//!   messages the node itself needs (`Header`, `Clock`, `String`).
//! - [`actionlib`]: status and cancel messages of the action protocol.

pub mod actionlib;
pub mod frame;
pub mod header;
pub mod msg;
pub mod service;
pub mod xmlrpc;

pub use frame::{encode_frame, FrameCodec};
pub use header::ConnectionHeader;
pub use msg::{MessageReader, MessageWriter, RosMessage, RosService, Time};
pub use service::{ServiceClientCodec, ServiceReply, ServiceServerCodec};
pub use xmlrpc::{MethodCall, MethodResponse, Value};

/// Transport protocol name negotiated through `requestTopic`.
pub const TCPROS: &str = "TCPROS";
