//! `rn-node` — client library for joining a publish/subscribe robotics graph.
//!
//! A node registers with a central registry over XML-RPC, serves its own
//! slave API for callbacks, and exchanges messages with peers directly over
//! TCP using length-prefixed frames.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Your node                                                   │
//! │                                                              │
//! │   let node = NodeBuilder::new("talker").start().await?;      │
//! │   let nh = node.handle();                                    │
//! │   let chatter = nh.advertise("chatter", opts).await?;        │
//! │   chatter.publish(&msg)?;                                    │
//! └──────────┬───────────────────────────────────┬───────────────┘
//!            │ XML-RPC                           │ TCP frames
//!    ┌───────▼────────┐                  ┌───────▼────────┐
//!    │ registry       │ publisherUpdate  │ peer nodes     │
//!    │ (master)       ├─────────────────▶│ (slave API +   │
//!    └────────────────┘                  │  data port)    │
//!                                        └────────────────┘
//! ```
//!
//! # Startup
//!
//! 1. Validate the configuration and node name; claim the name in-process
//! 2. Bind the data listener (topics and services share it) and the slave API
//! 3. Probe the registry until it answers (see [`RetryPolicy`])
//! 4. Pick wall or simulated time from `/use_sim_time`
//!
//! Shutdown unregisters everything, closes every connection and releases
//! the name.  It runs when [`Node::shutdown`] is called or when the registry
//! sends `shutdown` to the slave API.

pub mod builder;
pub mod clock;
pub mod master;
pub mod node;
pub mod params;
pub mod reconnect;
pub mod rpc;
pub mod services;
pub mod slave;
pub(crate) mod tcpros;
pub mod testing;
pub mod topics;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::NodeBuilder;
pub use clock::{ClockMode, ClockSource};
pub use master::{RegistrationKind, RegistryClient, SystemState};
pub use node::{Node, NodeHandle};
pub use reconnect::{LogThrottle, RetryPolicy};
pub use rpc::{HttpRpcTransport, RpcTransport};
pub use services::{ServiceClient, ServiceContext, ServiceHandler, ServiceServer};
pub use topics::{Publisher, Subscriber};
pub use types::{
    AdvertiseOptions, ConnectReport, OverflowPolicy, ServiceClientOptions, SubscribeOptions,
};

// Re-export the shared crates so nodes never need to depend on them directly.
pub use rn_domain::{config, names, Error, Result};
pub use rn_protocol::{msg, RosMessage, RosService, Time};
