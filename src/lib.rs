//! # rudpmesh
//!
//! Reliable UDP for real-time applications, plus a small mesh topology that
//! hands out peer slots.
//!
//! ## Features
//!
//! - **Selective acks**: every datagram carries a 16-byte header with the latest
//!   remote sequence and a 32-bit ack bitfield, so one packet acks up to 33 others
//! - **RTT and bandwidth estimates** per link, from the ack stream
//! - **Flow control**: a two-mode (good/bad) send rate picked from the RTT, with a
//!   penalty that grows when conditions flap
//! - **Guaranteed delivery**: opt-in exactly-once, in-order messages, resent when the
//!   carrying packet is reported lost
//! - **Mesh topology**: a mesh assigns node ids and broadcasts peer addresses; nodes
//!   talk to each other directly
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rudpmesh::{Engine, TopologyConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = Engine::new(TopologyConfig::default(), 8)?;
//!     let mesh_addr = engine.host_network("127.0.0.1:30000".parse()?).await?;
//!     engine.join_network("127.0.0.1:0".parse()?, mesh_addr).await?;
//!
//!     loop {
//!         engine.update(0.016).await?;
//!         let node = engine.node_mut();
//!         for peer in 0..node.num_nodes() {
//!             if node.node_just_connected(peer) {
//!                 node.send_guaranteed(peer, b"hello")?;
//!             }
//!             while let Some(message) = node.receive_guaranteed(peer) {
//!                 println!("node {} says {:?}", peer, message);
//!             }
//!         }
//!         tokio::time::sleep(Duration::from_millis(16)).await;
//!     }
//! }
//! ```
//!
//! The building blocks ([`ReliabilitySystem`], [`FlowControl`],
//! [`GuaranteedDeliverySystem`]) have no I/O of their own and can be driven
//! directly by any transport.

pub mod config;
pub mod engine;
pub mod error;
pub mod flow_control;
pub mod guaranteed;
pub mod link;
pub mod mesh;
pub mod node;
pub mod packet_queue;
pub mod processor;
pub mod protocol;
pub mod reliability;
pub mod sequence;
pub mod stats;
pub mod topology;

pub use config::TopologyConfig;
pub use engine::Engine;
pub use error::{ErrorSeverity, RudpError};
pub use flow_control::{FlowControl, FlowMode};
pub use guaranteed::{GuaranteedDeliverySystem, GuaranteedMessage};
pub use link::{Link, NodeId};
pub use mesh::Mesh;
pub use node::{Node, NodeState};
pub use packet_queue::{PacketQueue, PacketRecord};
pub use processor::{PacketParser, PacketProcessor};
pub use protocol::{Channel, ReliabilityHeader, RELIABILITY_HEADER_SIZE};
pub use reliability::ReliabilitySystem;
pub use sequence::more_recent;
pub use stats::{LinkState, LinkStats};
pub use topology::Topology;
