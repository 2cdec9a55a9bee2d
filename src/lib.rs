//! Peer-to-peer RPC mesh with self-describing envelopes and composable
//! call pipelines.
//!
//! Every node is simultaneously a server and a client. A call travels as an
//! [`Envelope`]: correlation id, interface and method names, serialized
//! payload, error flag, and a header map used as an out-of-band control
//! channel. Envelopes cross the wire as length-prefixed binary frames.
//!
//! Both directions of a call pass through an onion of [`Filter`]s around a
//! [`Terminal`](filter::Terminal):
//!
//! ```text
//! caller ──► DiscoveryFilter ──► LeaderRoutingFilter ──► ConnectionManager
//!                                                              │ (wire)
//! callee ◄── reply envelope ◄── method handler ◄── server pipeline
//! ```
//!
//! Discovery resolves interface names through the [`directory`] service,
//! itself an ordinary service in the mesh. Leader routing follows server
//! redirect announcements so callers converge on the authoritative replica
//! without any central router.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use conduit::node::{MeshNode, NodeConfig};
//! use conduit::server::{HandlerFn, ServiceBuilder, ServiceRegistry};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), conduit::error::RpcError> {
//! let mut registry = ServiceRegistry::new();
//! registry.register(ServiceBuilder::new("Greeter").method(
//!     "greet",
//!     Arc::new(HandlerFn::new(|args| {
//!         Box::pin(async move {
//!             let name: String = conduit::codec::decode_arg(&args, 0)?;
//!             Ok(json!(format!("hello, {name}")))
//!         })
//!     })),
//! ));
//!
//! let node = MeshNode::start(NodeConfig::new("n1"), registry).await?;
//! let greeting: String = node.proxy("Greeter").call("greet", &[json!("world")]).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod client;
pub mod codec;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod node;
pub mod server;
pub mod wire;

pub use client::{ClientConfig, RpcClient, ServiceProxy};
pub use directory::{Directory, DirectoryClient, NodeInfo};
pub use envelope::Envelope;
pub use error::{RpcError, WireError};
pub use filter::{Filter, Next, Terminal};
pub use node::{MeshNode, NodeConfig};
pub use server::{RpcServer, ServiceBuilder, ServiceRegistry};
