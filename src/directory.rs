//! Directory service: maps service names to the nodes advertising them.
//!
//! The directory is a service like any other — it is registered in a
//! [`ServiceRegistry`](crate::server::ServiceRegistry) and called over the
//! same RPC core — but the discovery filter special-cases its interface name
//! against a statically configured endpoint so that discovering the
//! directory never requires the directory.
//!
//! Registration is an idempotent upsert keyed by node id: re-registering a
//! node replaces every prior entry for that id, so the last write for a
//! given id wins. Entries are never expired; a node that crashes without
//! re-registering stays discoverable until something overwrites it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::connection::ConnectionManager;
use crate::codec::{decode_arg, decode_error_text, decode_value, encode_args};
use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::server::registry::{HandlerFn, ServiceBuilder};

/// Interface name the directory service is registered under.
pub const DIRECTORY_INTERFACE: &str = "Conduit.Directory";

/// Method name for node registration.
pub const REGISTER_METHOD: &str = "register";

/// Method name for service discovery.
pub const DISCOVER_METHOD: &str = "discover";

/// A node's advertisement: identity, reachable endpoint, offered services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable node identity.
    pub id: String,

    /// Base reachable endpoint for this node.
    pub address: String,

    /// Interface names this node offers.
    pub services: Vec<String>,
}

/// In-memory directory registry.
///
/// Holds service name → advertising nodes, keyed internally by node id so
/// re-registration replaces rather than appends. Safe under concurrent
/// registration and discovery from many connection workers.
#[derive(Debug, Default)]
pub struct Directory {
    // Vec keeps registration order stable so "pick the first result" is
    // deterministic for callers.
    services: Mutex<HashMap<String, Vec<NodeInfo>>>,
}

impl Directory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a node.
    ///
    /// The node's previous entries — including services it no longer
    /// advertises — are removed before the new advertisement is fanned out.
    pub fn register(&self, node: NodeInfo) {
        let mut services = self.services.lock().expect("directory lock poisoned");

        for entries in services.values_mut() {
            entries.retain(|existing| existing.id != node.id);
        }
        services.retain(|_, entries| !entries.is_empty());

        for service in &node.services {
            services
                .entry(service.clone())
                .or_default()
                .push(node.clone());
        }

        tracing::info!(
            node_id = %node.id,
            address = %node.address,
            services = ?node.services,
            "directory: registered node"
        );
    }

    /// Current set of nodes advertising `service`; empty when none.
    pub fn discover(&self, service: &str) -> Vec<NodeInfo> {
        self.services
            .lock()
            .expect("directory lock poisoned")
            .get(service)
            .cloned()
            .unwrap_or_default()
    }
}

/// Client seam for reaching a directory, local or remote.
///
/// A node colocated with the directory talks to it in-process; every other
/// node reaches it over the wire through the same RPC core it serves.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Advertise a node to the directory.
    async fn register(&self, node: NodeInfo) -> Result<(), RpcError>;

    /// Ask which nodes advertise `service`.
    async fn discover(&self, service: &str) -> Result<Vec<NodeInfo>, RpcError>;
}

/// In-process directory access for the node hosting it.
pub struct LocalDirectory {
    directory: Arc<Directory>,
}

impl LocalDirectory {
    /// Wrap a shared directory instance.
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl DirectoryClient for LocalDirectory {
    async fn register(&self, node: NodeInfo) -> Result<(), RpcError> {
        self.directory.register(node);
        Ok(())
    }

    async fn discover(&self, service: &str) -> Result<Vec<NodeInfo>, RpcError> {
        Ok(self.directory.discover(service))
    }
}

/// Remote directory access over a statically configured endpoint.
///
/// Sends envelopes straight through the connection manager with the
/// destination pre-stamped, bypassing discovery entirely.
pub struct RemoteDirectory {
    endpoint: String,
    transport: Arc<ConnectionManager>,
}

impl RemoteDirectory {
    /// Build a client for the directory at `endpoint`.
    pub fn new(endpoint: impl Into<String>, transport: Arc<ConnectionManager>) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
        }
    }

    async fn round_trip(&self, method: &str, payload: Vec<u8>) -> Result<Envelope, RpcError> {
        let mut request = Envelope::request(DIRECTORY_INTERFACE, method, payload);
        request.set_target(&self.endpoint);
        let reply = self.transport.send(request).await?;
        if reply.is_error {
            return Err(RpcError::Remote(decode_error_text(&reply.payload)));
        }
        Ok(reply)
    }
}

#[async_trait]
impl DirectoryClient for RemoteDirectory {
    async fn register(&self, node: NodeInfo) -> Result<(), RpcError> {
        let args = encode_args(&[serde_json::to_value(node)?])?;
        self.round_trip(REGISTER_METHOD, args).await?;
        Ok(())
    }

    async fn discover(&self, service: &str) -> Result<Vec<NodeInfo>, RpcError> {
        let args = encode_args(&[serde_json::to_value(service)?])?;
        let reply = self.round_trip(DISCOVER_METHOD, args).await?;
        decode_value(&reply.payload)
    }
}

/// Expose a directory instance as a registrable service.
///
/// Wire contract: `register(NodeInfo) -> null`,
/// `discover(String) -> [NodeInfo]`.
pub fn directory_service(directory: Arc<Directory>) -> ServiceBuilder {
    let register_dir = directory.clone();
    let discover_dir = directory;

    ServiceBuilder::new(DIRECTORY_INTERFACE)
        .method(
            REGISTER_METHOD,
            Arc::new(HandlerFn::new(move |args| {
                let directory = register_dir.clone();
                Box::pin(async move {
                    let node: NodeInfo = decode_arg(&args, 0)?;
                    directory.register(node);
                    Ok(serde_json::Value::Null)
                })
            })),
        )
        .method(
            DISCOVER_METHOD,
            Arc::new(HandlerFn::new(move |args| {
                let directory = discover_dir.clone();
                Box::pin(async move {
                    let service: String = decode_arg(&args, 0)?;
                    let nodes = directory.discover(&service);
                    Ok(serde_json::to_value(nodes)?)
                })
            })),
        )
}
