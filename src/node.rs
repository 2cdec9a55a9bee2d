//! Node facade: one process's membership in the mesh.
//!
//! A [`MeshNode`] bundles the pieces every participant needs: a bound RPC
//! server for its registered services, a directory client (in-process when
//! this node hosts the directory, over the wire otherwise), and an
//! [`RpcClient`] for outbound calls. Starting a node binds the listener,
//! then advertises the node's services to the directory.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::{ClientConfig, ConnectionManager, RpcClient, ServiceProxy};
use crate::directory::{
    directory_service, Directory, DirectoryClient, LocalDirectory, NodeInfo, RemoteDirectory,
};
use crate::error::RpcError;
use crate::server::{RpcServer, ServiceRegistry};

/// Configuration for one mesh node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable identity used as the directory upsert key.
    pub node_id: String,

    /// Address to bind the RPC listener to. Port 0 picks a free port.
    pub listen_addr: String,

    /// Endpoint advertised to the directory; defaults to the bound address.
    ///
    /// Set this when the node is reachable at a different address than it
    /// binds, as behind NAT or in a container.
    pub advertised_addr: Option<String>,

    /// Endpoint of the directory service.
    ///
    /// `None` makes this node host the directory itself and register the
    /// directory service alongside its own.
    pub directory_addr: Option<String>,

    /// Outbound call configuration.
    pub client: ClientConfig,
}

impl NodeConfig {
    /// Configuration with defaults: ephemeral port, self-hosted directory.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            listen_addr: "127.0.0.1:0".to_string(),
            advertised_addr: None,
            directory_addr: None,
            client: ClientConfig::default(),
        }
    }

    /// Bind the listener to `addr`.
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Use the directory hosted at `addr` instead of self-hosting one.
    pub fn directory(mut self, addr: impl Into<String>) -> Self {
        self.directory_addr = Some(addr.into());
        self
    }
}

/// A running mesh participant.
pub struct MeshNode {
    node_id: String,
    advertised_addr: String,
    server: RpcServer,
    client: RpcClient,
    directory: Arc<dyn DirectoryClient>,
}

impl MeshNode {
    /// Bind, advertise, and join the mesh with the given services.
    pub async fn start(config: NodeConfig, mut registry: ServiceRegistry) -> Result<Self, RpcError> {
        let transport = Arc::new(ConnectionManager::new(config.client.clone()));

        let (directory, directory_endpoint): (Arc<dyn DirectoryClient>, Option<String>) =
            match &config.directory_addr {
                Some(addr) => (
                    Arc::new(RemoteDirectory::new(addr.clone(), transport.clone())),
                    Some(addr.clone()),
                ),
                None => {
                    let hosted = Arc::new(Directory::new());
                    registry.register(directory_service(hosted.clone()));
                    (Arc::new(LocalDirectory::new(hosted)), None)
                }
            };

        let services = registry.service_names();
        let server = RpcServer::bind(&config.listen_addr, Arc::new(registry)).await?;
        let advertised_addr = config
            .advertised_addr
            .clone()
            .unwrap_or_else(|| server.local_addr().to_string());

        directory
            .register(NodeInfo {
                id: config.node_id.clone(),
                address: advertised_addr.clone(),
                services,
            })
            .await?;

        let client = RpcClient::with_transport(transport, directory.clone(), directory_endpoint);

        tracing::info!(
            node_id = %config.node_id,
            %advertised_addr,
            "node: joined mesh"
        );
        Ok(Self {
            node_id: config.node_id,
            advertised_addr,
            server,
            client,
            directory,
        })
    }

    /// This node's stable identity.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The address this node advertises to the directory.
    pub fn advertised_addr(&self) -> &str {
        &self.advertised_addr
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// The outbound call client.
    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// A call proxy bound to `interface`.
    pub fn proxy(&self, interface: impl Into<String>) -> ServiceProxy {
        self.client.proxy(interface)
    }

    /// The directory client this node advertises through.
    pub fn directory(&self) -> &Arc<dyn DirectoryClient> {
        &self.directory
    }

    /// Stop the listener. In-flight calls on open connections finish.
    ///
    /// The node stays in the directory; entries are never expired, so a
    /// departing node is only superseded when its id re-registers.
    pub async fn shutdown(self) {
        self.server.shutdown().await;
    }
}
