//! Client-side discovery: resolve an interface name to a destination.
//!
//! Sits early in the client pipeline. An envelope whose destination header
//! is already stamped passes through untouched, so explicit addressing
//! always wins over discovery.

use std::sync::Arc;

use async_trait::async_trait;

use crate::directory::{DirectoryClient, DIRECTORY_INTERFACE};
use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::filter::{Filter, Next};

/// Filter that stamps a destination endpoint onto undirected calls.
///
/// Calls to the directory service itself are special-cased: when a static
/// directory endpoint is configured, they go straight there, which breaks
/// the otherwise circular "discover the directory via the directory".
pub struct DiscoveryFilter {
    directory: Arc<dyn DirectoryClient>,
    directory_endpoint: Option<String>,
}

impl DiscoveryFilter {
    /// Build a filter resolving through `directory`.
    ///
    /// `directory_endpoint` is the statically known address of the directory
    /// service, or `None` when the directory is colocated and reachable
    /// through normal discovery.
    pub fn new(directory: Arc<dyn DirectoryClient>, directory_endpoint: Option<String>) -> Self {
        Self {
            directory,
            directory_endpoint,
        }
    }
}

#[async_trait]
impl Filter for DiscoveryFilter {
    async fn handle(&self, mut envelope: Envelope, next: &Next<'_>) -> Result<Envelope, RpcError> {
        if envelope.target().is_some() {
            return next.run(envelope).await;
        }

        if envelope.interface_name == DIRECTORY_INTERFACE {
            if let Some(endpoint) = &self.directory_endpoint {
                envelope.set_target(endpoint);
                return next.run(envelope).await;
            }
        }

        let nodes = self.directory.discover(&envelope.interface_name).await?;
        let node = nodes
            .first()
            .ok_or_else(|| RpcError::NoNodesFound(envelope.interface_name.clone()))?;

        tracing::debug!(
            interface = %envelope.interface_name,
            node_id = %node.id,
            endpoint = %node.address,
            "discovery: resolved destination"
        );
        envelope.set_target(&node.address);
        next.run(envelope).await
    }
}
