//! Server-side leader announcement.
//!
//! A replica that knows it is not authoritative for a service — but knows
//! who is — answers with a redirect-only response instead of executing the
//! call: no payload, no error flag, just the leader header. The caller's
//! leader-routing filter treats that as a routing signal and retries once
//! against the announced endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::filter::{Filter, Next};

/// Shared table of known leaders per interface.
///
/// Owned by the node's control logic (election, configuration, whatever
/// decides authority); read by [`RedirectFilter`] on every call.
#[derive(Debug, Default)]
pub struct LeaderTable {
    leaders: Mutex<HashMap<String, String>>,
}

impl LeaderTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the authoritative endpoint for `interface`.
    pub fn set_leader(&self, interface: impl Into<String>, endpoint: impl Into<String>) {
        self.leaders
            .lock()
            .expect("leader table lock poisoned")
            .insert(interface.into(), endpoint.into());
    }

    /// Forget the leader for `interface` (this node may now serve it).
    pub fn clear_leader(&self, interface: &str) {
        self.leaders
            .lock()
            .expect("leader table lock poisoned")
            .remove(interface);
    }

    /// Current known leader for `interface`, if any.
    pub fn leader_for(&self, interface: &str) -> Option<String> {
        self.leaders
            .lock()
            .expect("leader table lock poisoned")
            .get(interface)
            .cloned()
    }
}

/// Filter that short-circuits calls this node is not authoritative for.
pub struct RedirectFilter {
    local_endpoint: String,
    leaders: Arc<LeaderTable>,
}

impl RedirectFilter {
    /// Build a filter for the node reachable at `local_endpoint`.
    ///
    /// Entries in `leaders` naming `local_endpoint` itself do not redirect.
    pub fn new(local_endpoint: impl Into<String>, leaders: Arc<LeaderTable>) -> Self {
        Self {
            local_endpoint: local_endpoint.into(),
            leaders,
        }
    }
}

#[async_trait]
impl Filter for RedirectFilter {
    async fn handle(&self, envelope: Envelope, next: &Next<'_>) -> Result<Envelope, RpcError> {
        if let Some(leader) = self.leaders.leader_for(&envelope.interface_name) {
            if leader != self.local_endpoint {
                tracing::debug!(
                    interface = %envelope.interface_name,
                    %leader,
                    "redirecting caller to leader"
                );
                return Ok(Envelope::redirect(&envelope, &leader));
            }
        }
        next.run(envelope).await
    }
}
