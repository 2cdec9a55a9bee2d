//! Client-side leader routing: follow server redirect announcements.
//!
//! Sits after discovery in the client pipeline. Keeps a per-interface cache
//! of announced leaders; a cached leader overrides whatever destination the
//! discovery filter stamped. When a reply carries a redirect announcement,
//! the cache is updated and the call is retried once against the announced
//! endpoint. Exactly once: if the second reply also redirects, it is
//! returned as-is rather than chased, which bounds routing loops during
//! leadership churn.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::filter::{Filter, Next};

/// Filter that steers calls toward the last-announced leader per interface.
#[derive(Default)]
pub struct LeaderRoutingFilter {
    leaders: Mutex<HashMap<String, String>>,
}

impl LeaderRoutingFilter {
    /// Create a filter with an empty leader cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn cached_leader(&self, interface: &str) -> Option<String> {
        self.leaders
            .lock()
            .expect("leader cache lock poisoned")
            .get(interface)
            .cloned()
    }

    fn remember_leader(&self, interface: &str, endpoint: &str) {
        self.leaders
            .lock()
            .expect("leader cache lock poisoned")
            .insert(interface.to_string(), endpoint.to_string());
    }
}

#[async_trait]
impl Filter for LeaderRoutingFilter {
    async fn handle(&self, mut envelope: Envelope, next: &Next<'_>) -> Result<Envelope, RpcError> {
        if let Some(leader) = self.cached_leader(&envelope.interface_name) {
            envelope.set_target(&leader);
        }

        // Retry template; the send consumes the original.
        let retry = envelope.clone();
        let reply = next.run(envelope).await?;

        let Some(leader) = reply.redirect_target().map(str::to_string) else {
            return Ok(reply);
        };

        tracing::debug!(
            interface = %retry.interface_name,
            %leader,
            "leader routing: redirected, retrying once"
        );
        self.remember_leader(&retry.interface_name, &leader);

        let mut retry = retry;
        retry.set_target(&leader);
        next.run(retry).await
    }
}
