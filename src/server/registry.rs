//! Service registry: the explicit dispatch table built at startup.
//!
//! Maps `(interface, method)` to a handler plus the filter lists declared at
//! registration time. This replaces runtime reflection — the wire contract
//! is already name-based, so an explicit table loses nothing.
//!
//! The per-call filter list is the concatenation of globally registered
//! filters, service-level filters, then method-level filters, rebuilt per
//! invocation (declared filters may be stateful).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::RpcError;
use crate::filter::Filter;

/// A registered method implementation.
///
/// Receives the positionally decoded argument list and returns the result
/// value to serialize into the reply payload.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Invoke the method with positional arguments.
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, RpcError>;
}

/// Adapter turning an async closure into a [`MethodHandler`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F>
where
    F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync,
{
    /// Wrap a closure returning a boxed future.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> MethodHandler for HandlerFn<F>
where
    F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync,
{
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, RpcError> {
        (self.f)(args).await
    }
}

struct MethodEntry {
    handler: Arc<dyn MethodHandler>,
    filters: Vec<Arc<dyn Filter>>,
}

struct ServiceEntry {
    filters: Vec<Arc<dyn Filter>>,
    methods: HashMap<String, MethodEntry>,
}

/// Builder for one service's dispatch entries.
pub struct ServiceBuilder {
    name: String,
    filters: Vec<Arc<dyn Filter>>,
    methods: HashMap<String, MethodEntry>,
}

impl ServiceBuilder {
    /// Start building a service registered under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
            methods: HashMap::new(),
        }
    }

    /// Attach a service-level filter; runs before any method-level filter.
    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Register a method handler.
    pub fn method(self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) -> Self {
        self.method_with_filters(name, handler, Vec::new())
    }

    /// Register a method handler with method-level filters.
    pub fn method_with_filters(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
        filters: Vec<Arc<dyn Filter>>,
    ) -> Self {
        self.methods
            .insert(name.into(), MethodEntry { handler, filters });
        self
    }
}

/// A method resolved for one inbound call.
pub struct ResolvedCall {
    /// The handler to invoke.
    pub handler: Arc<dyn MethodHandler>,

    /// Per-call filter chain: global, then service-level, then method-level.
    pub filters: Vec<Arc<dyn Filter>>,
}

impl std::fmt::Debug for ResolvedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCall")
            .field("filters", &self.filters.len())
            .finish_non_exhaustive()
    }
}

/// Startup-built table of services reachable on this node.
///
/// Built mutably during startup, then shared read-only behind an `Arc` with
/// every connection worker.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceEntry>,
    global_filters: Vec<Arc<dyn Filter>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a filter that wraps every call on this node.
    pub fn global_filter(&mut self, filter: Arc<dyn Filter>) -> &mut Self {
        self.global_filters.push(filter);
        self
    }

    /// Register a built service, replacing any prior entry under its name.
    pub fn register(&mut self, service: ServiceBuilder) -> &mut Self {
        tracing::debug!(
            interface = %service.name,
            methods = service.methods.len(),
            "registry: registered service"
        );
        self.services.insert(
            service.name,
            ServiceEntry {
                filters: service.filters,
                methods: service.methods,
            },
        );
        self
    }

    /// Names of every registered interface, in sorted order.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve an inbound call, failing closed on unknown names.
    ///
    /// The returned filter list is assembled fresh for this call.
    pub fn resolve(&self, interface: &str, method: &str) -> Result<ResolvedCall, RpcError> {
        let service = self
            .services
            .get(interface)
            .ok_or_else(|| RpcError::InterfaceNotFound(interface.to_string()))?;
        let entry = service
            .methods
            .get(method)
            .ok_or_else(|| RpcError::MethodNotFound {
                interface: interface.to_string(),
                method: method.to_string(),
            })?;

        let mut filters =
            Vec::with_capacity(self.global_filters.len() + service.filters.len() + entry.filters.len());
        filters.extend(self.global_filters.iter().cloned());
        filters.extend(service.filters.iter().cloned());
        filters.extend(entry.filters.iter().cloned());

        Ok(ResolvedCall {
            handler: entry.handler.clone(),
            filters,
        })
    }
}
