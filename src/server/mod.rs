//! Server side of the mesh: connection handling, dispatch, redirect.

pub mod handler;
pub mod redirect;
pub mod registry;

pub use handler::RpcServer;
pub use redirect::{LeaderTable, RedirectFilter};
pub use registry::{HandlerFn, MethodHandler, ResolvedCall, ServiceBuilder, ServiceRegistry};
