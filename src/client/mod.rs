//! Client side of the mesh: connections, discovery, leader routing, proxies.

pub mod connection;
pub mod discovery;
pub mod leader;
pub mod proxy;

pub use connection::{ClientConfig, ConnectionManager};
pub use discovery::DiscoveryFilter;
pub use leader::LeaderRoutingFilter;
pub use proxy::{RpcClient, ServiceProxy};
