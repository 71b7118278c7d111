pub mod endpoint;
pub mod relay;
pub mod server;

pub use endpoint::{Endpoint, EndpointAddr, EndpointError, Transport};
pub use relay::{ConnectionRelay, DatagramRelay, TrafficCapture};
pub use server::{ProxyError, ProxyServer, ServeOutcome};
