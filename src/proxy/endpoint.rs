// Endpoint descriptors - proto:host:port / proto:uds:path grammar

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixListener, UnixStream};
use tracing::debug;

/// Anything a relay can forward over. Boxing keeps TCP and unix-domain
/// streams uniform past the accept/connect boundary.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type IoStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddr {
    Inet { host: String, port: u16 },
    Unix(PathBuf),
}

/// One side of the proxy: where to bind for downstream traffic or where to
/// connect for the upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub transport: Transport,
    pub addr: EndpointAddr,
}

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("invalid endpoint '{0}': expected proto:host:port or proto:uds:path")]
    Invalid(String),
    #[error("unknown protocol '{0}': expected tcp or udp")]
    UnknownProtocol(String),
    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, remaining) = s
            .split_once(':')
            .ok_or_else(|| EndpointError::Invalid(s.to_string()))?;
        let transport = match proto.to_ascii_lowercase().as_str() {
            "tcp" => Transport::Stream,
            "udp" => Transport::Datagram,
            other => return Err(EndpointError::UnknownProtocol(other.to_string())),
        };
        // The uds marker is checked before the host:port split so socket
        // paths may contain colons.
        let uds_path = remaining
            .split_once(':')
            .filter(|(marker, _)| marker.eq_ignore_ascii_case("uds"))
            .map(|(_, path)| path);
        let addr = if let Some(path) = uds_path {
            EndpointAddr::Unix(PathBuf::from(path))
        } else {
            let (host, port) = remaining
                .rsplit_once(':')
                .ok_or_else(|| EndpointError::Invalid(s.to_string()))?;
            let port: u16 = port
                .parse()
                .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
            EndpointAddr::Inet {
                host: host.to_string(),
                port,
            }
        };
        Ok(Endpoint { transport, addr })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.transport {
            Transport::Stream => "tcp",
            Transport::Datagram => "udp",
        };
        match &self.addr {
            EndpointAddr::Inet { host, port } => write!(f, "{proto}:{host}:{port}"),
            EndpointAddr::Unix(path) => write!(f, "{proto}:uds:{}", path.display()),
        }
    }
}

/// A bound stream listener for the downstream side.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Accept one downstream connection, returning the stream and a peer
    /// description for logging.
    pub async fn accept(&self) -> io::Result<(IoStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "uds peer".to_string()))
            }
        }
    }

    /// Local address of a TCP listener, mainly for tests binding port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }
}

/// Bind the downstream listening endpoint (stream transports only).
pub async fn bind_stream(endpoint: &Endpoint) -> io::Result<Listener> {
    match &endpoint.addr {
        EndpointAddr::Inet { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port)).await?;
            debug!("listening on {}", endpoint);
            Ok(Listener::Tcp(listener))
        }
        EndpointAddr::Unix(path) => {
            // A previous run may have left the socket file behind.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            debug!("listening on {}", endpoint);
            Ok(Listener::Unix(listener))
        }
    }
}

/// Open a fresh connection to the upstream target (stream transports).
pub async fn connect_stream(endpoint: &Endpoint) -> io::Result<IoStream> {
    match &endpoint.addr {
        EndpointAddr::Inet { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            Ok(Box::new(stream))
        }
        EndpointAddr::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
    }
}

/// Bind the downstream datagram socket.
pub async fn bind_datagram(endpoint: &Endpoint) -> io::Result<UdpSocket> {
    match &endpoint.addr {
        EndpointAddr::Inet { host, port } => UdpSocket::bind((host.as_str(), *port)).await,
        EndpointAddr::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "datagram transport is only supported over inet addresses",
        )),
    }
}

/// Create the upstream datagram socket, connected so plain send/recv work.
pub async fn connect_datagram(endpoint: &Endpoint) -> io::Result<UdpSocket> {
    match &endpoint.addr {
        EndpointAddr::Inet { host, port } => {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect((host.as_str(), *port)).await?;
            Ok(socket)
        }
        EndpointAddr::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "datagram transport is only supported over inet addresses",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_endpoint() {
        let endpoint: Endpoint = "tcp:127.0.0.1:8080".parse().unwrap();
        assert_eq!(endpoint.transport, Transport::Stream);
        assert_eq!(
            endpoint.addr,
            EndpointAddr::Inet {
                host: "127.0.0.1".to_string(),
                port: 8080
            }
        );
        assert_eq!(endpoint.to_string(), "tcp:127.0.0.1:8080");
    }

    #[test]
    fn test_parse_udp_endpoint() {
        let endpoint: Endpoint = "udp:0.0.0.0:9999".parse().unwrap();
        assert_eq!(endpoint.transport, Transport::Datagram);
    }

    #[test]
    fn test_parse_unix_endpoint() {
        let endpoint: Endpoint = "tcp:uds:/tmp/target.sock".parse().unwrap();
        assert_eq!(endpoint.transport, Transport::Stream);
        assert_eq!(
            endpoint.addr,
            EndpointAddr::Unix(PathBuf::from("/tmp/target.sock"))
        );

        // Socket paths may themselves contain colons.
        let endpoint: Endpoint = "tcp:uds:/tmp/run:1/t.sock".parse().unwrap();
        assert_eq!(
            endpoint.addr,
            EndpointAddr::Unix(PathBuf::from("/tmp/run:1/t.sock"))
        );
    }

    #[test]
    fn test_parse_rejects_bad_descriptors() {
        assert!(matches!(
            "tcp:nohost".parse::<Endpoint>(),
            Err(EndpointError::Invalid(_))
        ));
        assert!(matches!(
            "icmp:host:1".parse::<Endpoint>(),
            Err(EndpointError::UnknownProtocol(_))
        ));
        assert!(matches!(
            "tcp:host:notaport".parse::<Endpoint>(),
            Err(EndpointError::InvalidPort(_))
        ));
        assert!("justgarbage".parse::<Endpoint>().is_err());
    }
}
