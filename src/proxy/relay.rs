// Connection relays - transparent bidirectional forwarding

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::endpoint::IoStream;

const RELAY_BUF_SIZE: usize = 4096;
/// Tail bytes kept per direction for crash records.
const CAPTURE_LIMIT: usize = 4096;

/// Bounded tail of the bytes most recently relayed in each direction,
/// harvested into crash records when the target faults mid-exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficCapture {
    pub to_upstream: Vec<u8>,
    pub to_downstream: Vec<u8>,
}

impl TrafficCapture {
    fn push_to_upstream(&mut self, bytes: &[u8]) {
        push_tail(&mut self.to_upstream, bytes);
    }

    fn push_to_downstream(&mut self, bytes: &[u8]) {
        push_tail(&mut self.to_downstream, bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.to_upstream.is_empty() && self.to_downstream.is_empty()
    }
}

fn push_tail(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
    if buf.len() > CAPTURE_LIMIT {
        let excess = buf.len() - CAPTURE_LIMIT;
        buf.drain(..excess);
    }
}

/// One bidirectional forwarding session bridging a single downstream
/// connection to a single upstream connection. Runs as a spawned task
/// until either side closes, errors, or the coordinator force-stops it.
pub struct ConnectionRelay {
    peer: String,
    cancel: CancellationToken,
    capture: Arc<Mutex<TrafficCapture>>,
    handle: JoinHandle<()>,
}

impl ConnectionRelay {
    pub fn start(
        peer: String,
        downstream: IoStream,
        upstream: IoStream,
        cancel: CancellationToken,
    ) -> Self {
        let capture = Arc::new(Mutex::new(TrafficCapture::default()));
        let handle = tokio::spawn(run_relay(
            peer.clone(),
            downstream,
            upstream,
            cancel.clone(),
            Arc::clone(&capture),
        ));
        Self {
            peer,
            cancel,
            capture,
            handle,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Ask the relay task to stop; used during crash handling so a live
    /// connection cannot block the restart.
    pub fn force_stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the relay task to finish and take its traffic capture.
    pub async fn join(self) -> TrafficCapture {
        let _ = self.handle.await;
        self.capture.lock().await.clone()
    }
}

async fn run_relay(
    peer: String,
    downstream: IoStream,
    upstream: IoStream,
    cancel: CancellationToken,
    capture: Arc<Mutex<TrafficCapture>>,
) {
    let (mut down_rd, mut down_wr) = tokio::io::split(downstream);
    let (mut up_rd, mut up_wr) = tokio::io::split(upstream);
    let mut down_buf = [0u8; RELAY_BUF_SIZE];
    let mut up_buf = [0u8; RELAY_BUF_SIZE];

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("relay {} force-stopped", peer);
                break;
            }
            res = down_rd.read(&mut down_buf) => match res {
                Ok(0) => {
                    debug!("relay {}: downstream closed", peer);
                    break;
                }
                Ok(n) => {
                    capture.lock().await.push_to_upstream(&down_buf[..n]);
                    if let Err(e) = up_wr.write_all(&down_buf[..n]).await {
                        warn!("relay {}: upstream write error: {}", peer, e);
                        break;
                    }
                }
                Err(e) => {
                    warn!("relay {}: downstream read error: {}", peer, e);
                    break;
                }
            },
            res = up_rd.read(&mut up_buf) => match res {
                Ok(0) => {
                    debug!("relay {}: upstream closed", peer);
                    break;
                }
                Ok(n) => {
                    capture.lock().await.push_to_downstream(&up_buf[..n]);
                    if let Err(e) = down_wr.write_all(&up_buf[..n]).await {
                        warn!("relay {}: downstream write error: {}", peer, e);
                        break;
                    }
                }
                Err(e) => {
                    warn!("relay {}: upstream read error: {}", peer, e);
                    break;
                }
            },
        }
    }

    // Propagate the close to both sides before releasing them.
    let _ = down_wr.shutdown().await;
    let _ = up_wr.shutdown().await;
}

/// Datagram counterpart of `ConnectionRelay`. There is no accept step for
/// datagram transports, so one pump bridges the bound downstream socket to
/// the connected upstream socket, replying to the most recent peer.
pub struct DatagramRelay {
    downstream: UdpSocket,
    upstream: UdpSocket,
    peer: Option<std::net::SocketAddr>,
    capture: TrafficCapture,
}

impl DatagramRelay {
    pub fn new(downstream: UdpSocket, upstream: UdpSocket) -> Self {
        Self {
            downstream,
            upstream,
            peer: None,
            capture: TrafficCapture::default(),
        }
    }

    /// Forward datagrams in either direction for up to `timeout`, then
    /// yield. Returns how many datagrams moved.
    ///
    /// Socket errors are connection-scoped, not fatal: a crashed target
    /// surfaces here as ECONNREFUSED before the monitor sees the fault,
    /// so an error just ends the tick early and the sockets stay usable.
    pub async fn pump(&mut self, timeout: Duration) -> usize {
        let mut down_buf = [0u8; RELAY_BUF_SIZE];
        let mut up_buf = [0u8; RELAY_BUF_SIZE];
        let mut moved = 0;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return moved,
                res = self.downstream.recv_from(&mut down_buf) => match res {
                    Ok((n, peer)) => {
                        self.peer = Some(peer);
                        self.capture.push_to_upstream(&down_buf[..n]);
                        match self.upstream.send(&down_buf[..n]).await {
                            Ok(_) => moved += 1,
                            Err(e) => {
                                warn!("datagram upstream send failed: {}", e);
                                return moved;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("datagram downstream receive failed: {}", e);
                        return moved;
                    }
                },
                res = self.upstream.recv(&mut up_buf) => match res {
                    Ok(n) => {
                        self.capture.push_to_downstream(&up_buf[..n]);
                        match self.peer {
                            Some(peer) => {
                                match self.downstream.send_to(&up_buf[..n], peer).await {
                                    Ok(_) => moved += 1,
                                    Err(e) => {
                                        warn!("datagram downstream send failed: {}", e);
                                        return moved;
                                    }
                                }
                            }
                            None => debug!("dropping upstream datagram with no downstream peer"),
                        }
                    }
                    Err(e) => {
                        warn!("datagram upstream receive failed: {}", e);
                        return moved;
                    }
                },
            }
        }
    }

    /// Local address of the bound downstream socket.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.downstream.local_addr().ok()
    }

    /// Take the captured tails, leaving the capture empty so the next
    /// crash record only carries traffic seen after this harvest.
    pub fn take_capture(&mut self) -> TrafficCapture {
        std::mem::take(&mut self.capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_capture_keeps_bounded_tail() {
        let mut capture = TrafficCapture::default();
        capture.push_to_upstream(&[1u8; CAPTURE_LIMIT]);
        capture.push_to_upstream(&[2u8; 16]);
        assert_eq!(capture.to_upstream.len(), CAPTURE_LIMIT);
        assert_eq!(&capture.to_upstream[CAPTURE_LIMIT - 16..], &[2u8; 16]);
        assert_eq!(&capture.to_upstream[..4], &[1u8; 4]);
    }

    #[tokio::test]
    async fn test_relay_forwards_bytes_both_ways() {
        let (mut down_local, down_remote) = duplex(64);
        let (mut up_local, up_remote) = duplex(64);
        let relay = ConnectionRelay::start(
            "test".to_string(),
            Box::new(down_remote),
            Box::new(up_remote),
            CancellationToken::new(),
        );

        down_local.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        up_local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        up_local.write_all(b"pong").await.unwrap();
        down_local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing the downstream side ends the relay.
        drop(down_local);
        let capture = relay.join().await;
        assert_eq!(capture.to_upstream, b"ping");
        assert_eq!(capture.to_downstream, b"pong");
    }

    #[tokio::test]
    async fn test_relay_force_stop() {
        let (_down_local, down_remote) = duplex(64);
        let (_up_local, up_remote) = duplex(64);
        let relay = ConnectionRelay::start(
            "test".to_string(),
            Box::new(down_remote),
            Box::new(up_remote),
            CancellationToken::new(),
        );

        relay.force_stop();
        let join = tokio::time::timeout(Duration::from_secs(1), relay.join()).await;
        assert!(join.is_ok(), "force-stopped relay did not terminate");
    }

    #[tokio::test]
    async fn test_datagram_relay_round_trip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            loop {
                let Ok((n, peer)) = echo.recv_from(&mut buf).await else {
                    break;
                };
                let _ = echo.send_to(&buf[..n], peer).await;
            }
        });

        let downstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = downstream.local_addr().unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        upstream.connect(echo_addr).await.unwrap();
        let mut relay = DatagramRelay::new(downstream, upstream);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"datagram", proxy_addr).await.unwrap();

        // One pump forwards the request and the echoed reply.
        let mut moved = 0;
        for _ in 0..10 {
            moved += relay.pump(Duration::from_millis(100)).await;
            if moved >= 2 {
                break;
            }
        }
        let mut buf = [0u8; 128];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");

        // Harvesting drains the capture: a second crash record must not
        // repeat the previous payload tail.
        assert_eq!(relay.take_capture().to_upstream, b"datagram");
        assert!(relay.take_capture().is_empty());
    }

    #[tokio::test]
    async fn test_datagram_pump_survives_refused_upstream() {
        let unused = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unused.local_addr().unwrap();
        drop(unused);

        let downstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = downstream.local_addr().unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        upstream.connect(dead_addr).await.unwrap();
        let mut relay = DatagramRelay::new(downstream, upstream);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"fuzz", proxy_addr).await.unwrap();

        // The refused upstream ends ticks early but never poisons the
        // relay; later pumps still run to their deadline.
        for _ in 0..3 {
            relay.pump(Duration::from_millis(50)).await;
        }
        assert_eq!(relay.take_capture().to_upstream, b"fuzz");
    }
}
