// Proxy server - timed accept loop over a bounded pool of relays

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::endpoint::{
    bind_datagram, bind_stream, connect_stream, Endpoint, Listener, Transport,
};
use super::relay::{ConnectionRelay, DatagramRelay, TrafficCapture};

/// How often the at-capacity path re-checks for a freed relay slot.
const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("upstream connect to {endpoint} failed: {source}")]
    UpstreamConnect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
}

/// What one proxy tick accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// A new downstream connection was accepted and relayed.
    Accepted,
    /// One or more finished relays were reaped.
    RelayClosed,
    /// Datagrams were forwarded.
    Forwarded(usize),
    /// The timeout expired with nothing to do.
    Idle,
}

enum Pump {
    Stream(Listener),
    Datagram(DatagramRelay),
}

/// Owns the listening endpoint and the bounded pool of concurrent relays.
/// `serve_tick` always returns within the configured timeout so the
/// session coordinator can interleave process-fault checks with traffic.
pub struct ProxyServer {
    pump: Pump,
    upstream: Endpoint,
    limit: usize,
    relays: Vec<ConnectionRelay>,
    cancel: CancellationToken,
}

impl ProxyServer {
    /// Bind the downstream endpoint and prepare the upstream connector.
    pub async fn bind(
        downstream: &Endpoint,
        upstream: Endpoint,
        limit: usize,
    ) -> Result<Self, ProxyError> {
        let bind_err = |source| ProxyError::Bind {
            endpoint: downstream.to_string(),
            source,
        };
        let pump = match downstream.transport {
            Transport::Stream => Pump::Stream(bind_stream(downstream).await.map_err(bind_err)?),
            Transport::Datagram => {
                let down = bind_datagram(downstream).await.map_err(bind_err)?;
                let up = super::endpoint::connect_datagram(&upstream)
                    .await
                    .map_err(|source| ProxyError::UpstreamConnect {
                        endpoint: upstream.to_string(),
                        source,
                    })?;
                Pump::Datagram(DatagramRelay::new(down, up))
            }
        };
        info!("proxy bound on {} -> {}", downstream, upstream);
        Ok(Self {
            pump,
            upstream,
            limit: limit.max(1),
            relays: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn active_relays(&self) -> usize {
        self.relays.len()
    }

    /// Local inet address when bound to an ephemeral port.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.pump {
            Pump::Stream(listener) => listener.local_addr(),
            Pump::Datagram(relay) => relay.local_addr(),
        }
    }

    /// Perform one unit of proxy work, or give control back after
    /// `tick_timeout` so the caller can poll the process monitor.
    pub async fn serve_tick(&mut self, tick_timeout: Duration) -> Result<ServeOutcome, ProxyError> {
        match &mut self.pump {
            Pump::Datagram(relay) => {
                let moved = relay.pump(tick_timeout).await;
                if moved == 0 {
                    Ok(ServeOutcome::Idle)
                } else {
                    Ok(ServeOutcome::Forwarded(moved))
                }
            }
            Pump::Stream(_) => self.serve_stream_tick(tick_timeout).await,
        }
    }

    async fn serve_stream_tick(
        &mut self,
        tick_timeout: Duration,
    ) -> Result<ServeOutcome, ProxyError> {
        if self.reap_finished().await > 0 {
            return Ok(ServeOutcome::RelayClosed);
        }

        // At capacity: do not poll accept at all, the OS backlog holds
        // newcomers until a slot frees.
        if self.relays.len() >= self.limit {
            let deadline = Instant::now() + tick_timeout;
            while Instant::now() < deadline {
                sleep(SLOT_POLL_INTERVAL.min(deadline - Instant::now())).await;
                if self.reap_finished().await > 0 {
                    return Ok(ServeOutcome::RelayClosed);
                }
            }
            return Ok(ServeOutcome::Idle);
        }

        let Pump::Stream(listener) = &self.pump else {
            unreachable!("stream tick on datagram pump");
        };
        let (downstream, peer) = match timeout(tick_timeout, listener.accept()).await {
            Err(_) => return Ok(ServeOutcome::Idle),
            Ok(Err(e)) => return Err(ProxyError::Accept(e)),
            Ok(Ok(accepted)) => accepted,
        };

        // Upstream connect failure closes the fresh downstream connection
        // and is reported without killing the server.
        let upstream = match connect_stream(&self.upstream).await {
            Ok(stream) => stream,
            Err(source) => {
                drop(downstream);
                return Err(ProxyError::UpstreamConnect {
                    endpoint: self.upstream.to_string(),
                    source,
                });
            }
        };

        info!("relaying {} -> {}", peer, self.upstream);
        self.relays.push(ConnectionRelay::start(
            peer,
            downstream,
            upstream,
            self.cancel.child_token(),
        ));
        Ok(ServeOutcome::Accepted)
    }

    /// Force-stop every active relay and collect their traffic captures
    /// for crash persistence. No new relay can start until the caller
    /// resumes calling `serve_tick`.
    pub async fn halt_relays(&mut self) -> Vec<TrafficCapture> {
        if let Pump::Datagram(relay) = &mut self.pump {
            return vec![relay.take_capture()];
        }
        for relay in &self.relays {
            debug!("halting relay {}", relay.peer());
            relay.force_stop();
        }
        let joins = self.relays.drain(..).map(ConnectionRelay::join);
        futures::future::join_all(joins).await
    }

    /// Close the listening endpoint and force-close all relays.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        let _ = self.halt_relays().await;
        info!("proxy server shut down");
    }

    async fn reap_finished(&mut self) -> usize {
        let before = self.relays.len();
        let mut live = Vec::with_capacity(before);
        for relay in self.relays.drain(..) {
            if relay.is_finished() {
                debug!("relay {} finished", relay.peer());
                let _ = relay.join().await;
            } else {
                live.push(relay);
            }
        }
        self.relays = live;
        before - self.relays.len()
    }
}
