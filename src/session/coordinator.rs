// Session coordinator - glues monitor events to the proxy lifecycle

use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{FuzzmonError, Result};
use crate::monitor::{Classification, ProcessEvent, ProcessMonitor};
use crate::proxy::{ProxyError, ProxyServer};
use crate::session::crash::CrashStore;

/// What to do with the target after a fault (or an unexpected exit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Stop the session cleanly on the first fault.
    QuitOnFault,
    /// Wait the given delay, then restart the target and keep serving.
    RestartAfter(Duration),
}

/// Orchestrates one `ProcessMonitor` and one `ProxyServer` so neither can
/// leave the other inconsistent across a crash/restart cycle. Single
/// control loop: one proxy tick, then one monitor poll, repeat.
pub struct SessionCoordinator {
    monitor: ProcessMonitor,
    server: ProxyServer,
    store: CrashStore,
    policy: RestartPolicy,
    tick_timeout: Duration,
}

impl SessionCoordinator {
    pub fn new(
        monitor: ProcessMonitor,
        server: ProxyServer,
        store: CrashStore,
        policy: RestartPolicy,
        tick_timeout: Duration,
    ) -> Self {
        Self {
            monitor,
            server,
            store,
            policy,
            tick_timeout,
        }
    }

    /// Drive the session until a quit-on-fault stop, an external stop
    /// signal, or a fatal error. The proxy tick timeout bounds every wait,
    /// so crash detection is never starved by network idleness.
    ///
    /// Teardown runs in dependency order on every outcome, fatal errors
    /// included.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.drive().await;
        self.shutdown().await;
        result
    }

    async fn drive(&mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt()).map_err(FuzzmonError::Io)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(FuzzmonError::Io)?;
        info!(
            "session '{}' started, monitoring pid {}",
            self.store.session(),
            self.monitor.pid()
        );

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("interrupt received, ending session");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("terminate received, ending session");
                    break;
                }
                tick = self.server.serve_tick(self.tick_timeout) => {
                    if let Err(e) = tick {
                        match e {
                            // Recovered locally: the downstream was closed,
                            // the server keeps running.
                            ProxyError::UpstreamConnect { .. } => warn!("{}", e),
                            other => return Err(other.into()),
                        }
                    }
                }
            }

            // Terminal-event check happens every tick, traffic or not, and
            // always before any further relay can be accepted.
            let event = self.monitor.poll_terminal()?;
            if let Some(event) = event {
                let keep_going = match event.classification {
                    Classification::Fault => self.handle_fault(&event).await?,
                    Classification::Benign => self.handle_unexpected_exit(&event).await?,
                };
                if !keep_going {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Fault path: halt relays, persist a crash record, apply the policy.
    /// Returns false when the session should end.
    async fn handle_fault(&mut self, event: &ProcessEvent) -> Result<bool> {
        warn!("fault detected: {:?}", event.event);
        let exchanges = self.server.halt_relays().await;
        let record = self.store.next_record(event, exchanges);
        match self.store.persist(&record) {
            Ok(path) => info!("crash record {} written to {}", record.sequence, path.display()),
            // Losing a record is preferable to losing the session.
            Err(e) => warn!("failed to persist crash record {}: {}", record.sequence, e),
        }
        self.apply_policy().await
    }

    /// The target went away on its own without faulting. Same policy as a
    /// fault, but logged as a plain exit and no crash record is written.
    async fn handle_unexpected_exit(&mut self, event: &ProcessEvent) -> Result<bool> {
        info!("target terminated on its own: {:?}", event.event);
        let _ = self.server.halt_relays().await;
        self.apply_policy().await
    }

    async fn apply_policy(&mut self) -> Result<bool> {
        match self.policy {
            RestartPolicy::QuitOnFault => {
                info!("quit-on-fault policy: ending session");
                Ok(false)
            }
            RestartPolicy::RestartAfter(delay) => {
                if !delay.is_zero() {
                    debug!("waiting {:?} before restart", delay);
                    sleep(delay).await;
                }
                let pid = self.monitor.restart().map_err(FuzzmonError::Monitor)?;
                info!("target restarted as pid {}", pid);
                Ok(true)
            }
        }
    }

    /// Tear the session down in dependency order: stop accepting, close
    /// relays, then release the target.
    async fn shutdown(&mut self) {
        self.server.shutdown().await;
        self.monitor.shutdown();
        info!("session '{}' ended", self.store.session());
    }
}
