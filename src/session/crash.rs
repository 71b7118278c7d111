// Crash records and their on-disk store

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::{ProcessEvent, TraceEvent};
use crate::proxy::TrafficCapture;

/// Immutable metadata for one detected fault. Self-contained: everything
/// needed to triage the crash lives in the record itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashRecord {
    pub session: String,
    pub sequence: u32,
    pub pid: i32,
    /// Symbolic signal name, e.g. "SIGSEGV". None for exit-style faults.
    pub signal: Option<String>,
    pub signal_number: Option<i32>,
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
    /// Traffic tails from relays active when the fault hit.
    pub exchanges: Vec<TrafficCapture>,
}

impl CrashRecord {
    fn from_event(
        session: String,
        sequence: u32,
        event: &ProcessEvent,
        exchanges: Vec<TrafficCapture>,
    ) -> Self {
        let signal = event.event.signal();
        Self {
            session,
            sequence,
            pid: event.event.pid().as_raw(),
            signal: signal.map(|s| s.as_str().to_string()),
            signal_number: signal.map(|s| s as i32),
            exit_code: match event.event {
                TraceEvent::Exited { code, .. } => Some(code),
                _ => None,
            },
            timestamp: Utc::now(),
            exchanges,
        }
    }
}

/// Durable store for crash records, namespaced by session identifier and a
/// monotonically increasing sequence number.
pub struct CrashStore {
    dir: PathBuf,
    session: String,
    next_sequence: u32,
}

impl CrashStore {
    /// A missing session identifier gets a generated one so every record
    /// still lands in its own namespace.
    pub fn new(output: &Path, session: Option<String>) -> Self {
        let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            dir: output.join(&session),
            session,
            next_sequence: 0,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Build the next record in sequence. The sequence advances even when
    /// a later persist fails; losing a record must never reuse its number.
    pub fn next_record(
        &mut self,
        event: &ProcessEvent,
        exchanges: Vec<TrafficCapture>,
    ) -> CrashRecord {
        self.next_sequence += 1;
        CrashRecord::from_event(self.session.clone(), self.next_sequence, event, exchanges)
    }

    /// Write one record to disk, returning its path.
    pub fn persist(&self, record: &CrashRecord) -> crate::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("crash-{:04}.json", record.sequence));
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    fn fault_event() -> ProcessEvent {
        ProcessEvent::tagged(TraceEvent::Signaled {
            pid: Pid::from_raw(4242),
            signal: Signal::SIGSEGV,
            core_dumped: true,
        })
    }

    fn temp_output() -> PathBuf {
        std::env::temp_dir().join(format!("fuzzmon-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let output = temp_output();
        let mut store = CrashStore::new(&output, Some("seq-test".to_string()));
        let first = store.next_record(&fault_event(), Vec::new());
        let second = store.next_record(&fault_event(), Vec::new());
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[test]
    fn test_persisted_record_round_trips() {
        let output = temp_output();
        let mut store = CrashStore::new(&output, Some("persist-test".to_string()));

        let mut capture = TrafficCapture::default();
        capture.to_upstream = b"AAAA".to_vec();
        let record = store.next_record(&fault_event(), vec![capture]);
        let path = store.persist(&record).unwrap();
        assert!(path.ends_with("crash-0001.json"));

        let json = fs::read_to_string(&path).unwrap();
        let loaded: CrashRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.session, "persist-test");
        assert_eq!(loaded.sequence, 1);
        assert_eq!(loaded.pid, 4242);
        assert_eq!(loaded.signal.as_deref(), Some("SIGSEGV"));
        assert_eq!(loaded.exchanges[0].to_upstream, b"AAAA");

        fs::remove_dir_all(&output).unwrap();
    }

    #[test]
    fn test_generated_session_id_when_missing() {
        let output = temp_output();
        let store = CrashStore::new(&output, None);
        assert!(!store.session().is_empty());
    }
}
