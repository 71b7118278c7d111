//! fuzzmon - a fault-monitoring fuzzing proxy
//!
//! Sits between a network-speaking fuzzer and a target program: relays
//! traffic transparently while tracing the target for faults, persisting
//! crash metadata and restarting the target according to policy.
//!
//! ## Components
//!
//! - **monitor**: ptrace-based process tracing and fault classification
//! - **proxy**: downstream listener, bounded relay pool, timed serve loop
//! - **session**: the coordinator gluing monitor events to proxy lifecycle

pub mod cli;
pub mod error;
pub mod monitor;
pub mod proxy;
pub mod session;

// Re-export commonly used types
pub use error::{FuzzmonError, Result};
pub use monitor::{ProcessEvent, ProcessMonitor, TraceOptions};
pub use proxy::{Endpoint, ProxyServer};
pub use session::{CrashStore, RestartPolicy, SessionCoordinator};
