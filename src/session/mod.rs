pub mod coordinator;
pub mod crash;

pub use coordinator::{RestartPolicy, SessionCoordinator};
pub use crash::{CrashRecord, CrashStore};
