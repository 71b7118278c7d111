pub mod classify;
pub mod event;
pub mod target;
pub mod tracer;

pub use classify::{classify, is_fault_signal};
pub use event::{Classification, ProcessEvent, TraceEvent};
pub use target::{AttachMode, TargetProcess, TargetState, TraceOptions};
pub use tracer::{MonitorError, MonitorState, ProcessMonitor};
