// Trace event model - everything waitpid can report about a tracee

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use super::classify;

/// A single state change reported by the kernel for a traced process.
///
/// Tracer-induced stops (syscall stops, fork/exec notifications) get their
/// own variants so the classifier never has to guess whether a SIGTRAP came
/// from the trace machinery or from the target itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// The process called exit() or returned from main.
    Exited { pid: Pid, code: i32 },
    /// The process was terminated by a signal.
    Signaled { pid: Pid, signal: Signal, core_dumped: bool },
    /// The process stopped on signal delivery.
    Stopped { pid: Pid, signal: Signal },
    /// A followed fork/vfork/clone created a new tracee.
    Forked { pid: Pid, child: Pid },
    /// The process called execve() (trace-exec enabled).
    Execed { pid: Pid },
    /// A syscall-entry/exit or other trace-machinery stop.
    SyscallStop { pid: Pid },
}

impl TraceEvent {
    /// The process this event was reported for.
    pub fn pid(&self) -> Pid {
        match *self {
            TraceEvent::Exited { pid, .. }
            | TraceEvent::Signaled { pid, .. }
            | TraceEvent::Stopped { pid, .. }
            | TraceEvent::Forked { pid, .. }
            | TraceEvent::Execed { pid }
            | TraceEvent::SyscallStop { pid } => pid,
        }
    }

    /// The signal involved, for termination and delivery stops.
    pub fn signal(&self) -> Option<Signal> {
        match *self {
            TraceEvent::Signaled { signal, .. } | TraceEvent::Stopped { signal, .. } => {
                Some(signal)
            }
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match *self {
            TraceEvent::Exited { code, .. } => Some(code),
            _ => None,
        }
    }

    /// True for exits and signal terminations, where the process is gone.
    pub fn is_termination(&self) -> bool {
        matches!(
            self,
            TraceEvent::Exited { .. } | TraceEvent::Signaled { .. }
        )
    }

    /// True for stops that leave the process alive and resumable.
    pub fn is_stop(&self) -> bool {
        !self.is_termination()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Benign,
    Fault,
}

/// A trace event tagged with its fault classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEvent {
    pub event: TraceEvent,
    pub classification: Classification,
}

impl ProcessEvent {
    /// Tag a raw event using the fault classifier.
    pub fn tagged(event: TraceEvent) -> Self {
        Self {
            classification: classify::classify(&event),
            event,
        }
    }

    pub fn is_fault(&self) -> bool {
        self.classification == Classification::Fault
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let pid = Pid::from_raw(42);
        let exit = TraceEvent::Exited { pid, code: 3 };
        assert_eq!(exit.pid(), pid);
        assert_eq!(exit.exit_code(), Some(3));
        assert_eq!(exit.signal(), None);
        assert!(exit.is_termination());

        let stop = TraceEvent::Stopped {
            pid,
            signal: Signal::SIGUSR1,
        };
        assert_eq!(stop.signal(), Some(Signal::SIGUSR1));
        assert!(stop.is_stop());
    }

    #[test]
    fn test_tagged_event_carries_classification() {
        let pid = Pid::from_raw(42);
        let event = ProcessEvent::tagged(TraceEvent::Signaled {
            pid,
            signal: Signal::SIGSEGV,
            core_dumped: true,
        });
        assert!(event.is_fault());

        let event = ProcessEvent::tagged(TraceEvent::Exited { pid, code: 0 });
        assert!(!event.is_fault());
    }
}
