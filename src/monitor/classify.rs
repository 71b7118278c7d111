// Fault classification - decides crash vs. expected behavior for trace events

use nix::sys::signal::Signal;

use super::event::{Classification, TraceEvent};

/// Signals that indicate the target crashed. A SIGTRAP here is a genuine
/// trap raised by the target: stops caused by the tracer itself arrive as
/// `SyscallStop`/`Forked`/`Execed` events and never reach the signal match.
const FAULT_SIGNALS: [Signal; 6] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGABRT,
    Signal::SIGTRAP,
];

/// Classify a trace event as benign or faulting.
///
/// Pure function of the event. Exits are always benign (the coordinator
/// decides what an unexpected clean exit means for the session), as are
/// deliberate terminations sent by the coordinator and all stops produced
/// by the trace machinery.
pub fn classify(event: &TraceEvent) -> Classification {
    match event {
        TraceEvent::Exited { .. } => Classification::Benign,
        TraceEvent::Signaled { signal, .. } | TraceEvent::Stopped { signal, .. } => {
            if is_fault_signal(*signal) {
                Classification::Fault
            } else {
                Classification::Benign
            }
        }
        TraceEvent::Forked { .. } | TraceEvent::Execed { .. } | TraceEvent::SyscallStop { .. } => {
            Classification::Benign
        }
    }
}

pub fn is_fault_signal(signal: Signal) -> bool {
    FAULT_SIGNALS.contains(&signal)
}

/// Stop signals are resumed without re-delivery; handing them back to the
/// tracee would just park it in a group stop.
pub fn is_stop_signal(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
    )
}
