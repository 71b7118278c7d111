// Traced target process identity and per-instance state

use nix::unistd::Pid;

/// How the monitor should treat the target's execution environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceOptions {
    /// Follow fork/vfork/clone and trace the children too.
    pub follow_fork: bool,
    /// Log the target's execve() transitions prominently.
    pub trace_exec: bool,
    /// Redirect the target's stdout/stderr to /dev/null (or close them).
    pub suppress_stdio: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Attached to an already-running process.
    Attached,
    /// Spawned by the monitor and traced from the first instruction.
    Spawned,
}

/// Lifecycle of one traced process instance. `Faulted` and `Exited` are
/// terminal; a restart produces a fresh `TargetProcess`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unattached,
    Tracing,
    Faulted,
    Exited,
}

#[derive(Debug)]
pub struct TargetProcess {
    pid: Pid,
    mode: AttachMode,
    state: TargetState,
}

impl TargetProcess {
    pub(crate) fn new(pid: Pid, mode: AttachMode) -> Self {
        Self {
            pid,
            mode,
            state: TargetState::Tracing,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn mode(&self) -> AttachMode {
        self.mode
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TargetState) {
        self.state = state;
    }

    /// Whether this instance can still produce events.
    pub fn is_live(&self) -> bool {
        self.state == TargetState::Tracing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_target_is_tracing() {
        let target = TargetProcess::new(Pid::from_raw(100), AttachMode::Spawned);
        assert_eq!(target.state(), TargetState::Tracing);
        assert!(target.is_live());
        assert_eq!(target.mode(), AttachMode::Spawned);
    }

    #[test]
    fn test_terminal_states() {
        let mut target = TargetProcess::new(Pid::from_raw(100), AttachMode::Attached);
        target.set_state(TargetState::Faulted);
        assert!(!target.is_live());

        let mut target = TargetProcess::new(Pid::from_raw(101), AttachMode::Spawned);
        target.set_state(TargetState::Exited);
        assert!(!target.is_live());
    }
}
