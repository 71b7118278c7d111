// Process monitor - owns the traced target and turns waitpid noise into events

use std::ffi::CString;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::classify;
use super::event::{ProcessEvent, TraceEvent};
use super::target::{AttachMode, TargetProcess, TargetState, TraceOptions};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("failed to attach to pid {pid}: {reason}")]
    Attach { pid: i32, reason: String },

    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("failed to restart target: {0}")]
    Restart(String),

    #[error("wait for trace event failed: {0}")]
    Wait(#[source] nix::Error),

    #[error("ptrace {op} failed for pid {pid}: {source}")]
    Ptrace {
        op: &'static str,
        pid: i32,
        #[source]
        source: nix::Error,
    },
}

/// How to (re)create the target on restart.
#[derive(Debug, Clone)]
enum TargetSpec {
    Pid(i32),
    Command(Vec<String>),
}

/// Monitor-wide state, distinct from the per-instance `TargetState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Tracing,
    Restarting,
    Stopped,
}

/// Owns the traced target's lifecycle: attach or spawn, event polling with
/// transparent resumption of benign stops, restart and detach.
pub struct ProcessMonitor {
    target: TargetProcess,
    spec: TargetSpec,
    options: TraceOptions,
    state: MonitorState,
    /// Followed fork children still believed to be alive.
    children: Vec<Pid>,
}

impl ProcessMonitor {
    /// Attach to an already-running process.
    pub fn attach(pid: i32, options: TraceOptions) -> Result<Self, MonitorError> {
        let target = Self::attach_target(pid, options)?;
        info!("attached to running process {}", pid);
        Ok(Self {
            target,
            spec: TargetSpec::Pid(pid),
            options,
            state: MonitorState::Tracing,
            children: Vec::new(),
        })
    }

    /// Spawn a command under trace from its first instruction.
    pub fn spawn(command: &[String], options: TraceOptions) -> Result<Self, MonitorError> {
        let target = Self::spawn_target(command, options)?;
        info!("spawned target process {}", target.pid());
        Ok(Self {
            target,
            spec: TargetSpec::Command(command.to_vec()),
            options,
            state: MonitorState::Tracing,
            children: Vec::new(),
        })
    }

    pub fn pid(&self) -> Pid {
        self.target.pid()
    }

    pub fn target(&self) -> &TargetProcess {
        &self.target
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    fn attach_target(pid: i32, options: TraceOptions) -> Result<TargetProcess, MonitorError> {
        let attach_err = |reason: String| MonitorError::Attach { pid, reason };
        let target = Pid::from_raw(pid);

        ptrace::attach(target).map_err(|e| attach_err(e.to_string()))?;
        // Consume the attach SIGSTOP before turning options on.
        match waitpid(target, None) {
            Ok(WaitStatus::Stopped(_, _)) => {}
            Ok(status) => {
                return Err(attach_err(format!("unexpected initial state: {status:?}")))
            }
            Err(e) => return Err(attach_err(e.to_string())),
        }
        // No EXITKILL for attach mode: an attached process must survive a
        // tracer exit followed by detach.
        ptrace::setoptions(target, trace_flags(options, false))
            .map_err(|e| attach_err(e.to_string()))?;
        ptrace::cont(target, None).map_err(|e| attach_err(e.to_string()))?;

        Ok(TargetProcess::new(target, AttachMode::Attached))
    }

    fn spawn_target(
        command: &[String],
        options: TraceOptions,
    ) -> Result<TargetProcess, MonitorError> {
        let display = command.join(" ");
        let spawn_err = |reason: String| MonitorError::Spawn {
            command: display.clone(),
            reason,
        };

        if command.is_empty() {
            return Err(spawn_err("empty command line".into()));
        }
        let argv: Vec<CString> = command
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<_, _>>()
            .map_err(|_| spawn_err("argument contains an interior NUL byte".into()))?;

        let child = match unsafe { fork() }.map_err(|e| spawn_err(format!("fork failed: {e}")))? {
            ForkResult::Parent { child } => child,
            ForkResult::Child => exec_child(&argv, options),
        };

        // The child stops with SIGTRAP when execvp fires under TRACEME. An
        // exit instead means the executable could not be launched.
        match waitpid(child, None) {
            Ok(WaitStatus::Stopped(_, _)) => {}
            Ok(WaitStatus::Exited(_, code)) => {
                return Err(spawn_err(format!(
                    "target exited with status {code} before exec completed"
                )))
            }
            Ok(status) => return Err(spawn_err(format!("unexpected initial state: {status:?}"))),
            Err(e) => return Err(spawn_err(format!("wait for initial stop failed: {e}"))),
        }
        ptrace::setoptions(child, trace_flags(options, true))
            .map_err(|e| spawn_err(format!("setoptions failed: {e}")))?;
        ptrace::cont(child, None).map_err(|e| spawn_err(format!("cont failed: {e}")))?;

        Ok(TargetProcess::new(child, AttachMode::Spawned))
    }

    /// Non-blocking check for the next trace event. Benign stops are
    /// transparently resumed before the event is returned; fault and
    /// termination events leave the target where it is.
    pub fn poll_event(&mut self) -> Result<Option<ProcessEvent>, MonitorError> {
        loop {
            let flags = WaitPidFlag::WNOHANG | WaitPidFlag::__WALL;
            // With fork following any tracee may report; otherwise only the
            // target itself is interesting.
            let who = if self.options.follow_fork {
                None
            } else {
                Some(self.target.pid())
            };
            let status = match waitpid(who, Some(flags)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => return Ok(None),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(MonitorError::Wait(e)),
            };
            let raw = match self.decode(status)? {
                Some(event) => event,
                None => return Ok(None),
            };
            let event = ProcessEvent::tagged(raw);
            self.note_event(&event);
            if !event.is_fault() && event.event.is_stop() {
                self.resume(&event.event)?;
            }
            return Ok(Some(event));
        }
    }

    /// Block until the next trace event, polling the way the proxy loop
    /// does so a slow target cannot wedge the caller inside the kernel.
    pub async fn wait_event(&mut self) -> Result<ProcessEvent, MonitorError> {
        loop {
            if let Some(event) = self.poll_event()? {
                return Ok(event);
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drain pending events, logging benign ones, and return the first
    /// terminal event (fault anywhere, or the target itself going away).
    pub fn poll_terminal(&mut self) -> Result<Option<ProcessEvent>, MonitorError> {
        while let Some(event) = self.poll_event()? {
            if self.is_terminal(&event) {
                return Ok(Some(event));
            }
            debug!("benign trace event: {:?}", event.event);
        }
        Ok(None)
    }

    /// A terminal event ends the current `TargetProcess`: any fault, or a
    /// termination of the target pid itself. Followed children exiting on
    /// their own are not terminal.
    pub fn is_terminal(&self, event: &ProcessEvent) -> bool {
        event.is_fault()
            || (event.event.is_termination() && event.event.pid() == self.target.pid())
    }

    /// Kill remnants of the previous target, then re-spawn or re-attach
    /// with the original parameters.
    pub fn restart(&mut self) -> Result<Pid, MonitorError> {
        self.state = MonitorState::Restarting;
        self.reap_remnants();

        let fresh = match &self.spec {
            TargetSpec::Pid(pid) => Self::attach_target(*pid, self.options),
            TargetSpec::Command(argv) => {
                let argv = argv.clone();
                Self::spawn_target(&argv, self.options)
            }
        };
        match fresh {
            Ok(target) => {
                let pid = target.pid();
                self.target = target;
                self.children.clear();
                self.state = MonitorState::Tracing;
                Ok(pid)
            }
            Err(e) => {
                self.state = MonitorState::Stopped;
                Err(MonitorError::Restart(e.to_string()))
            }
        }
    }

    /// Release tracing without killing the target. Used at session end for
    /// attach-mode sessions.
    pub fn detach(&mut self) -> Result<(), MonitorError> {
        let pid = self.target.pid();
        match self.target.state() {
            TargetState::Tracing => {
                // PTRACE_DETACH needs a stopped tracee; park it first and
                // kick it back into motion once we are gone.
                let _ = signal::kill(pid, Signal::SIGSTOP);
                match waitpid(pid, None) {
                    Ok(_) => {}
                    Err(e) => debug!("wait before detach from {} failed: {}", pid, e),
                }
                ptrace::detach(pid, None).map_err(|e| MonitorError::Ptrace {
                    op: "detach",
                    pid: pid.as_raw(),
                    source: e,
                })?;
                let _ = signal::kill(pid, Signal::SIGCONT);
            }
            TargetState::Faulted => {
                // Already stopped at the faulting signal; just let go.
                ptrace::detach(pid, None).map_err(|e| MonitorError::Ptrace {
                    op: "detach",
                    pid: pid.as_raw(),
                    source: e,
                })?;
            }
            TargetState::Exited | TargetState::Unattached => {}
        }
        info!("detached from process {}", pid);
        self.state = MonitorState::Stopped;
        Ok(())
    }

    /// End the session's hold on the target: detach from attached
    /// processes, terminate spawned ones.
    pub fn shutdown(&mut self) {
        match self.target.mode() {
            AttachMode::Attached => {
                if let Err(e) = self.detach() {
                    warn!("detach during shutdown failed: {}", e);
                }
            }
            AttachMode::Spawned => self.reap_remnants(),
        }
        self.state = MonitorState::Stopped;
    }

    fn decode(&mut self, status: WaitStatus) -> Result<Option<TraceEvent>, MonitorError> {
        let event = match status {
            WaitStatus::Exited(pid, code) => TraceEvent::Exited { pid, code },
            WaitStatus::Signaled(pid, signal, core_dumped) => TraceEvent::Signaled {
                pid,
                signal,
                core_dumped,
            },
            WaitStatus::Stopped(pid, signal) => TraceEvent::Stopped { pid, signal },
            WaitStatus::PtraceEvent(pid, _, event)
                if event == libc::PTRACE_EVENT_FORK
                    || event == libc::PTRACE_EVENT_VFORK
                    || event == libc::PTRACE_EVENT_CLONE =>
            {
                let raw = ptrace::getevent(pid).map_err(|e| MonitorError::Ptrace {
                    op: "getevent",
                    pid: pid.as_raw(),
                    source: e,
                })?;
                TraceEvent::Forked {
                    pid,
                    child: Pid::from_raw(raw as i32),
                }
            }
            WaitStatus::PtraceEvent(pid, _, event) if event == libc::PTRACE_EVENT_EXEC => {
                TraceEvent::Execed { pid }
            }
            // Other ptrace machinery stops behave like syscall stops:
            // resume and move on.
            WaitStatus::PtraceEvent(pid, _, _) | WaitStatus::PtraceSyscall(pid) => {
                TraceEvent::SyscallStop { pid }
            }
            WaitStatus::StillAlive => return Ok(None),
            WaitStatus::Continued(_) => return Ok(None),
        };
        Ok(Some(event))
    }

    fn note_event(&mut self, event: &ProcessEvent) {
        match event.event {
            TraceEvent::Forked { child, .. } => {
                debug!("following forked child {}", child);
                self.children.push(child);
            }
            TraceEvent::Exited { pid, .. } | TraceEvent::Signaled { pid, .. } => {
                self.children.retain(|c| *c != pid);
                if pid == self.target.pid() {
                    let state = if event.is_fault() {
                        TargetState::Faulted
                    } else {
                        TargetState::Exited
                    };
                    self.target.set_state(state);
                }
            }
            TraceEvent::Stopped { pid, .. } if event.is_fault() => {
                if pid == self.target.pid() {
                    self.target.set_state(TargetState::Faulted);
                }
            }
            TraceEvent::Execed { pid } => {
                if self.options.trace_exec {
                    info!("process {} replaced its image via exec", pid);
                }
            }
            _ => {}
        }
    }

    fn resume(&self, event: &TraceEvent) -> Result<(), MonitorError> {
        let pid = event.pid();
        let deliver = match event {
            TraceEvent::Stopped { signal, .. } if !classify::is_stop_signal(*signal) => {
                Some(*signal)
            }
            _ => None,
        };
        match ptrace::cont(pid, deliver) {
            Ok(()) => Ok(()),
            // The process can die between the stop report and our cont.
            Err(Errno::ESRCH) => {
                debug!("process {} vanished before resume", pid);
                Ok(())
            }
            Err(e) => Err(MonitorError::Ptrace {
                op: "cont",
                pid: pid.as_raw(),
                source: e,
            }),
        }
    }

    /// SIGKILL whatever is left of the previous target (and any followed
    /// children) and reap the zombies.
    fn reap_remnants(&mut self) {
        let pid = self.target.pid();
        if self.target.state() != TargetState::Exited {
            kill_and_reap(pid);
            self.target.set_state(TargetState::Exited);
        }
        for child in self.children.drain(..) {
            kill_and_reap(child);
        }
    }
}

fn kill_and_reap(pid: Pid) {
    if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
        debug!("kill of remnant {} failed: {}", pid, e);
        return;
    }
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

fn trace_flags(options: TraceOptions, exit_kill: bool) -> Options {
    // Exec is always reported as PTRACE_EVENT_EXEC. Without the option
    // the kernel delivers a plain SIGTRAP on exec, indistinguishable
    // from a genuine trap raised by the target.
    let mut flags = Options::PTRACE_O_TRACEEXEC;
    if options.follow_fork {
        flags |= Options::PTRACE_O_TRACEFORK
            | Options::PTRACE_O_TRACEVFORK
            | Options::PTRACE_O_TRACECLONE;
    }
    if exit_kill {
        flags |= Options::PTRACE_O_EXITKILL;
    }
    flags
}

/// Child half of the spawn fork. Never returns: it either becomes the
/// target executable or exits with a recognizable status.
fn exec_child(argv: &[CString], options: TraceOptions) -> ! {
    if ptrace::traceme().is_err() {
        std::process::exit(126);
    }
    if options.suppress_stdio {
        silence_stdio();
    }
    let _ = execvp(&argv[0], argv);
    std::process::exit(127);
}

/// Point the target's stdout/stderr at /dev/null, or close them when
/// /dev/null is unavailable.
fn silence_stdio() {
    use std::os::unix::io::IntoRawFd;

    match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
    {
        Ok(devnull) => {
            let fd = devnull.into_raw_fd();
            unsafe {
                libc::dup2(fd, libc::STDOUT_FILENO);
                libc::dup2(fd, libc::STDERR_FILENO);
                if fd > libc::STDERR_FILENO {
                    libc::close(fd);
                }
            }
        }
        Err(_) => unsafe {
            libc::close(libc::STDOUT_FILENO);
            libc::close(libc::STDERR_FILENO);
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::event::Classification;

    fn wait_terminal(monitor: &mut ProcessMonitor) -> ProcessEvent {
        for _ in 0..500 {
            if let Some(event) = monitor.poll_terminal().unwrap() {
                return event;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("no terminal event observed");
    }

    #[test]
    fn test_spawn_clean_exit_is_benign() {
        let mut monitor =
            ProcessMonitor::spawn(&["/bin/true".to_string()], TraceOptions::default()).unwrap();
        let event = wait_terminal(&mut monitor);
        assert_eq!(event.classification, Classification::Benign);
        assert_eq!(event.event.exit_code(), Some(0));
        assert_eq!(monitor.target().state(), TargetState::Exited);
    }

    #[test]
    fn test_exec_into_new_program_is_benign() {
        // A shell wrapper that execs its real binary must not look like a
        // crash; the exec stop arrives as an event, not a raw SIGTRAP.
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "exec /bin/true".to_string(),
        ];
        let mut monitor = ProcessMonitor::spawn(&command, TraceOptions::default()).unwrap();
        let event = wait_terminal(&mut monitor);
        assert_eq!(event.classification, Classification::Benign);
        assert_eq!(event.event.exit_code(), Some(0));
        monitor.shutdown();
    }

    #[tokio::test]
    async fn test_wait_event_returns_next_event() {
        let mut monitor =
            ProcessMonitor::spawn(&["/bin/true".to_string()], TraceOptions::default()).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), monitor.wait_event())
            .await
            .expect("no event before timeout")
            .unwrap();
        assert_eq!(event.event.exit_code(), Some(0));
    }

    #[test]
    fn test_spawn_missing_executable_fails() {
        let result = ProcessMonitor::spawn(
            &["/no/such/binary-fuzzmon".to_string()],
            TraceOptions::default(),
        );
        assert!(matches!(result, Err(MonitorError::Spawn { .. })));
    }

    #[test]
    fn test_attach_nonexistent_pid_fails() {
        // Pid well above any plausible pid_max.
        let result = ProcessMonitor::attach(i32::MAX - 1, TraceOptions::default());
        assert!(matches!(result, Err(MonitorError::Attach { .. })));
    }

    #[test]
    fn test_segfault_is_reported_as_fault() {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "kill -SEGV $$".to_string(),
        ];
        let mut monitor = ProcessMonitor::spawn(&command, TraceOptions::default()).unwrap();
        let event = wait_terminal(&mut monitor);
        assert!(event.is_fault());
        assert_eq!(event.event.signal(), Some(Signal::SIGSEGV));
        monitor.shutdown();
    }

    #[test]
    fn test_restart_yields_fresh_tracing_target() {
        let mut monitor =
            ProcessMonitor::spawn(&["/bin/true".to_string()], TraceOptions::default()).unwrap();
        let first_pid = monitor.pid();
        let _ = wait_terminal(&mut monitor);

        let new_pid = monitor.restart().unwrap();
        assert_ne!(new_pid, first_pid);
        assert_eq!(monitor.state(), MonitorState::Tracing);
        assert!(monitor.target().is_live());

        let event = wait_terminal(&mut monitor);
        assert_eq!(event.event.exit_code(), Some(0));
        monitor.shutdown();
    }

    #[test]
    fn test_restart_after_fault_recovers() {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "kill -SEGV $$".to_string(),
        ];
        let mut monitor = ProcessMonitor::spawn(&command, TraceOptions::default()).unwrap();
        let event = wait_terminal(&mut monitor);
        assert!(event.is_fault());

        monitor.restart().unwrap();
        assert_eq!(monitor.state(), MonitorState::Tracing);
        monitor.shutdown();
    }
}
