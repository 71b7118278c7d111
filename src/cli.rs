// Command-line surface - thin glue around the session core

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::monitor::TraceOptions;
use crate::proxy::Endpoint;
use crate::session::RestartPolicy;

/// A proxy which monitors the backend application state.
#[derive(Parser, Debug)]
#[command(name = "fuzzmon", version)]
pub struct Cli {
    /// Attach to a running process specified by its identifier
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Upstream server to connect to. Format is proto:host:port or
    /// proto:uds:path for Unix domain sockets
    #[arg(short, long)]
    pub upstream: Endpoint,

    /// Address to bind for downstream connections, same format as upstream
    #[arg(short, long, default_value = "tcp:0.0.0.0:25746")]
    pub downstream: Endpoint,

    /// Output folder where crash metadata is stored
    #[arg(short, long, default_value = "metadata")]
    pub output: PathBuf,

    /// A session identifier for the fuzzing session
    #[arg(short, long)]
    pub session: Option<String>,

    /// Trace fork and child processes
    #[arg(short, long)]
    pub fork: bool,

    /// Report the target's execve() events in the log
    #[arg(short = 'e', long)]
    pub trace_exec: bool,

    /// Use /dev/null as the target's stdout/stderr, or close them if
    /// /dev/null doesn't exist
    #[arg(short = 'n', long)]
    pub no_stdout: bool,

    /// Number of downstream connections to relay in parallel
    #[arg(short, long, default_value_t = 1)]
    pub conns: usize,

    /// Do not restart the target after a fault is detected, exit cleanly
    #[arg(short, long, conflicts_with = "wait")]
    pub quit: bool,

    /// How long to wait (seconds) before restarting the crashed target
    #[arg(short, long, default_value_t = 0.0)]
    pub wait: f64,

    /// Proxy tick timeout in seconds; bounds how long crash detection can
    /// be deferred by an idle network
    #[arg(short = 't', long, default_value_t = 3.0)]
    pub timeout: f64,

    /// The command line to run and trace
    #[arg(trailing_var_arg = true)]
    pub program: Vec<String>,
}

impl Cli {
    /// Cross-flag validation that clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        match (self.pid, self.program.is_empty()) {
            (None, true) => return Err("missing program or pid (-p)".to_string()),
            (Some(_), false) => return Err("both program and pid (-p) provided".to_string()),
            _ => {}
        }
        if self.conns == 0 {
            return Err("connection limit must be at least 1".to_string());
        }
        if self.wait < 0.0 {
            return Err("restart delay cannot be negative; use -q to quit on fault".to_string());
        }
        if self.timeout <= 0.0 {
            return Err("tick timeout must be positive".to_string());
        }
        Ok(())
    }

    pub fn trace_options(&self) -> TraceOptions {
        TraceOptions {
            follow_fork: self.fork,
            trace_exec: self.trace_exec,
            suppress_stdio: self.no_stdout,
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        if self.quit {
            RestartPolicy::QuitOnFault
        } else {
            RestartPolicy::RestartAfter(Duration::from_secs_f64(self.wait))
        }
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_spawn_mode_parses() {
        let cli = parse(&[
            "fuzzmon",
            "-u",
            "tcp:127.0.0.1:8080",
            "--",
            "./target",
            "--flag",
        ]);
        cli.validate().unwrap();
        assert_eq!(cli.program, vec!["./target", "--flag"]);
        assert_eq!(cli.conns, 1);
        assert_eq!(
            cli.downstream.to_string(),
            "tcp:0.0.0.0:25746",
            "default downstream"
        );
    }

    #[test]
    fn test_attach_mode_parses() {
        let cli = parse(&["fuzzmon", "-u", "tcp:uds:/tmp/t.sock", "-p", "1234"]);
        cli.validate().unwrap();
        assert_eq!(cli.pid, Some(1234));
    }

    #[test]
    fn test_pid_and_program_are_exclusive() {
        let cli = parse(&["fuzzmon", "-u", "tcp:h:1", "-p", "1", "--", "./target"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["fuzzmon", "-u", "tcp:h:1"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_quit_and_wait_conflict() {
        let result = Cli::try_parse_from(["fuzzmon", "-u", "tcp:h:1", "-q", "-w", "2", "./t"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_restart_policy_mapping() {
        let cli = parse(&["fuzzmon", "-u", "tcp:h:1", "-q", "./t"]);
        assert_eq!(cli.restart_policy(), RestartPolicy::QuitOnFault);

        let cli = parse(&["fuzzmon", "-u", "tcp:h:1", "-w", "2.5", "./t"]);
        assert_eq!(
            cli.restart_policy(),
            RestartPolicy::RestartAfter(Duration::from_millis(2500))
        );

        // No flag at all restarts immediately.
        let cli = parse(&["fuzzmon", "-u", "tcp:h:1", "./t"]);
        assert_eq!(
            cli.restart_policy(),
            RestartPolicy::RestartAfter(Duration::ZERO)
        );
    }

    #[test]
    fn test_trace_options_mapping() {
        let cli = parse(&["fuzzmon", "-u", "tcp:h:1", "-f", "-e", "-n", "./t"]);
        let options = cli.trace_options();
        assert!(options.follow_fork);
        assert!(options.trace_exec);
        assert!(options.suppress_stdio);
    }

    #[test]
    fn test_negative_wait_is_rejected() {
        // The old "-w -1 means quit" sentinel is gone; -q is the only way.
        let cli = Cli::try_parse_from(["fuzzmon", "-u", "tcp:h:1", "-w", "-1", "./t"]);
        match cli {
            Ok(cli) => assert!(cli.validate().is_err()),
            // clap may reject the leading dash outright
            Err(_) => {}
        }
    }
}
