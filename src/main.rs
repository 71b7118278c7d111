use clap::Parser;
use tracing::{error, info};

use fuzzmon::cli::Cli;
use fuzzmon::monitor::{MonitorError, ProcessMonitor};
use fuzzmon::session::{CrashStore, SessionCoordinator};
use fuzzmon::{FuzzmonError, ProxyServer};

/// Exit codes: 2 is usage (also clap's own), 3 means the target could not
/// be placed under trace, 4 means a post-fault restart failed.
const EXIT_USAGE: i32 = 2;
const EXIT_ATTACH: i32 = 3;
const EXIT_RESTART: i32 = 4;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    if let Err(message) = cli.validate() {
        eprintln!("ERROR: {message}");
        return EXIT_USAGE;
    }

    // The target goes under trace before any endpoint opens: if it cannot
    // be attached or spawned there is nothing to proxy for.
    let monitor = match cli.pid {
        Some(pid) => ProcessMonitor::attach(pid, cli.trace_options()),
        None => ProcessMonitor::spawn(&cli.program, cli.trace_options()),
    };
    let monitor = match monitor {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("{}", e);
            return EXIT_ATTACH;
        }
    };

    let server = match ProxyServer::bind(&cli.downstream, cli.upstream.clone(), cli.conns).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return EXIT_USAGE;
        }
    };

    let store = CrashStore::new(&cli.output, cli.session.clone());
    info!("fuzzing session '{}'", store.session());

    let mut session = SessionCoordinator::new(
        monitor,
        server,
        store,
        cli.restart_policy(),
        cli.tick_timeout(),
    );
    match session.run().await {
        Ok(()) => 0,
        Err(FuzzmonError::Monitor(e @ MonitorError::Restart(_))) => {
            error!("{}", e);
            EXIT_RESTART
        }
        Err(e) => {
            error!("session failed: {}", e);
            1
        }
    }
}
