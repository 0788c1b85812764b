//! procpool - application process pool server

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use procpool::auth::SingleAccount;
use procpool::cli::Cli;
use procpool::pool::{Pool, PoolConfig};
use procpool::server::Server;
use procpool::spawn::CommandSpawnerFactory;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Set by the signal handler; polled by the shutdown watcher thread.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() {
    let cli = Cli::parse();
    let _log_guard = procpool::logging::init(cli.log_config());

    match run(&cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e.error
            );
            for cause in e.error.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(e.exit_code);
        }
    }
}

/// An error plus the process exit code it maps to: 1 for configuration
/// problems, 2 for a failed socket bind.
struct FatalError {
    error: anyhow::Error,
    exit_code: i32,
}

fn config_error(error: anyhow::Error) -> FatalError {
    FatalError {
        error,
        exit_code: 1,
    }
}

fn run(cli: &Cli) -> std::result::Result<(), FatalError> {
    let password = read_password(cli).map_err(config_error)?;
    let authenticator = Arc::new(SingleAccount::new(cli.user.as_bytes(), password));

    let pool = Pool::new(
        PoolConfig {
            max: cli.max,
            max_per_app: cli.max_per_app,
            max_idle_time: Duration::from_secs(cli.idle_time),
            ..PoolConfig::default()
        },
        Arc::new(CommandSpawnerFactory),
    );

    let server = Server::bind(&cli.socket, pool.clone(), authenticator).map_err(|e| FatalError {
        error: anyhow::Error::new(e)
            .context(format!("cannot bind socket {}", cli.socket.display())),
        exit_code: 2,
    })?;

    install_signal_handlers().map_err(config_error)?;
    std::thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn({
            let server = server.clone();
            move || {
                while !SHUTDOWN.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(100));
                }
                tracing::info!("Shutdown signal received");
                server.stop();
            }
        })
        .map_err(|e| config_error(e.into()))?;

    server.run();
    pool.shutdown();
    Ok(())
}

/// The client password comes from --password-file or PROCPOOL_PASSWORD.
fn read_password(cli: &Cli) -> Result<Vec<u8>> {
    if let Some(path) = &cli.password_file {
        let raw = std::fs::read(path)
            .with_context(|| format!("cannot read password file {}", path.display()))?;
        // A trailing newline is an editor artifact, not part of the secret.
        let trimmed = raw
            .strip_suffix(b"\n")
            .map(|s| s.to_vec())
            .unwrap_or(raw);
        if trimmed.is_empty() {
            anyhow::bail!("password file {} is empty", path.display());
        }
        return Ok(trimmed);
    }
    if let Ok(password) = std::env::var("PROCPOOL_PASSWORD") {
        if !password.is_empty() {
            return Ok(password.into_bytes());
        }
    }
    anyhow::bail!("no client password configured; use --password-file or PROCPOOL_PASSWORD")
}

fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        signal(Signal::SIGINT, SigHandler::Handler(on_signal))
            .context("cannot install SIGINT handler")?;
        signal(Signal::SIGTERM, SigHandler::Handler(on_signal))
            .context("cannot install SIGTERM handler")?;
        // Worker sockets produce EPIPE through io::Error, not a signal.
        signal(Signal::SIGPIPE, SigHandler::SigIgn)
            .context("cannot ignore SIGPIPE")?;
    }
    Ok(())
}
