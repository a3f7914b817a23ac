//! Process entry for worker binaries.
//!
//! One binary plays both roles:
//!
//! - `<bin> <port>` serves the registry on `127.0.0.1:<port>`.
//! - `<bin> relay <port> [frame]` forwards one frame (argument, or stdin when
//!   absent) and prints the reply on stdout.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::registry::Registry;
use crate::transport::run_relay;
use crate::worker::{WorkerConfig, run_worker};

pub const LOG_ENV: &str = "SYNCRPC_LOG";

const USAGE: &str = "\
Usage: syncrpc-worker <port>
       syncrpc-worker relay <port> [frame]

Arguments:
  <port>     Loopback port to serve on (or to relay to)
  [frame]    Request frame to relay [default: read from stdin]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Serve { port: u16 },
    Relay { port: u16, frame: Option<String> },
}

/// Parse `args` (including argv[0]).
pub fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let rest = args.get(1..).unwrap_or_default();
    match rest {
        [] => Err("missing required argument: <port>".to_string()),
        [flag] if flag == "--help" || flag == "-h" => Err(String::new()),
        [relay, tail @ ..] if relay == "relay" => match tail {
            [] => Err("relay requires <port>".to_string()),
            [port] => Ok(Invocation::Relay {
                port: parse_port(port)?,
                frame: None,
            }),
            [port, frame] => Ok(Invocation::Relay {
                port: parse_port(port)?,
                frame: Some(frame.clone()),
            }),
            [_, _, extra, ..] => Err(format!("unexpected argument: {extra}")),
        },
        [port] => Ok(Invocation::Serve {
            port: parse_port(port)?,
        }),
        [_, extra, ..] => Err(format!("unexpected argument: {extra}")),
    }
}

fn parse_port(raw: &str) -> Result<u16, String> {
    match raw.parse::<u16>() {
        Ok(0) => Err("port must be non-zero".to_string()),
        Ok(port) => Ok(port),
        Err(_) => Err(format!("invalid port: {raw}")),
    }
}

/// Install the stderr subscriber. `RUST_LOG` wins; otherwise `SYNCRPC_LOG` sets
/// the level for this crate. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var(LOG_ENV).as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("syncrpc={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Run the process for `args` and map the outcome to an exit code: 0 on success,
/// 1 on failure, 2 on bad usage.
pub fn run(registry: Registry, args: &[String]) -> ExitCode {
    let invocation = match parse_args(args) {
        Ok(invocation) => invocation,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    init_tracing();

    let result = match invocation {
        Invocation::Serve { port } => serve(registry, port),
        Invocation::Relay { port, frame } => {
            run_relay(port, frame).with_context(|| format!("relay to port {port} failed"))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "Exiting with error");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// [`run`] with the process arguments.
pub fn main(registry: Registry) -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    run(registry, &args)
}

fn serve(registry: Registry, port: u16) -> anyhow::Result<()> {
    // The dispatch loop is single threaded; callables that block should move
    // their work to spawn_blocking.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let result = runtime
        .block_on(run_worker(registry, WorkerConfig::from_env(), port))
        .with_context(|| format!("worker on port {port} failed"));

    // In-flight callables are abandoned rather than awaited.
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}
