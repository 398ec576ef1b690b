//! vmsession: drives a session against the simulated hypervisor.
//!
//! Progress events and status snapshots go to stdout as JSON lines; logs go
//! to stderr (`RUST_LOG`, default `info`).

mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmsession_core::domain::{HvStatus, SessionState};
use vmsession_core::impls::{SimulatedHypervisor, StaticDownloadProvider};
use vmsession_core::observability::FsmStatus;
use vmsession_core::progress::ProgressTask;
use vmsession_core::session::{Session, SessionConfig};

use crate::cli::{Cli, Command, Op};

const SIMULATED_MEDIA_URL: &str = "sim://media/boot.iso";

/// One JSON line on stdout.
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Started { message: &'a str },
    Progress { value: f64, message: &'a str },
    Completed { message: &'a str },
    Error { message: &'a str, code: i32 },
    Op { op: &'a str, status: HvStatus },
    Status { status: &'a FsmStatus },
    Route { path: Vec<SessionState> },
}

fn emit(event: &Event<'_>) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "cannot encode event"),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn load_config(cli: &Cli) -> Result<SessionConfig, String> {
    match &cli.config {
        Some(path) => SessionConfig::from_json_file(path).map_err(|e| e.to_string()),
        None => Ok(SessionConfig::default()),
    }
}

fn parse_fault(raw: &str) -> Result<(String, usize), String> {
    let (verb, times) = raw.split_once(':').unwrap_or((raw, "1"));
    let times = times
        .parse()
        .map_err(|_| format!("invalid failure count in {raw:?}"))?;
    Ok((verb.to_string(), times))
}

fn build_session(
    mut config: SessionConfig,
    faults: &[String],
) -> Result<Session, String> {
    if config.boot_media_url().is_none() {
        config.iso_url = Some(SIMULATED_MEDIA_URL.to_string());
    }
    let downloads = Arc::new(StaticDownloadProvider::new().with_chunk_size(64 * 1024));
    if let Some(url) = config.boot_media_url() {
        downloads.insert(url, vec![0u8; 1024 * 1024]);
    }

    let hypervisor = Arc::new(SimulatedHypervisor::new());
    for raw in faults {
        let (verb, times) = parse_fault(raw)?;
        hypervisor.fail_next(&verb, HvStatus::ExternalError, times);
    }

    Session::builder(config)
        .hypervisor(hypervisor)
        .downloads(downloads)
        .build()
        .map_err(|e| e.to_string())
}

fn subscribe(session: &Session) {
    let root = session.progress();
    root.on_started(|message| emit(&Event::Started { message }));
    root.on_progress(|value, message| emit(&Event::Progress { value, message }));
    root.on_completed(|message| emit(&Event::Completed { message }));
    root.on_error(|message, code| emit(&Event::Error { message, code }));
}

async fn run(
    config: SessionConfig,
    ops: &[Op],
    faults: &[String],
    timeout: Duration,
) -> Result<(), String> {
    let session = build_session(config, faults)?;
    subscribe(&session);
    info!(session = %session.id(), "session ready");

    for op in ops {
        let status = match op {
            Op::Open => session.open().map_err(|e| e.to_string())?,
            Op::Start => session.start(),
            Op::Pause => session.pause(),
            Op::Resume => session.resume(),
            Op::Stop => session.stop(),
            Op::Hibernate => session.hibernate(),
            Op::Close => session.close(),
        };
        let name = format!("{op:?}").to_lowercase();
        emit(&Event::Op { op: &name, status });

        if !session.wait_idle_async(Some(timeout)).await {
            return Err(format!("{name} did not settle within {timeout:?}"));
        }
        emit(&Event::Status {
            status: &session.status(),
        });
        if session.state() == Some(SessionState::Fatal) {
            return Err("session reached the fatal state".to_string());
        }
    }

    session.abort();
    Ok(())
}

fn route(config: SessionConfig, from: &str, to: &str) -> Result<(), String> {
    let from = from.parse::<SessionState>().map_err(|e| e.to_string())?;
    let to = to.parse::<SessionState>().map_err(|e| e.to_string())?;
    let session = build_session(config, &[])?;

    session.fsm().skew(from.id());
    let path = session
        .fsm()
        .plan(to.id())
        .ok_or_else(|| format!("no route from {from} to {to}"))?;
    emit(&Event::Route {
        path: path.into_iter().filter_map(SessionState::from_id).collect(),
    });
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match load_config(&cli) {
        Err(e) => Err(e),
        Ok(config) => match &cli.command {
            Command::Run { ops, fail, timeout } => {
                run(config, ops, fail, Duration::from_secs(*timeout)).await
            }
            Command::Route { from, to } => route(config, from, to),
            Command::Config => serde_json::to_string_pretty(&config)
                .map(|json| println!("{json}"))
                .map_err(|e| e.to_string()),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "vmsession failed");
            ExitCode::FAILURE
        }
    }
}
