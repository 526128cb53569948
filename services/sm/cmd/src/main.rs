//! Stream management simulator binary.
//!
//! Runs a scripted XEP-0198 scenario against an in-process peer: enable after
//! binding, message exchange with acknowledgments, link drops, and resume or
//! fallback to a fresh enable.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod sim;

use config::{SimConfig, StoreMode};
use logging::SmLogFormatter;
use sim::{PeerAnswer, Scenario};

/// XEP-0198 stream management simulator
#[derive(Parser, Debug)]
#[command(name = "sm-sim", version, about = "Stream management enable/ack/resume simulator")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Stream entity, used as the resume store key
    #[arg(long)]
    entity: Option<String>,

    /// Messages exchanged on each connection
    #[arg(long, default_value = "3")]
    stanzas: u32,

    /// Link drops to simulate after the first connection
    #[arg(long, default_value = "1")]
    reconnects: u32,

    /// Peer answer to enable: grant, reject, ignore
    #[arg(long, default_value = "grant")]
    peer_enable: PeerAnswer,

    /// Peer answer to resume: grant, reject, ignore
    #[arg(long, default_value = "grant")]
    peer_resume: PeerAnswer,

    /// Resumption window granted by the peer, e.g. 5m
    #[arg(long, default_value = "5m")]
    peer_max_resume: humantime::Duration,

    /// Wait for enabled/resumed, e.g. 10s
    #[arg(long)]
    response_timeout: Option<humantime::Duration>,

    /// Send a request after every N stanzas
    #[arg(long)]
    request_every: Option<u32>,

    /// Do not request resumption when enabling
    #[arg(long)]
    no_resume: bool,

    /// Keep resumable sessions in this directory instead of memory
    #[arg(long)]
    store_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("sm_sim={}", args.log_level).parse()?)
        .add_directive(format!("sm_session={}", args.log_level).parse()?)
        .add_directive(format!("sm_wire={}", args.log_level).parse()?);

    let formatter = SmLogFormatter::new("sm".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting stream management simulator v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SimConfig::load_from_file(&args.config)?;
    if let Some(entity) = args.entity {
        config.entity = entity;
    }
    if let Some(timeout) = args.response_timeout {
        config.response_timeout = Duration::from(timeout);
    }
    if let Some(every) = args.request_every {
        config.request_every = every;
    }
    if args.no_resume {
        config.resume = false;
    }
    if let Some(dir) = args.store_dir {
        config.store = StoreMode::File { dir };
    }

    let scenario = Scenario {
        config,
        stanzas: args.stanzas,
        reconnects: args.reconnects,
        peer_enable: args.peer_enable,
        peer_resume: args.peer_resume,
        peer_max_resume: u32::try_from(Duration::from(args.peer_max_resume).as_secs())?,
    };

    info!(
        "Scenario: stanzas={}, reconnects={}, peer_enable={:?}, peer_resume={:?}",
        scenario.stanzas, scenario.reconnects, scenario.peer_enable, scenario.peer_resume
    );

    let reports = sim::run(&scenario).await?;
    for (i, report) in reports.iter().enumerate() {
        info!(
            "Connection {}: {} session={:?} inbound={} outbound={} pending={}",
            i,
            report.negotiation,
            report.session_id,
            report.inbound,
            report.outbound,
            report.pending
        );
    }

    info!("Simulation complete");
    Ok(())
}
