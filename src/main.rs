//! Engine Control Plane
//!
//! Runs the node-local control plane: prepares storage, starts the
//! configured engines and supervises them until interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use engine_control_plane::storage::HostProbeConfig;
use engine_control_plane::{
    Error, HostProbe, LocalGroupUpdater, LocalMembership, LocalSystemDatabase, LoggingForwarder, Orchestrator,
    OrchestratorDeps, ProcessRunner, ServerConfig, SpdkSetupScript, SysfsFabricResolver, TargetUser,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Engine Control Plane - node-local storage engine supervisor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server configuration file
    #[arg(short, long, env = "ECP_CONFIG", default_value = "/etc/daos/daos_server.yml")]
    config: PathBuf,

    /// Format engine storage that has no superblock before starting
    #[arg(long, env = "ECP_AUTO_FORMAT")]
    auto_format: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run with in-process system collaborators
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Engine Control Plane");
    info!("  Version: {}", engine_control_plane::VERSION);
    info!("  Config: {}", args.config.display());
    info!("  Standalone mode: {}", args.standalone);

    if !args.standalone {
        anyhow::bail!("no external management service adapter available, run with --standalone");
    }

    let cfg = ServerConfig::load(&args.config).map_err(report_fault)?;
    info!("  Engines: {}", cfg.engines.len());

    let host = HostProbe::new(HostProbeConfig::default());
    let hostname = host.hostname();
    let membership = Arc::new(LocalMembership::new());
    let preparer = SpdkSetupScript::new(&cfg.spdk_setup_script).with_helper_env(cfg.helper_env());

    let deps = OrchestratorDeps {
        sysdb: Arc::new(LocalSystemDatabase::from_config(&cfg, &hostname).map_err(report_fault)?),
        membership: membership.clone(),
        joiner: membership,
        group_updater: Arc::new(LocalGroupUpdater::new()),
        forwarder: Arc::new(LoggingForwarder::new()),
        fabric: Arc::new(SysfsFabricResolver::default()),
        preparer: Arc::new(preparer),
        runner: Arc::new(ProcessRunner::new(&cfg.engine_binary)),
        host,
        user: TargetUser::current(),
    };

    let orchestrator = Orchestrator::new(cfg, deps).map_err(report_fault)?;
    if args.auto_format {
        orchestrator.format_all().map_err(report_fault)?;
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        signal_token.cancel();
    });

    orchestrator.start(shutdown).await.map_err(report_fault)?;

    info!("Engine Control Plane shutdown complete");
    Ok(())
}

/// Log a startup fault with its resolution hint
fn report_fault(err: Error) -> Error {
    error!("{}", err.report());
    err
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}
