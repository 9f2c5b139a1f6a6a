//! Iris -- local vision-language desktop agent gateway.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use iris_agent::NullActuator;
use iris_bus::EventBus;
use iris_gateway::{
    load_or_create_key, serve, GatewayState, Heartbeat, InstanceLock, RateLimiter, ServeError,
    Supervisor,
};
use iris_types::{config as paths, IrisConfig, IrisError};
use iris_vlm::VlmManager;

/// Exit codes documented for service wrappers.
const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_PORT_IN_USE: u8 = 2;
const EXIT_ALREADY_RUNNING: u8 = 3;

/// Iris -- gateway for the vision-language desktop agent.
#[derive(Parser, Debug)]
#[command(name = "iris", version, about)]
struct Cli {
    /// Increase logging verbosity (same as RUST_LOG=debug)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Path to settings.yaml (defaults to <iris home>/config/settings.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway (the default when no subcommand is given)
    Serve,
    /// Print the resolved public configuration and exit
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(paths::settings_path);

    let config = match IrisConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "cannot load configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config => {
            match serde_json::to_string_pretty(&config.public_view()) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    error!(error = %e, "cannot render configuration");
                    return ExitCode::from(EXIT_CONFIG);
                }
            }
            ExitCode::from(EXIT_OK)
        }
        Commands::Serve => run_serve(config, config_path),
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_serve(config: IrisConfig, config_path: PathBuf) -> ExitCode {
    // One supervisor per host.
    let _lock = match InstanceLock::acquire(paths::lock_path()) {
        Ok(lock) => lock,
        Err(IrisError::Blocked(reason)) => {
            error!(reason, "refusing to start");
            return ExitCode::from(EXIT_ALREADY_RUNNING);
        }
        Err(e) => {
            error!(error = %e, "cannot acquire instance lock");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let api_key = match load_or_create_key(&paths::api_key_path()) {
        Ok(key) => key,
        Err(e) => {
            error!(error = %e, "cannot load or create api key");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    runtime.block_on(async move {
        let cancel = CancellationToken::new();

        let bus = EventBus::new(config.chat.history_limit);
        let running = Arc::new(AtomicBool::new(false));
        let vlm = VlmManager::new(
            config.vlm.clone(),
            paths::root_dir(),
            paths::logs_dir().join("vlm_server.log"),
            bus.clone(),
            Arc::clone(&running),
        );
        tokio::spawn(Arc::clone(&vlm).run(cancel.child_token()));

        let supervisor = Supervisor::new(
            config.clone(),
            bus,
            vlm,
            Arc::new(NullActuator),
            running,
            config_path,
        );

        let heartbeat = Heartbeat::new(config.heartbeat.clone(), paths::heartbeat_path());
        tokio::spawn(Arc::clone(&supervisor).run_heartbeat(heartbeat, cancel.child_token()));

        // Bring the agent worker up eagerly; guards may refuse.
        let outcome = supervisor.start_agent().await;
        if outcome.is_blocked() {
            warn!(reason = ?outcome.reason, "agent worker not started");
        }

        let state = Arc::new(GatewayState {
            supervisor: Arc::clone(&supervisor),
            api_key,
            limiter: RateLimiter::new(
                config.limits.general_rpm,
                config.limits.lifecycle_rpm,
            ),
        });

        // Ctrl-C triggers a clean shutdown.
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    cancel.cancel();
                }
            });
        }

        let result = serve(state, cancel.clone()).await;
        cancel.cancel();
        supervisor.stop_agent().await;

        match result {
            Ok(()) => {
                info!("gateway stopped");
                ExitCode::from(EXIT_OK)
            }
            Err(ServeError::PortInUse(addr)) => {
                error!(addr, "listen port already in use");
                ExitCode::from(EXIT_PORT_IN_USE)
            }
            Err(e) => {
                error!(error = %e, "gateway failed");
                ExitCode::from(EXIT_CONFIG)
            }
        }
    })
}
