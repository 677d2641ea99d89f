mod config;
mod coordinator;
mod kube;
mod observer;
mod ports;
mod process;
mod status;
mod supervisor;
mod ui_handlers;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;
use crate::kube::{KubectlForwarder, KubectlProbe};
use crate::ui_handlers::{GrpcUiManager, NoopUiManager, SwaggerUiManager, UiHandler};

// Stamped by the release build; absent in local builds.
const COMMIT: Option<&str> = option_env!("KPF_COMMIT");
const BUILD_DATE: Option<&str> = option_env!("KPF_BUILD_DATE");

#[derive(Parser, Debug)]
#[command(
    name = "kportforward",
    version,
    about = "Supervises kubectl port-forward tunnels with auto-recovery and a terminal dashboard"
)]
struct Args {
    /// Run a gRPC inspector UI for every running rpc service
    #[arg(long)]
    grpcui: bool,

    /// Run a Swagger UI container for every running rest service
    #[arg(long)]
    swaggerui: bool,

    /// Write logs to a file instead of standard error
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(Command::Version) = args.command {
        println!("kportforward {}", env!("CARGO_PKG_VERSION"));
        println!("commit: {}", COMMIT.unwrap_or("none"));
        println!("built: {}", BUILD_DATE.unwrap_or("unknown"));
        return ExitCode::SUCCESS;
    }

    if let Err(err) = init_logger(args.log_file.as_deref()) {
        eprintln!("failed to initialize logging: {:#}", err);
        return ExitCode::from(1);
    }

    // Panics in background tasks would otherwise vanish behind the
    // dashboard's alternate screen.
    std::panic::set_hook(Box::new(|info| {
        log::error!("internal panic: {}", info);
    }));

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load configuration: {:#}", err);
            return ExitCode::from(1);
        }
    };
    info!(
        "starting kportforward with {} services",
        cfg.port_forwards.len()
    );

    let ui_handlers = build_ui_handlers(args.grpcui, args.swaggerui).await;
    let coordinator = Coordinator::new(
        &cfg,
        Arc::new(KubectlForwarder),
        Arc::new(KubectlProbe),
        ui_handlers,
    );

    match coordinator.clone().start().await {
        Ok(0) => {}
        Ok(failed) => warn!("{} services failed to start and will be retried", failed),
        Err(err) => {
            error!("failed to start port forwarding: {:#}", err);
            return ExitCode::from(1);
        }
    }

    let cancel = coordinator.cancel_token();
    tokio::spawn(wait_for_shutdown_signal(cancel.clone()));

    // The dashboard owns the foreground; everything else runs on the
    // runtime behind it.
    let rx = coordinator.subscribe();
    let refresh = cfg.refresh_rate();
    let observer_task =
        tokio::task::spawn_blocking(move || observer::run(rx, cancel, refresh));
    let observer_result = observer_task.await;

    coordinator.shutdown().await;

    match observer_result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            error!("dashboard error: {:#}", err);
            ExitCode::from(2)
        }
        Err(err) => {
            error!("dashboard thread panicked: {}", err);
            ExitCode::from(2)
        }
    }
}

/// Each flag gets the real manager only if its external tooling checks
/// out; otherwise (and when the flag is off) an inert stand-in takes the
/// slot so downstream code never branches on presence.
async fn build_ui_handlers(grpcui: bool, swaggerui: bool) -> Vec<Arc<dyn UiHandler>> {
    let mut handlers: Vec<Arc<dyn UiHandler>> = Vec::new();

    if grpcui {
        let manager = GrpcUiManager::new();
        match manager.enable().await {
            Ok(()) => handlers.push(Arc::new(manager)),
            Err(err) => {
                warn!("gRPC UI disabled: {:#}", err);
                handlers.push(Arc::new(NoopUiManager::new("grpcui")));
            }
        }
    } else {
        handlers.push(Arc::new(NoopUiManager::new("grpcui")));
    }

    if swaggerui {
        let manager = SwaggerUiManager::new();
        match manager.enable().await {
            Ok(()) => handlers.push(Arc::new(manager)),
            Err(err) => {
                warn!("Swagger UI disabled: {:#}", err);
                handlers.push(Arc::new(NoopUiManager::new("swaggerui")));
            }
        }
    } else {
        handlers.push(Arc::new(NoopUiManager::new("swaggerui")));
    }

    handlers
}

fn init_logger(log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

/// SIGINT arrives as a key event while the dashboard holds the raw
/// terminal, so this mostly catches SIGTERM and headless SIGINT.
async fn wait_for_shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("received shutdown signal, stopping services");
    cancel.cancel();
}
