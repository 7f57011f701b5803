//! `superplane` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    run the API and the engine workers.
//! - `worker`   run the engine workers only.
//! - `migrate`  run pending database migrations.
//! - `validate` validate a canvas file and print its stage order.
//! - `apply`    validate a canvas file and create it.

mod config;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use api::AppState;
use engine::{
    apply_canvas, validate_canvas, CanvasFile, EngineConfig, NoOpEncryptor, Runtime, Services,
    WorkerSet,
};
use executors::ExecutorRegistry;

use config::{BackendArgs, EngineArgs};

#[derive(Parser)]
#[command(name = "superplane", about = "Stage progression engine for delivery canvases", version)]
struct Cli {
    /// Log filter, overrides RUST_LOG (e.g. `info`, `engine=debug`).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP API and the enabled workers.
    Serve {
        #[arg(long, env = "BIND", default_value = "0.0.0.0:8000")]
        bind: String,

        #[arg(long, env = "START_API", default_value_t = true, action = clap::ArgAction::Set)]
        start_api: bool,

        /// Canvas file applied before the workers start.
        #[arg(long)]
        canvas: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Start the enabled workers without the HTTP API.
    Worker {
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,
    },
    /// Validate a canvas file.
    Validate {
        /// Path to the canvas JSON file.
        path: PathBuf,
    },
    /// Validate a canvas file and create everything it declares.
    Apply {
        /// Path to the canvas JSON file.
        path: PathBuf,

        #[command(flatten)]
        backend: BackendArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    match cli.command {
        Command::Serve { bind, start_api, canvas, engine: args } => {
            let services = args.services().await?;
            if let Some(path) = canvas {
                apply_file(&services, &path).await?;
            }

            let runtime = Runtime::start(services.clone(), WorkerSet::from(&args.workers));
            if start_api {
                info!("starting API server on {bind}");
                api::serve(&bind, AppState::from(&services), shutdown_signal())
                    .await
                    .context("API server failed")?;
            } else {
                shutdown_signal().await;
            }
            runtime.shutdown().await;
        }
        Command::Worker { engine: args } => {
            let services = args.services().await?;
            let runtime = Runtime::start(services, WorkerSet::from(&args.workers));
            shutdown_signal().await;
            runtime.shutdown().await;
        }
        Command::Migrate { database_url } => {
            info!("running migrations");
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("migrations applied successfully");
        }
        Command::Validate { path } => {
            let canvas = read_canvas(&path)?;
            let executors = ExecutorRegistry::with_builtin(EngineConfig::default().executor_timeout)?;
            match validate_canvas(&canvas, &executors) {
                Ok(order) => println!("canvas '{}' is valid. Stage order: {order:?}", canvas.name),
                Err(e) => {
                    eprintln!("validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Apply { path, backend } => {
            let canvas = read_canvas(&path)?;
            let executors = ExecutorRegistry::with_builtin(EngineConfig::default().executor_timeout)?;
            let (store, bus) = backend.connect().await?;
            let applied = apply_canvas(
                store.as_ref(),
                bus.as_ref(),
                &NoOpEncryptor,
                &executors,
                &canvas,
            )
            .await?;

            println!("canvas {} created", applied.canvas_id);
            for (name, id) in &applied.sources {
                println!("  source {name}: {id}");
            }
            for (name, id) in &applied.stages {
                println!("  stage  {name}: {id}");
            }
        }
    }

    Ok(())
}

fn init_tracing(level: Option<&str>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn read_canvas(path: &Path) -> anyhow::Result<CanvasFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    CanvasFile::from_json(&content).with_context(|| format!("invalid canvas {}", path.display()))
}

async fn apply_file(services: &Services, path: &Path) -> anyhow::Result<()> {
    let canvas = read_canvas(path)?;
    let applied = apply_canvas(
        services.store.as_ref(),
        services.bus.as_ref(),
        services.encryptor.as_ref(),
        &services.executors,
        &canvas,
    )
    .await?;
    info!(canvas_id = %applied.canvas_id, stages = applied.stages.len(), "canvas applied");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(err) => error!(error = %err, "failed to listen for ctrl-c"),
    }
}
