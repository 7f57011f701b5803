//! Process settings. Every flag falls back to an environment variable.

use std::sync::Arc;

use anyhow::Context;
use clap::{Args, ValueEnum};

use bus::{Bus, MemoryBus, PgBus};
use db::{DbPool, MemoryStore, PgStore, Store};
use engine::{EngineConfig, Services, TokenSigner, WorkerSet};
use executors::ExecutorRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Postgres,
    Memory,
}

/// Where state lives and how workers talk to each other.
#[derive(Debug, Args)]
pub struct BackendArgs {
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    pub database_max_connections: u32,

    #[arg(long, env = "STORE", value_enum, default_value_t = Backend::Postgres)]
    pub store: Backend,

    #[arg(long, env = "BUS", value_enum, default_value_t = Backend::Postgres)]
    pub bus: Backend,
}

impl BackendArgs {
    pub async fn connect(&self) -> anyhow::Result<(Arc<dyn Store>, Arc<dyn Bus>)> {
        let pool = if self.store == Backend::Postgres || self.bus == Backend::Postgres {
            Some(self.pool().await?)
        } else {
            None
        };

        let store: Arc<dyn Store> = match (&pool, self.store) {
            (Some(pool), Backend::Postgres) => Arc::new(PgStore::new(pool.clone())),
            _ => Arc::new(MemoryStore::new()),
        };
        let bus: Arc<dyn Bus> = match (&pool, self.bus) {
            (Some(pool), Backend::Postgres) => Arc::new(PgBus::new(pool.clone())),
            _ => Arc::new(MemoryBus::new()),
        };
        Ok((store, bus))
    }

    pub async fn pool(&self) -> anyhow::Result<DbPool> {
        let url = self.database_url.as_deref().context("DATABASE_URL is required")?;
        db::pool::create_pool(url, self.database_max_connections)
            .await
            .context("failed to connect to database")
    }
}

/// Everything a worker process needs besides its backends.
#[derive(Debug, Args)]
pub struct EngineArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Secret used to sign execution tokens.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Offset from UTC, in minutes, used for time-window conditions.
    #[arg(long, env = "TIME_WINDOW_UTC_OFFSET_MINUTES", default_value_t = 0, allow_negative_numbers = true)]
    pub time_window_utc_offset_minutes: i32,

    #[command(flatten)]
    pub workers: WorkerFlags,
}

impl EngineArgs {
    pub async fn services(&self) -> anyhow::Result<Services> {
        if self.jwt_secret.is_empty() {
            anyhow::bail!("JWT_SECRET must not be empty");
        }
        let config =
            EngineConfig::default().with_time_window_offset_minutes(self.time_window_utc_offset_minutes);
        let executors = ExecutorRegistry::with_builtin(config.executor_timeout)
            .context("failed to build executor adapters")?;
        let (store, bus) = self.backend.connect().await?;

        Ok(Services::new(store, bus, executors, TokenSigner::new(&self.jwt_secret))
            .with_config(config))
    }
}

#[derive(Debug, Args)]
pub struct WorkerFlags {
    #[arg(long, env = "START_ROUTER", default_value_t = true, action = clap::ArgAction::Set)]
    pub start_router: bool,

    #[arg(long, env = "START_GATE_EVALUATOR", default_value_t = true, action = clap::ArgAction::Set)]
    pub start_gate_evaluator: bool,

    #[arg(long, env = "START_DISPATCHER", default_value_t = true, action = clap::ArgAction::Set)]
    pub start_dispatcher: bool,

    #[arg(long, env = "START_RECONCILER", default_value_t = true, action = clap::ArgAction::Set)]
    pub start_reconciler: bool,

    #[arg(long, env = "START_APPROVAL_LISTENER", default_value_t = true, action = clap::ArgAction::Set)]
    pub start_approval_listener: bool,

    #[arg(long, env = "START_TIME_WINDOW_LISTENER", default_value_t = true, action = clap::ArgAction::Set)]
    pub start_time_window_listener: bool,
}

impl From<&WorkerFlags> for WorkerSet {
    fn from(flags: &WorkerFlags) -> Self {
        Self {
            router: flags.start_router,
            gate_evaluator: flags.start_gate_evaluator,
            dispatcher: flags.start_dispatcher,
            reconciler: flags.start_reconciler,
            approval_listener: flags.start_approval_listener,
            time_window_listener: flags.start_time_window_listener,
        }
    }
}
