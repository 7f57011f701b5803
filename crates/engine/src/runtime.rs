//! Spawns the enabled workers and stops them together.

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::context::Services;
use crate::workers::{
    ApprovalListener, Dispatcher, GateEvaluator, Reconciler, Router, TimeWindowListener,
};

/// Which workers this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSet {
    pub router: bool,
    pub gate_evaluator: bool,
    pub dispatcher: bool,
    pub reconciler: bool,
    pub approval_listener: bool,
    pub time_window_listener: bool,
}

impl WorkerSet {
    pub fn all() -> Self {
        Self {
            router: true,
            gate_evaluator: true,
            dispatcher: true,
            reconciler: true,
            approval_listener: true,
            time_window_listener: true,
        }
    }

    pub fn none() -> Self {
        Self {
            router: false,
            gate_evaluator: false,
            dispatcher: false,
            reconciler: false,
            approval_listener: false,
            time_window_listener: false,
        }
    }
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Running workers. Dropping the runtime does not stop them; call
/// [`Runtime::shutdown`].
pub struct Runtime {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Runtime {
    pub fn start(services: Services, workers: WorkerSet) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        if workers.router {
            tasks.spawn(Router::new(services.clone()).run(rx.clone()));
        }
        if workers.gate_evaluator {
            tasks.spawn(GateEvaluator::new(services.clone()).run(rx.clone()));
        }
        if workers.dispatcher {
            tasks.spawn(Dispatcher::new(services.clone()).run(rx.clone()));
        }
        if workers.reconciler {
            tasks.spawn(Reconciler::new(services.clone()).run(rx.clone()));
        }
        if workers.approval_listener {
            tasks.spawn(ApprovalListener::new(services.clone()).run(rx.clone()));
        }
        if workers.time_window_listener {
            tasks.spawn(TimeWindowListener::new(services).run(rx));
        }

        info!(workers = tasks.len(), "runtime started");
        Self { shutdown, tasks }
    }

    /// A receiver that flips to `true` on shutdown, for tasks living
    /// alongside the workers.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal every worker and wait for their in-flight ticks to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
        info!("runtime stopped");
    }
}
