pub mod bus;
pub mod config;
pub mod errors;
pub mod executor;
pub mod models;
pub mod reducer;
pub mod scheduler;
pub mod store;
pub mod timer;

pub use crate::bus::{Listener, Subscription, SubscriptionBus};
pub use crate::config::{load_variables, SchedulerSettings};
pub use crate::errors::{AppError, AppResult};
pub use crate::executor::{executor_fn, CommandExecutor, CommandSpec, ExecutorSet, QueryExecutor};
pub use crate::models::{MetricVariable, QueryMode, SchedulerState, VariableUpdate};
pub use crate::reducer::{Action, Effect};
pub use crate::scheduler::MetricScheduler;
pub use crate::timer::TimerKind;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub settings_path: Option<PathBuf>,
    pub variables_path: PathBuf,
    pub production: bool,
    pub duration: Option<std::time::Duration>,
}

/// Loads settings and variables, then refreshes until ctrl-c or `duration`.
pub async fn run(options: RunOptions) -> AppResult<()> {
    let settings = match &options.settings_path {
        Some(path) => SchedulerSettings::load(path)?,
        None => SchedulerSettings::default(),
    };
    init_tracing(settings.log_dir.as_deref().map(Path::new), &settings.log_level)?;

    let variables = load_variables(&options.variables_path)?;
    tracing::info!(
        count = variables.len(),
        path = %options.variables_path.display(),
        "loaded metric variables"
    );

    let executors = ExecutorSet::new(
        command_executor(settings.test_command.clone(), QueryMode::Test),
        command_executor(settings.production_command.clone(), QueryMode::Production),
    );
    let scheduler = MetricScheduler::new(settings, variables, executors)?;
    let _status = scheduler.subscribe(status_logger());

    scheduler.initialize();
    if options.production {
        scheduler.toggle_test_mode(false);
    } else {
        scheduler.toggle_running(true);
    }

    match options.duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                result = tokio::signal::ctrl_c() => result?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    scheduler.toggle_running(false);
    let state = scheduler.get_state();
    for variable in &state.variables {
        tracing::info!(
            variable_id = %variable.id,
            value = %variable.value,
            error = variable.error.as_deref().unwrap_or(""),
            "final metric value"
        );
    }
    Ok(())
}

fn command_executor(spec: Option<CommandSpec>, mode: QueryMode) -> QueryExecutor {
    match spec {
        Some(spec) => CommandExecutor::new(spec, mode).into_executor(),
        None => executor_fn(move |_| async move {
            Err::<String, AppError>(AppError::Query(format!(
                "no {} command configured",
                mode.as_str()
            )))
        }),
    }
}

fn status_logger() -> Listener {
    let last_status = Mutex::new(String::new());
    Arc::new(move |state: Arc<SchedulerState>| {
        let mut last = last_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == state.last_updated {
            return;
        }
        last.clone_from(&state.last_updated);
        tracing::info!(
            mode = state.mode.as_str(),
            running = state.is_running,
            status = %state.last_updated,
            "metric refresh status"
        );
    })
}

/// JSON logs to a daily rolling file under `log_dir`, or to stdout without one.
/// `RUST_LOG` overrides `default_level`.
pub fn init_tracing(log_dir: Option<&Path>, default_level: &str) -> AppResult<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let Some(log_dir) = log_dir else {
        return tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .map_err(|error| AppError::Internal(error.to_string()));
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "metric-refresh.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
