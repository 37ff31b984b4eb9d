use crate::bus::{Listener, Subscription, SubscriptionBus};
use crate::config::SchedulerSettings;
use crate::errors::{AppError, AppResult};
use crate::executor::ExecutorSet;
use crate::models::{MetricVariable, QueryMode, SchedulerState, VariableUpdate};
use crate::reducer::{reduce, Action, Effect};
use crate::store::{select_next, Selection};
use crate::timer::{TaskTimer, TimerKind};
use chrono::{Local, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinError;
use tokio::time::{timeout, Duration};

type TickFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default)]
struct DispatchQueue {
    /// Thread currently running a dispatch, if any.
    owner: Option<ThreadId>,
    /// Actions dispatched by listeners of the running dispatch.
    deferred: VecDeque<Action>,
}

/// Marks the calling thread as the dispatch owner until dropped.
struct DispatchOwner<'a> {
    queue: &'a Mutex<DispatchQueue>,
}

impl<'a> DispatchOwner<'a> {
    fn claim(queue: &'a Mutex<DispatchQueue>, thread: ThreadId) -> Self {
        lock(queue).owner = Some(thread);
        Self { queue }
    }
}

impl Drop for DispatchOwner<'_> {
    fn drop(&mut self) {
        let mut queue = lock(self.queue);
        queue.owner = None;
        queue.deferred.clear();
    }
}

/// Counts a refresh cycle as outstanding until dropped.
struct CycleSlot {
    outstanding: Arc<AtomicUsize>,
}

impl CycleSlot {
    fn claim(outstanding: &Arc<AtomicUsize>) -> Self {
        outstanding.fetch_add(1, Ordering::SeqCst);
        Self {
            outstanding: outstanding.clone(),
        }
    }
}

impl Drop for CycleSlot {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Polls metric variables one at a time, round-robin, against the executor
/// for the current [`QueryMode`].
///
/// All state changes go through [`MetricScheduler::dispatch`]; every dispatch
/// notifies subscribers exactly once. Dispatches are serialized across
/// threads, so listeners see snapshots in the order they were reduced.
/// Clones share the same instance.
#[derive(Clone)]
pub struct MetricScheduler {
    state: Arc<Mutex<Arc<SchedulerState>>>,
    /// Held for the whole of one dispatch: reduce, effects and notify.
    serial: Arc<Mutex<()>>,
    queue: Arc<Mutex<DispatchQueue>>,
    bus: SubscriptionBus,
    timer: TaskTimer,
    /// Run epoch of the cycle currently holding the single-flight guard.
    guard: Arc<Mutex<Option<u64>>>,
    /// Advanced whenever the loop is stopped; ticks from older epochs exit.
    run_epoch: Arc<AtomicU64>,
    /// Run epoch that owns the live tick chain. At most one chain per epoch.
    loop_epoch: Arc<AtomicU64>,
    /// Advanced on mode switches; completions from older epochs are dropped.
    mode_epoch: Arc<AtomicU64>,
    /// Woken whenever `mode_epoch` advances, to cut a dwell short.
    mode_changed: Arc<Notify>,
    /// Cycles whose result has not been committed or discarded yet, whichever
    /// epoch started them.
    outstanding: Arc<AtomicUsize>,
    executors: ExecutorSet,
    settings: Arc<SchedulerSettings>,
    runtime: Handle,
}

impl MetricScheduler {
    /// Must be called from within a tokio runtime; timers and queries are
    /// spawned onto it.
    pub fn new(
        settings: SchedulerSettings,
        variables: Vec<MetricVariable>,
        executors: ExecutorSet,
    ) -> AppResult<Self> {
        settings.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            AppError::Internal("metric scheduler must be created inside a tokio runtime".to_string())
        })?;

        Ok(Self {
            state: Arc::new(Mutex::new(Arc::new(SchedulerState::new(variables)))),
            serial: Arc::new(Mutex::new(())),
            queue: Arc::new(Mutex::new(DispatchQueue::default())),
            bus: SubscriptionBus::new(),
            timer: TaskTimer::new(runtime.clone()),
            guard: Arc::new(Mutex::new(None)),
            run_epoch: Arc::new(AtomicU64::new(1)),
            loop_epoch: Arc::new(AtomicU64::new(0)),
            mode_epoch: Arc::new(AtomicU64::new(1)),
            mode_changed: Arc::new(Notify::new()),
            outstanding: Arc::new(AtomicUsize::new(0)),
            executors,
            settings: Arc::new(settings),
            runtime,
        })
    }

    pub fn get_state(&self) -> Arc<SchedulerState> {
        lock(&self.state).clone()
    }

    pub fn subscribe(&self, listener: Listener) -> Subscription {
        self.bus.subscribe(listener)
    }

    /// Kind of the job waiting on the timer, if any.
    pub fn tick_scheduled(&self) -> Option<TimerKind> {
        self.timer.scheduled()
    }

    /// Whether a refresh cycle holds the single-flight guard or a cycle from
    /// a stopped run has not finished yet.
    pub fn in_flight(&self) -> bool {
        lock(&self.guard).is_some() || self.outstanding.load(Ordering::SeqCst) > 0
    }

    /// Reduces `action`, applies its effects and notifies subscribers before
    /// any other dispatch starts. A dispatch issued from a listener of a
    /// running dispatch is queued and runs right after it, before the outer
    /// call returns.
    pub fn dispatch(&self, action: Action) {
        let thread = std::thread::current().id();
        {
            let mut queue = lock(&self.queue);
            if queue.owner == Some(thread) {
                queue.deferred.push_back(action);
                return;
            }
        }

        let _serial = lock(&self.serial);
        let _owner = DispatchOwner::claim(&self.queue, thread);
        let mut next = Some(action);
        while let Some(action) = next.take() {
            self.process(action);
            next = lock(&self.queue).deferred.pop_front();
        }
    }

    fn process(&self, action: Action) {
        let name = action.name();
        let (snapshot, effects) = {
            let mut current = lock(&self.state);
            let (next, effects) = reduce(&current, action);
            let next = Arc::new(next);
            *current = next.clone();
            (next, effects)
        };
        tracing::trace!(action = name, "scheduler action applied");

        for effect in effects {
            self.apply(effect);
        }
        self.bus.notify(&snapshot);
    }

    /// The `Initialize` transition cancels the timer, clears the guard and
    /// invalidates in-flight results as part of the same dispatch.
    pub fn initialize(&self) {
        self.dispatch(Action::Initialize);
        tracing::info!("metric scheduler initialized");
    }

    pub fn toggle_test_mode(&self, is_test: bool) {
        tracing::info!(test_mode = is_test, "switching query mode");
        self.dispatch(Action::SetTestMode(is_test));
    }

    pub fn toggle_running(&self, running: bool) {
        tracing::info!(running, "toggling metric refresh");
        self.dispatch(Action::SetRunning(running));
    }

    pub fn set_variables(&self, variables: Vec<MetricVariable>) {
        tracing::debug!(count = variables.len(), "replacing metric variables");
        self.dispatch(Action::SetVariables(variables));
    }

    fn apply(&self, effect: Effect) {
        match effect {
            Effect::CancelTimer => {
                self.timer.cancel();
            }
            Effect::ClearGuard => self.clear_guard(),
            Effect::InvalidateInFlight => {
                self.mode_epoch.fetch_add(1, Ordering::SeqCst);
                self.mode_changed.notify_waiters();
            }
            Effect::ScheduleRestart => {
                let scheduler = self.clone();
                self.timer.schedule(
                    TimerKind::Restart,
                    self.settings.restart_delay(),
                    move || async move {
                        tracing::debug!("restarting metric refresh after mode switch");
                        scheduler.dispatch(Action::SetRunning(true));
                    },
                );
            }
            Effect::StartLoop => self.ensure_loop(),
        }
    }

    fn clear_guard(&self) {
        self.run_epoch.fetch_add(1, Ordering::SeqCst);
        *lock(&self.guard) = None;
    }

    /// Starts a tick chain for the current run epoch unless one already exists.
    fn ensure_loop(&self) {
        if !self.get_state().is_running {
            return;
        }
        let epoch = self.run_epoch.load(Ordering::SeqCst);
        if self.loop_epoch.swap(epoch, Ordering::SeqCst) == epoch {
            return;
        }
        self.schedule_tick(epoch, Duration::ZERO);
    }

    fn schedule_tick(&self, epoch: u64, delay: Duration) {
        let scheduler = self.clone();
        self.timer
            .schedule(TimerKind::Tick, delay, move || scheduler.tick(epoch));
    }

    fn tick(self, epoch: u64) -> TickFuture {
        Box::pin(async move {
            if self.run_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }

            let mode_epoch = self.mode_epoch.load(Ordering::SeqCst);
            let state = self.get_state();
            if !state.is_running {
                let _ = self
                    .loop_epoch
                    .compare_exchange(epoch, 0, Ordering::SeqCst, Ordering::SeqCst);
                return;
            }

            let selection = {
                let mut guard = lock(&self.guard);
                if guard.is_some() || self.outstanding.load(Ordering::SeqCst) > 0 {
                    None
                } else {
                    let selection = select_next(&state.variables, state.mode, state.current_index);
                    if selection.is_some() {
                        *guard = Some(epoch);
                    }
                    selection
                }
            };

            let Some(selection) = selection else {
                if !self.in_flight() {
                    let status = format!("No {} queries to run", state.mode.as_str());
                    if state.last_updated != status {
                        self.dispatch(Action::SetLastUpdated(status));
                    }
                }
                self.schedule_tick(epoch, self.settings.tick_interval());
                return;
            };

            self.run_cycle(&state, mode_epoch, selection).await;
            self.finish_cycle(epoch);
        })
    }

    async fn run_cycle(&self, state: &SchedulerState, mode_epoch: u64, selection: Selection) {
        let _slot = CycleSlot::claim(&self.outstanding);
        let mode = state.mode;
        let variable_id = selection.variable.id.clone();
        let name = selection.variable.name.clone();

        self.dispatch(Action::SetActiveRow(Some(selection.row)));
        self.dispatch(Action::SetLastUpdated(format!("Updating {name}...")));
        tracing::debug!(
            variable_id = %variable_id,
            mode = mode.as_str(),
            row = selection.row,
            "refreshing metric variable"
        );

        let outcome = self.execute(mode, selection.variable.clone()).await;
        if !self.dwell(mode_epoch).await {
            tracing::debug!(
                variable_id = %variable_id,
                mode = mode.as_str(),
                "discarding result from previous query mode"
            );
            return;
        }

        let mut variable = self
            .get_state()
            .variables
            .iter()
            .find(|candidate| candidate.id == variable_id)
            .cloned()
            .unwrap_or(selection.variable);

        let status = match outcome {
            Ok(Ok(value)) => {
                variable.value = value;
                variable.error = None;
                variable.refreshed_at = Some(Utc::now());
                self.dispatch(Action::UpdateVariable(VariableUpdate::Metric { variable }));
                format!("Updated {name} at {}", Local::now().format("%H:%M:%S"))
            }
            Ok(Err(error)) => {
                tracing::warn!(variable_id = %variable_id, error = %error, "metric query failed");
                variable.error = Some(error.to_string());
                self.dispatch(Action::UpdateVariable(VariableUpdate::Metric { variable }));
                format!("Failed {name} at {}", Local::now().format("%H:%M:%S"))
            }
            Err(error) => {
                let message = describe_join_error(&name, &error);
                tracing::error!(variable_id = %variable_id, error = %error, "query executor aborted");
                self.dispatch(Action::UpdateVariable(VariableUpdate::SchedulerError {
                    message: message.clone(),
                }));
                message
            }
        };

        self.dispatch(Action::SetCurrentIndex(selection.next_index));
        self.dispatch(Action::SetActiveRow(None));
        self.dispatch(Action::SetLastUpdated(status));
    }

    /// Holds the active row for the dwell time. Returns false, possibly early,
    /// once the mode epoch has moved past `mode_epoch`.
    async fn dwell(&self, mode_epoch: u64) -> bool {
        let changed = self.mode_changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();
        if self.mode_epoch.load(Ordering::SeqCst) != mode_epoch {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.settings.dwell()) => {}
            _ = &mut changed => {}
        }
        self.mode_epoch.load(Ordering::SeqCst) == mode_epoch
    }

    /// Runs the query on its own task so a panicking executor cannot take the
    /// loop down with it. A stop does not cancel the call; until its cycle
    /// finishes no other cycle may start.
    async fn execute(
        &self,
        mode: QueryMode,
        variable: MetricVariable,
    ) -> Result<AppResult<String>, JoinError> {
        let executor = self.executors.for_mode(mode);
        let mut call = self.runtime.spawn(async move { executor(variable).await });

        match self.settings.query_timeout() {
            None => call.await,
            Some(limit) => match timeout(limit, &mut call).await {
                Ok(joined) => joined,
                Err(_) => {
                    call.abort();
                    Ok(Err(AppError::Query(format!(
                        "query timed out after {}ms",
                        limit.as_millis()
                    ))))
                }
            },
        }
    }

    fn finish_cycle(&self, epoch: u64) {
        {
            let mut guard = lock(&self.guard);
            if *guard == Some(epoch) {
                *guard = None;
            }
        }

        if self.run_epoch.load(Ordering::SeqCst) == epoch && self.get_state().is_running {
            self.schedule_tick(epoch, self.settings.tick_interval());
        }
    }
}

fn describe_join_error(name: &str, error: &JoinError) -> String {
    if error.is_panic() {
        format!("query executor panicked while refreshing {name}")
    } else {
        format!("query for {name} was cancelled")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
