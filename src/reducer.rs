use crate::models::{MetricVariable, QueryMode, SchedulerState, VariableUpdate};
use crate::store::replace_variable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Initialize,
    SetTestMode(bool),
    SetRunning(bool),
    SetActiveRow(Option<usize>),
    UpdateVariable(VariableUpdate),
    SetVariables(Vec<MetricVariable>),
    SetLastUpdated(String),
    SetCurrentIndex(usize),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::SetTestMode(_) => "set-test-mode",
            Self::SetRunning(_) => "set-running",
            Self::SetActiveRow(_) => "set-active-row",
            Self::UpdateVariable(_) => "update-variable",
            Self::SetVariables(_) => "set-variables",
            Self::SetLastUpdated(_) => "set-last-updated",
            Self::SetCurrentIndex(_) => "set-current-index",
        }
    }
}

/// Side effects requested by a transition. The reducer never touches timers
/// itself; the scheduler applies these after storing the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Drop any pending tick or restart.
    CancelTimer,
    /// Release the single-flight guard held by the current cycle.
    ClearGuard,
    /// Results of cycles started before this point must not be committed.
    InvalidateInFlight,
    /// Re-enable the loop after the configured restart delay.
    ScheduleRestart,
    StartLoop,
}

pub fn reduce(state: &SchedulerState, action: Action) -> (SchedulerState, Vec<Effect>) {
    let mut next = state.clone();
    let mut effects = Vec::new();

    match action {
        Action::Initialize => {
            next.mode = QueryMode::Test;
            next.is_running = false;
            next.active_row = None;
            next.current_index = 0;
            next.scheduler_error = None;
            effects.extend([Effect::CancelTimer, Effect::ClearGuard, Effect::InvalidateInFlight]);
        }
        Action::SetTestMode(is_test) => {
            next.mode = QueryMode::from_test_flag(is_test);
            next.is_running = false;
            next.active_row = None;
            next.current_index = 0;
            effects.extend([Effect::CancelTimer, Effect::ClearGuard, Effect::InvalidateInFlight]);
            if !next.variables.is_empty() {
                effects.push(Effect::ScheduleRestart);
            }
        }
        Action::SetRunning(false) => {
            next.is_running = false;
            next.active_row = None;
            effects.extend([Effect::CancelTimer, Effect::ClearGuard]);
        }
        Action::SetRunning(true) => {
            next.is_running = true;
            effects.push(Effect::StartLoop);
        }
        Action::SetActiveRow(row) => {
            next.active_row = row;
        }
        Action::UpdateVariable(VariableUpdate::Metric { variable }) => {
            let id = variable.id.clone();
            let succeeded = variable.error.is_none();
            if replace_variable(&mut next.variables, variable) {
                if succeeded {
                    next.scheduler_error = None;
                }
            } else {
                tracing::warn!(variable_id = %id, "ignoring update for unknown metric variable");
            }
        }
        Action::UpdateVariable(VariableUpdate::SchedulerError { message }) => {
            next.scheduler_error = Some(message);
        }
        Action::SetVariables(variables) => {
            next.variables = variables;
            if next.active_row.is_some_and(|row| row >= next.variables.len()) {
                next.active_row = None;
            }
        }
        Action::SetLastUpdated(text) => {
            next.last_updated = text;
        }
        Action::SetCurrentIndex(index) => {
            next.current_index = index;
        }
    }

    (next, effects)
}

#[cfg(test)]
mod tests {
    use super::{reduce, Action, Effect};
    use crate::models::{MetricVariable, QueryMode, SchedulerState, VariableUpdate};

    fn running_state() -> SchedulerState {
        let mut state = SchedulerState::new(vec![
            MetricVariable::new("a", "A").with_test_expression("SELECT 1"),
            MetricVariable::new("b", "B").with_production_expression("SELECT 2"),
        ]);
        state.is_running = true;
        state.active_row = Some(1);
        state.current_index = 1;
        state
    }

    #[test]
    fn initialize_resets_flags_but_keeps_variables() {
        let mut state = running_state();
        state.mode = QueryMode::Production;
        state.scheduler_error = Some("boom".to_string());

        let (next, effects) = reduce(&state, Action::Initialize);
        assert_eq!(next.mode, QueryMode::Test);
        assert!(!next.is_running);
        assert_eq!(next.active_row, None);
        assert_eq!(next.current_index, 0);
        assert!(next.scheduler_error.is_none());
        assert_eq!(next.variables, state.variables);
        assert_eq!(
            effects,
            vec![Effect::CancelTimer, Effect::ClearGuard, Effect::InvalidateInFlight]
        );
    }

    #[test]
    fn mode_switch_quiesces_and_requests_restart() {
        let (next, effects) = reduce(&running_state(), Action::SetTestMode(false));
        assert_eq!(next.mode, QueryMode::Production);
        assert!(!next.is_running);
        assert_eq!(next.active_row, None);
        assert_eq!(next.current_index, 0);
        assert_eq!(
            effects,
            vec![
                Effect::CancelTimer,
                Effect::ClearGuard,
                Effect::InvalidateInFlight,
                Effect::ScheduleRestart
            ]
        );
    }

    #[test]
    fn mode_switch_without_variables_does_not_restart() {
        let (_, effects) = reduce(&SchedulerState::new(Vec::new()), Action::SetTestMode(false));
        assert!(!effects.contains(&Effect::ScheduleRestart));
    }

    #[test]
    fn stop_cancels_and_clears_active_row() {
        let (next, effects) = reduce(&running_state(), Action::SetRunning(false));
        assert!(!next.is_running);
        assert_eq!(next.active_row, None);
        assert_eq!(effects, vec![Effect::CancelTimer, Effect::ClearGuard]);

        let (start, effects) = reduce(&next, Action::SetRunning(true));
        assert!(start.is_running);
        assert_eq!(effects, vec![Effect::StartLoop]);
    }

    #[test]
    fn unknown_variable_updates_are_ignored() {
        let state = running_state();
        let (next, effects) = reduce(
            &state,
            Action::UpdateVariable(VariableUpdate::Metric {
                variable: MetricVariable::new("missing", "Missing"),
            }),
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn scheduler_errors_need_no_row_and_clear_on_success() {
        let state = running_state();
        let (failed, _) = reduce(
            &state,
            Action::UpdateVariable(VariableUpdate::SchedulerError {
                message: "executor panicked".to_string(),
            }),
        );
        assert_eq!(failed.scheduler_error.as_deref(), Some("executor panicked"));
        assert_eq!(failed.variables, state.variables);

        let mut refreshed = state.variables[0].clone();
        refreshed.value = "12".to_string();
        let (recovered, _) = reduce(
            &failed,
            Action::UpdateVariable(VariableUpdate::Metric { variable: refreshed }),
        );
        assert!(recovered.scheduler_error.is_none());
        assert_eq!(recovered.variables[0].value, "12");
    }

    #[test]
    fn shrinking_variables_drops_out_of_range_active_row() {
        let (next, _) = reduce(
            &running_state(),
            Action::SetVariables(vec![MetricVariable::new("only", "Only")]),
        );
        assert_eq!(next.variables.len(), 1);
        assert_eq!(next.active_row, None);
    }
}
