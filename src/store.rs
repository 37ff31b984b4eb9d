use crate::models::{MetricVariable, QueryMode};

/// The variable picked for one refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Position in the full variable list.
    pub row: usize,
    /// Round-robin cursor to store once this cycle completes.
    pub next_index: usize,
    pub variable: MetricVariable,
}

/// Full-list positions of every variable that can run in `mode`, in list order.
pub fn eligible_rows(variables: &[MetricVariable], mode: QueryMode) -> Vec<usize> {
    variables
        .iter()
        .enumerate()
        .filter(|(_, variable)| variable.is_eligible(mode))
        .map(|(row, _)| row)
        .collect()
}

/// Replaces the entry sharing `updated.id`. Returns false when no entry matches.
pub fn replace_variable(variables: &mut [MetricVariable], updated: MetricVariable) -> bool {
    match variables.iter_mut().find(|variable| variable.id == updated.id) {
        Some(slot) => {
            *slot = updated;
            true
        }
        None => false,
    }
}

pub fn select_next(
    variables: &[MetricVariable],
    mode: QueryMode,
    current_index: usize,
) -> Option<Selection> {
    let rows = eligible_rows(variables, mode);
    if rows.is_empty() {
        return None;
    }

    let eligible_count = rows.len();
    let cursor = current_index % eligible_count;
    let row = rows[cursor];
    Some(Selection {
        row,
        next_index: (cursor + 1) % eligible_count,
        variable: variables[row].clone(),
    })
}
