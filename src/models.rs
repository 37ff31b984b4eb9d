use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryMode {
    Test,
    Production,
}

impl QueryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Production => "production",
        }
    }

    pub fn from_test_flag(is_test: bool) -> Self {
        if is_test {
            Self::Test
        } else {
            Self::Production
        }
    }
}

/// One dashboard data point and the two query definitions that can feed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricVariable {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub test_expression: Option<String>,
    #[serde(default)]
    pub production_expression: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl MetricVariable {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value: String::new(),
            test_expression: None,
            production_expression: None,
            error: None,
            refreshed_at: None,
        }
    }

    pub fn with_test_expression(mut self, expression: impl Into<String>) -> Self {
        self.test_expression = Some(expression.into());
        self
    }

    pub fn with_production_expression(mut self, expression: impl Into<String>) -> Self {
        self.production_expression = Some(expression.into());
        self
    }

    /// Expression for `mode`, or `None` when it is missing or blank.
    pub fn expression(&self, mode: QueryMode) -> Option<&str> {
        let raw = match mode {
            QueryMode::Test => self.test_expression.as_deref(),
            QueryMode::Production => self.production_expression.as_deref(),
        };
        raw.map(str::trim).filter(|value| !value.is_empty())
    }

    pub fn is_eligible(&self, mode: QueryMode) -> bool {
        self.expression(mode).is_some()
    }
}

/// Payload of [`crate::reducer::Action::UpdateVariable`].
///
/// Scheduler-level failures get their own variant instead of a reserved
/// variable id, so they never collide with real rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum VariableUpdate {
    Metric { variable: MetricVariable },
    SchedulerError { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerState {
    pub variables: Vec<MetricVariable>,
    pub mode: QueryMode,
    pub is_running: bool,
    /// Index into `variables` (the full list) of the row being refreshed.
    pub active_row: Option<usize>,
    /// Round-robin cursor into the eligible subsequence for `mode`.
    pub current_index: usize,
    pub last_updated: String,
    pub scheduler_error: Option<String>,
}

impl SchedulerState {
    pub fn new(variables: Vec<MetricVariable>) -> Self {
        Self {
            variables,
            mode: QueryMode::Test,
            is_running: false,
            active_row: None,
            current_index: 0,
            last_updated: String::new(),
            scheduler_error: None,
        }
    }
}
