use crate::errors::{AppError, AppResult};
use crate::executor::CommandSpec;
use crate::models::MetricVariable;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSettings {
    /// Gap between the end of one refresh cycle and the next tick.
    pub tick_interval_ms: u64,
    /// Minimum time a row stays active after its query resolves.
    pub dwell_ms: u64,
    /// Pause between a mode switch and the automatic restart.
    pub restart_delay_ms: u64,
    /// Unset means queries may run indefinitely.
    pub query_timeout_ms: Option<u64>,
    pub log_level: String,
    pub log_dir: Option<String>,
    pub test_command: Option<CommandSpec>,
    pub production_command: Option<CommandSpec>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            dwell_ms: 500,
            restart_delay_ms: 100,
            query_timeout_ms: None,
            log_level: "info".to_string(),
            log_dir: None,
            test_command: None,
            production_command: None,
        }
    }
}

impl SchedulerSettings {
    /// Reads a JSON settings file. Keys missing from the file keep their defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.is_file() {
            return Err(AppError::NotFound(format!("settings file {}", path.display())));
        }
        let raw = std::fs::read_to_string(path)?;
        let patch: serde_json::Value = serde_json::from_str(&raw)?;
        Self::default().update(patch)
    }

    pub fn update(&self, patch: serde_json::Value) -> AppResult<Self> {
        let mut merged = serde_json::to_value(self)?;
        merge_json(&mut merged, patch);
        let settings: Self = serde_json::from_value(merged)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(AppError::Config("tickIntervalMs must be greater than zero".to_string()));
        }
        if self.query_timeout_ms == Some(0) {
            return Err(AppError::Config("queryTimeoutMs must be greater than zero when set".to_string()));
        }
        for (key, command) in [
            ("testCommand", &self.test_command),
            ("productionCommand", &self.production_command),
        ] {
            if command.as_ref().is_some_and(|spec| spec.program.trim().is_empty()) {
                return Err(AppError::Config(format!("{key}.program must not be empty")));
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }
}

/// Loads the seed variable list from a `.json`, `.yaml` or `.yml` file.
pub fn load_variables(path: &Path) -> AppResult<Vec<MetricVariable>> {
    if !path.is_file() {
        return Err(AppError::NotFound(format!("variables file {}", path.display())));
    }
    let raw = std::fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case("yaml") || value.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let variables: Vec<MetricVariable> = if is_yaml {
        serde_yaml::from_str(&raw)?
    } else {
        serde_json::from_str(&raw)?
    };

    let mut seen = HashSet::new();
    for variable in &variables {
        if variable.id.trim().is_empty() {
            return Err(AppError::Config(format!("variable '{}' has an empty id", variable.name)));
        }
        if !seen.insert(variable.id.as_str()) {
            return Err(AppError::Config(format!("duplicate variable id '{}'", variable.id)));
        }
    }
    Ok(variables)
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
