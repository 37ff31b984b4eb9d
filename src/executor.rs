use crate::errors::{AppError, AppResult};
use crate::models::{MetricVariable, QueryMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

pub type QueryFuture = Pin<Box<dyn Future<Output = AppResult<String>> + Send>>;
pub type QueryExecutor = Arc<dyn Fn(MetricVariable) -> QueryFuture + Send + Sync>;

const EXPRESSION_PLACEHOLDER: &str = "{expression}";

/// Wraps an async closure as a [`QueryExecutor`].
pub fn executor_fn<F, Fut>(executor: F) -> QueryExecutor
where
    F: Fn(MetricVariable) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<String>> + Send + 'static,
{
    Arc::new(move |variable: MetricVariable| -> QueryFuture { Box::pin(executor(variable)) })
}

/// The two query backends, one per [`QueryMode`].
#[derive(Clone)]
pub struct ExecutorSet {
    test: QueryExecutor,
    production: QueryExecutor,
}

impl ExecutorSet {
    pub fn new(test: QueryExecutor, production: QueryExecutor) -> Self {
        Self { test, production }
    }

    pub fn for_mode(&self, mode: QueryMode) -> QueryExecutor {
        match mode {
            QueryMode::Test => self.test.clone(),
            QueryMode::Production => self.production.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Runs an external CLI per query and uses its trimmed stdout as the value.
///
/// Every `{expression}` in `args` is replaced by the variable's expression for
/// this executor's mode; without a placeholder the expression is appended as
/// the final argument.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    spec: CommandSpec,
    mode: QueryMode,
}

impl CommandExecutor {
    pub fn new(spec: CommandSpec, mode: QueryMode) -> Self {
        Self { spec, mode }
    }

    pub fn build_args(&self, expression: &str) -> Vec<String> {
        let mut substituted = false;
        let mut args = self
            .spec
            .args
            .iter()
            .map(|arg| {
                if arg.contains(EXPRESSION_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(EXPRESSION_PLACEHOLDER, expression)
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>();
        if !substituted {
            args.push(expression.to_string());
        }
        args
    }

    pub async fn execute(&self, variable: &MetricVariable) -> AppResult<String> {
        let expression = variable.expression(self.mode).ok_or_else(|| {
            AppError::Query(format!(
                "{} has no {} expression",
                variable.name,
                self.mode.as_str()
            ))
        })?;

        let mut command = Command::new(&self.spec.program);
        command
            .args(self.build_args(expression))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.spec.env {
            command.env(key, value);
        }

        let output = command
            .output()
            .await
            .map_err(|err| AppError::Query(format!("failed to start {}: {}", self.spec.program, err)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(AppError::Query(if stderr.is_empty() {
                format!("{} exited with status {:?}", self.spec.program, output.status.code())
            } else {
                stderr
            }));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            return Err(AppError::Query("query returned no output".to_string()));
        }
        Ok(stdout)
    }

    pub fn into_executor(self) -> QueryExecutor {
        let executor = Arc::new(self);
        executor_fn(move |variable| {
            let executor = executor.clone();
            async move { executor.execute(&variable).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandExecutor, CommandSpec, ExecutorSet, executor_fn};
    use crate::errors::AppError;
    use crate::models::{MetricVariable, QueryMode};

    fn spec(program: &str, args: &[&str]) -> CommandSpec {
        CommandSpec {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            ..CommandSpec::default()
        }
    }

    #[test]
    fn substitutes_placeholder_or_appends_expression() {
        let with_placeholder =
            CommandExecutor::new(spec("sqlcmd", &["-Q", "SET NOCOUNT ON; {expression}"]), QueryMode::Test);
        assert_eq!(
            with_placeholder.build_args("SELECT 1"),
            vec!["-Q", "SET NOCOUNT ON; SELECT 1"]
        );

        let appended = CommandExecutor::new(spec("sqlite3", &["test.db"]), QueryMode::Test);
        assert_eq!(appended.build_args("SELECT 1"), vec!["test.db", "SELECT 1"]);
    }

    #[tokio::test]
    async fn executor_set_routes_by_mode() {
        let set = ExecutorSet::new(
            executor_fn(|_| async { Ok("test".to_string()) }),
            executor_fn(|_| async { Ok("production".to_string()) }),
        );
        let variable = MetricVariable::new("a", "A");
        assert_eq!(set.for_mode(QueryMode::Test)(variable.clone()).await.expect("test"), "test");
        assert_eq!(
            set.for_mode(QueryMode::Production)(variable).await.expect("production"),
            "production"
        );
    }

    #[tokio::test]
    async fn missing_expression_is_a_query_error() {
        let executor = CommandExecutor::new(spec("echo", &[]), QueryMode::Production);
        let variable = MetricVariable::new("a", "Active rentals").with_test_expression("SELECT 1");
        let err = executor.execute(&variable).await.expect_err("no production expression");
        assert!(matches!(err, AppError::Query(_)));
        assert_eq!(err.to_string(), "Active rentals has no production expression");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_trimmed_stdout() {
        let executor = CommandExecutor::new(spec("echo", &[]), QueryMode::Test).into_executor();
        let variable = MetricVariable::new("a", "A").with_test_expression("1234");
        assert_eq!(executor(variable).await.expect("echo output"), "1234");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn surfaces_stderr_on_failure() {
        let executor = CommandExecutor::new(
            spec("sh", &["-c", "echo \"bad query: $0\" >&2; exit 3", "{expression}"]),
            QueryMode::Test,
        );
        let variable = MetricVariable::new("a", "A").with_test_expression("SELEC 1");
        let err = executor.execute(&variable).await.expect_err("non-zero exit");
        assert_eq!(err.to_string(), "bad query: SELEC 1");
    }
}
