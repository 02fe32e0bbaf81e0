use super::context::JobContext;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use uuid::Uuid;

/// Job-specific settings carried next to the common schedule fields.
///
/// Implemented for every type that can be read from a `[jobs.<name>]` table
/// and compared between reloads.
pub trait JobParams:
    Clone + PartialEq + fmt::Debug + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> JobParams for T where
    T: Clone + PartialEq + fmt::Debug + DeserializeOwned + Send + Sync + 'static
{
}

/// Params for jobs that need nothing beyond the schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NoParams {}

fn default_sleep_interval_seconds() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

/// Settings of one scheduled job, as read from configuration.
///
/// A scheduler reads a fresh snapshot at the start of every cycle; an
/// execution keeps the snapshot it started with.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobConfig<P> {
    /// Defaults to the key of the `[jobs.<name>]` table.
    #[serde(default)]
    pub job_name: String,
    pub cron_expression: String,
    /// Upper bound on a single sleep and the retry delay after an invalid
    /// cron expression.
    #[serde(default = "default_sleep_interval_seconds")]
    pub sleep_interval_seconds: u64,
    /// Drop triggers that fire while a previous execution is still running.
    #[serde(default)]
    pub lock_single_instance: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub params: P,
}

impl<P: JobParams> JobConfig<P> {
    pub fn new(job_name: impl Into<String>, cron_expression: impl Into<String>, params: P) -> Self {
        Self {
            job_name: job_name.into(),
            cron_expression: cron_expression.into(),
            sleep_interval_seconds: default_sleep_interval_seconds(),
            lock_single_instance: false,
            enabled: true,
            params,
        }
    }

    #[must_use]
    pub fn with_sleep_interval_seconds(mut self, secs: u64) -> Self {
        self.sleep_interval_seconds = secs;
        self
    }

    #[must_use]
    pub fn with_lock_single_instance(mut self, lock: bool) -> Self {
        self.lock_single_instance = lock;
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Read a job table. An empty `job_name` is replaced by `name`.
    pub fn from_toml(name: &str, value: toml::Value) -> Result<Self> {
        let mut config: Self = value
            .try_into()
            .with_context(|| format!("Invalid settings for job '{}'", name))?;
        if config.job_name.is_empty() {
            config.job_name = name.to_string();
        }
        Ok(config)
    }

    pub fn sleep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sleep_interval_seconds.max(1))
    }
}

/// Identifier threaded through one execution and all of its log output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Work performed once per trigger of a scheduled job.
///
/// A handler is built from the execution's scope right before it runs, so
/// its dependencies follow scope lifetime. Long-running handlers should
/// watch `ctx.cancellation_token` and return early when it fires.
#[async_trait]
pub trait JobHandler<P: JobParams>: Send + Sync {
    async fn execute(&self, ctx: &JobContext, config: &JobConfig<P>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct ReportParams {
        recipients: Vec<String>,
        #[serde(default)]
        verbose: bool,
    }

    #[test]
    fn test_from_toml_with_params() {
        let value: toml::Value = toml::from_str(
            r#"
            cron_expression = "0 0 8 * * *"
            lock_single_instance = true
            recipients = ["ops@example.com"]
            "#,
        )
        .unwrap();

        let config = JobConfig::<ReportParams>::from_toml("daily_report", value).unwrap();
        assert_eq!(config.job_name, "daily_report");
        assert_eq!(config.cron_expression, "0 0 8 * * *");
        assert_eq!(config.sleep_interval_seconds, 60);
        assert!(config.lock_single_instance);
        assert!(config.enabled);
        assert_eq!(config.params.recipients, vec!["ops@example.com"]);
        assert!(!config.params.verbose);
    }

    #[test]
    fn test_from_toml_keeps_explicit_name() {
        let value: toml::Value = toml::from_str(
            r#"
            job_name = "Custom"
            cron_expression = "*/5 * * * * *"
            sleep_interval_seconds = 2
            enabled = false
            "#,
        )
        .unwrap();

        let config = JobConfig::<NoParams>::from_toml("key", value).unwrap();
        assert_eq!(config.job_name, "Custom");
        assert_eq!(config.sleep_interval_seconds, 2);
        assert!(!config.enabled);
    }

    #[test]
    fn test_from_toml_rejects_missing_cron() {
        let value: toml::Value = toml::from_str("lock_single_instance = true").unwrap();
        let err = JobConfig::<NoParams>::from_toml("broken", value).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_sleep_interval_has_floor() {
        let config =
            JobConfig::new("job", "* * * * * *", NoParams {}).with_sleep_interval_seconds(0);
        assert_eq!(config.sleep_interval(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
