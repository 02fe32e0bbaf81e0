use super::job::CorrelationId;
use crate::services::Scope;
use tokio_util::sync::CancellationToken;

/// Context provided to a job handler for one execution.
///
/// Owns the execution's dependency scope: services resolved from it are
/// disposed when the execution finishes.
pub struct JobContext {
    /// Unique per execution; also recorded on the `job_execution` span.
    pub correlation_id: CorrelationId,

    pub job_name: String,

    /// Fires when the scheduler is stopping.
    pub cancellation_token: CancellationToken,

    scope: Scope,
}

impl JobContext {
    pub fn new(
        correlation_id: CorrelationId,
        job_name: impl Into<String>,
        cancellation_token: CancellationToken,
        scope: Scope,
    ) -> Self {
        Self {
            correlation_id,
            job_name: job_name.into(),
            cancellation_token,
            scope,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Check if cancellation has been requested.
    ///
    /// Jobs should check this during long-running operations and return
    /// early when it is true.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
