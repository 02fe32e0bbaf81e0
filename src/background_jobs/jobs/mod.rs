//! Job handlers shipped with the worker.

pub mod heartbeat;
pub mod stale_file_cleanup;

pub use heartbeat::{HeartbeatJob, HeartbeatParams};
pub use stale_file_cleanup::{StaleFileCleanupJob, StaleFileCleanupParams};

use super::{JobRegistry, RegistryError};
use crate::task_queue::QueueHandle;

/// Register every shipped handler.
pub fn register_builtin_jobs(registry: &mut JobRegistry) -> Result<(), RegistryError> {
    registry.register::<HeartbeatParams, _, _>(|scope| {
        Ok(HeartbeatJob::new(scope.resolve::<QueueHandle>().ok()))
    })?;
    registry.register::<StaleFileCleanupParams, _, _>(|scope| {
        Ok(StaleFileCleanupJob::new(scope.resolve::<QueueHandle>()?))
    })?;
    Ok(())
}
