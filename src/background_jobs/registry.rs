use super::job::{JobHandler, JobParams};
use crate::services::Scope;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler is already registered for {job_type}")]
    DuplicateHandler { job_type: &'static str },

    #[error("no handler registered for {job_type}")]
    HandlerNotRegistered { job_type: &'static str },
}

/// Builds the handler for one execution from that execution's scope.
pub type HandlerFactory<P> =
    Arc<dyn Fn(&Scope) -> anyhow::Result<Arc<dyn JobHandler<P>>> + Send + Sync>;

/// Execution bookkeeping shared by every scheduler of one job type.
#[derive(Debug, Default)]
pub struct JobExecutionState {
    /// Held while a single-instance execution runs.
    locked: AtomicBool,
    active: AtomicUsize,
}

impl JobExecutionState {
    /// Take the single-instance lock. `None` when another execution holds it.
    pub fn try_lock(self: &Arc<Self>) -> Option<SingleInstanceGuard> {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SingleInstanceGuard {
                state: Arc::clone(self),
            })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Count an execution as in flight until the returned guard is dropped.
    pub fn begin_execution(self: &Arc<Self>) -> ActiveExecution {
        self.active.fetch_add(1, Ordering::AcqRel);
        ActiveExecution {
            state: Arc::clone(self),
        }
    }

    pub fn active_executions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Releases the single-instance lock on drop, on every exit path.
#[derive(Debug)]
pub struct SingleInstanceGuard {
    state: Arc<JobExecutionState>,
}

impl Drop for SingleInstanceGuard {
    fn drop(&mut self) {
        self.state.locked.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct ActiveExecution {
    state: Arc<JobExecutionState>,
}

impl Drop for ActiveExecution {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything a scheduler needs to run one job type.
pub struct JobBinding<P: JobParams> {
    pub job_type: &'static str,
    pub factory: HandlerFactory<P>,
    pub state: Arc<JobExecutionState>,
}

impl<P: JobParams> Clone for JobBinding<P> {
    fn clone(&self) -> Self {
        Self {
            job_type: self.job_type,
            factory: Arc::clone(&self.factory),
            state: Arc::clone(&self.state),
        }
    }
}

struct Registration {
    job_type: &'static str,
    // Holds a `HandlerFactory<P>` for the `P` keyed by the map entry.
    factory: Box<dyn Any + Send + Sync>,
    state: Arc<JobExecutionState>,
}

/// Explicit map from a job's params type to its handler.
///
/// Each params type has exactly one handler and one `JobExecutionState`.
#[derive(Default)]
pub struct JobRegistry {
    registrations: HashMap<TypeId, Registration>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler built per execution by `factory`.
    pub fn register<P, H, F>(&mut self, factory: F) -> Result<(), RegistryError>
    where
        P: JobParams,
        H: JobHandler<P> + 'static,
        F: Fn(&Scope) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory: HandlerFactory<P> = Arc::new(move |scope: &Scope| {
            factory(scope).map(|handler| Arc::new(handler) as Arc<dyn JobHandler<P>>)
        });
        self.insert::<P>(factory)
    }

    /// Register a single handler instance shared by every execution.
    pub fn register_instance<P, H>(&mut self, handler: Arc<H>) -> Result<(), RegistryError>
    where
        P: JobParams,
        H: JobHandler<P> + 'static,
    {
        let handler: Arc<dyn JobHandler<P>> = handler;
        let factory: HandlerFactory<P> = Arc::new(move |_: &Scope| Ok(Arc::clone(&handler)));
        self.insert::<P>(factory)
    }

    fn insert<P: JobParams>(&mut self, factory: HandlerFactory<P>) -> Result<(), RegistryError> {
        let job_type = type_name::<P>();
        if self.registrations.contains_key(&TypeId::of::<P>()) {
            return Err(RegistryError::DuplicateHandler { job_type });
        }
        self.registrations.insert(
            TypeId::of::<P>(),
            Registration {
                job_type,
                factory: Box::new(factory),
                state: Arc::new(JobExecutionState::default()),
            },
        );
        Ok(())
    }

    pub fn is_registered<P: JobParams>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<P>())
    }

    pub fn job_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.registrations.values().map(|r| r.job_type).collect();
        types.sort_unstable();
        types
    }

    /// Look up the handler for `P`.
    pub fn binding<P: JobParams>(&self) -> Result<JobBinding<P>, RegistryError> {
        let not_registered = || RegistryError::HandlerNotRegistered {
            job_type: type_name::<P>(),
        };
        let registration = self
            .registrations
            .get(&TypeId::of::<P>())
            .ok_or_else(not_registered)?;
        let factory = registration
            .factory
            .downcast_ref::<HandlerFactory<P>>()
            .ok_or_else(not_registered)?;

        Ok(JobBinding {
            job_type: registration.job_type,
            factory: Arc::clone(factory),
            state: Arc::clone(&registration.state),
        })
    }
}
