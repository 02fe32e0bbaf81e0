//! Minimal service resolution used to give work items and job executions
//! their own scope.
//!
//! A `ServiceProvider` holds registrations (singletons and scoped factories).
//! Each call to `create_scope` returns a fresh `Scope`; scoped services are
//! built lazily on first `resolve` and live exactly as long as that scope.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

type Instance = Arc<dyn Any + Send + Sync>;
type ScopedFactory = Arc<dyn Fn(&Scope) -> anyhow::Result<Instance> + Send + Sync>;

/// Errors returned when a service cannot be resolved from a scope.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no service registered for {type_name}")]
    NotRegistered { type_name: &'static str },

    #[error("failed to construct {type_name}: {source}")]
    Factory {
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

enum Registration {
    Singleton(Instance),
    Scoped(ScopedFactory),
}

/// Registry of services that scopes resolve from.
pub struct ServiceProvider {
    registrations: HashMap<TypeId, Registration>,
}

impl ServiceProvider {
    pub fn builder() -> ServiceProviderBuilder {
        ServiceProviderBuilder {
            registrations: HashMap::new(),
        }
    }

    /// Provider with no registrations. Plain work items never touch it.
    pub fn empty() -> Arc<Self> {
        Self::builder().build()
    }

    /// Create a fresh scope. Dropping the scope disposes every scoped service
    /// it created, in reverse creation order.
    pub fn create_scope(self: &Arc<Self>) -> Scope {
        let scope = Scope {
            id: Uuid::new_v4(),
            provider: Arc::clone(self),
            instances: Mutex::new(Vec::new()),
        };
        debug!(scope = %scope.id, "created service scope");
        scope
    }

    pub fn is_registered<T: 'static>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<T>())
    }
}

pub struct ServiceProviderBuilder {
    registrations: HashMap<TypeId, Registration>,
}

impl ServiceProviderBuilder {
    /// Register a shared instance handed out to every scope.
    #[must_use]
    pub fn add_singleton<T: Send + Sync + 'static>(mut self, instance: Arc<T>) -> Self {
        self.registrations
            .insert(TypeId::of::<T>(), Registration::Singleton(instance));
        self
    }

    /// Register a factory invoked at most once per scope.
    ///
    /// The factory receives the scope being built so it can resolve its own
    /// dependencies from it.
    #[must_use]
    pub fn add_scoped<T, F>(mut self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Scope) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let factory: ScopedFactory =
            Arc::new(move |scope: &Scope| factory(scope).map(|value| Arc::new(value) as Instance));
        self.registrations
            .insert(TypeId::of::<T>(), Registration::Scoped(factory));
        self
    }

    pub fn build(self) -> Arc<ServiceProvider> {
        Arc::new(ServiceProvider {
            registrations: self.registrations,
        })
    }
}

/// A unit of service lifetime: one per work item or job execution.
pub struct Scope {
    id: Uuid,
    provider: Arc<ServiceProvider>,
    // Kept in creation order so disposal can run in reverse.
    instances: Mutex<Vec<(TypeId, Instance)>>,
}

impl Scope {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resolve `T`, constructing it if it is scoped and not yet built here.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolveError> {
        let type_id = TypeId::of::<T>();
        let registration = self
            .provider
            .registrations
            .get(&type_id)
            .ok_or(ResolveError::NotRegistered {
                type_name: type_name::<T>(),
            })?;

        let instance = match registration {
            Registration::Singleton(instance) => Arc::clone(instance),
            Registration::Scoped(factory) => {
                if let Some(existing) = self.cached(type_id) {
                    existing
                } else {
                    // The lock is not held while the factory runs: factories
                    // may resolve other services from this scope.
                    let created = factory(self).map_err(|source| ResolveError::Factory {
                        type_name: type_name::<T>(),
                        source,
                    })?;
                    self.store(type_id, created)
                }
            }
        };

        instance
            .downcast::<T>()
            .map_err(|_| ResolveError::NotRegistered {
                type_name: type_name::<T>(),
            })
    }

    fn cached(&self, type_id: TypeId) -> Option<Instance> {
        let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instances
            .iter()
            .find(|(id, _)| *id == type_id)
            .map(|(_, instance)| Arc::clone(instance))
    }

    fn store(&self, type_id: TypeId, created: Instance) -> Instance {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        // A nested resolve may have raced us to it; first one wins.
        if let Some((_, existing)) = instances.iter().find(|(id, _)| *id == type_id) {
            return Arc::clone(existing);
        }
        instances.push((type_id, Arc::clone(&created)));
        created
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let instances = self.instances.get_mut().unwrap_or_else(|e| e.into_inner());
        let count = instances.len();
        while let Some(instance) = instances.pop() {
            drop(instance);
        }
        debug!(scope = %self.id, disposed = count, "disposed service scope");
    }
}
