use crate::services::Scope;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Future produced by a work item's action.
pub type WorkFuture = BoxFuture<'static, anyhow::Result<()>>;

type PlainAction = Box<dyn FnOnce(CancellationToken) -> WorkFuture + Send>;
type ScopedAction =
    Box<dyn FnOnce(&Scope, CancellationToken) -> anyhow::Result<WorkFuture> + Send>;

/// What the runner has to do to execute an item.
pub enum WorkKind {
    /// Runs with only a cancellation token.
    Plain(PlainAction),
    /// Needs a fresh scope; the runner creates it, resolves the capability
    /// and disposes the scope once the action finishes.
    Scoped {
        capability: &'static str,
        action: ScopedAction,
    },
}

/// A unit of deferred work.
///
/// Items are immutable once built. Ownership moves producer -> queue -> runner,
/// and each item is executed at most once.
pub struct WorkItem {
    id: Uuid,
    label: Option<String>,
    kind: WorkKind,
}

impl WorkItem {
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            label: None,
            kind: WorkKind::Plain(Box::new(move |token: CancellationToken| {
                action(token).boxed()
            })),
        }
    }

    /// Build an item that requires capability `C` resolved from a fresh scope.
    pub fn scoped<C, F, Fut>(action: F) -> Self
    where
        C: Send + Sync + 'static,
        F: FnOnce(Arc<C>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: ScopedAction = Box::new(move |scope: &Scope, token: CancellationToken| {
            let capability = scope.resolve::<C>()?;
            Ok(action(capability, token).boxed())
        });
        Self {
            id: Uuid::new_v4(),
            label: None,
            kind: WorkKind::Scoped {
                capability: std::any::type_name::<C>(),
                action,
            },
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn is_scoped(&self) -> bool {
        matches!(self.kind, WorkKind::Scoped { .. })
    }

    pub fn into_kind(self) -> WorkKind {
        self.kind
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("WorkItem");
        s.field("id", &self.id).field("label", &self.label);
        if let WorkKind::Scoped { capability, .. } = &self.kind {
            s.field("capability", capability);
        }
        s.finish()
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} ({})", label, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}
