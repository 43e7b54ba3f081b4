use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use once_cell::sync::Lazy;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
static ROOT_CONTEXT: Lazy<CallingContext> = Lazy::new(|| CallingContext {
    id: ContextId(0),
    token: None,
});

/// Unique calling context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Unit of execution owning an RPC client.
///
/// The context is alive while the handle exists. Dropping it tells the client's consumer loop
/// to close the connection and exit.
/// The root context lives for the whole process.
pub struct CallingContext {
    id: ContextId,
    /// Liveness token. `None` for the root context
    token: Option<Arc<()>>,
}

impl CallingContext {
    pub fn new() -> Self {
        Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            token: Some(Arc::new(())),
        }
    }

    /// Process-wide root context, which never ends
    pub fn root() -> &'static CallingContext {
        &ROOT_CONTEXT
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.token.is_none()
    }

    /// Weak handle to watch the context lifetime
    pub fn watch(&self) -> ContextWatch {
        match &self.token {
            Some(token) => ContextWatch::Scoped(Arc::downgrade(token)),
            None => ContextWatch::Root,
        }
    }
}

impl Default for CallingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallingContext")
            .field("id", &self.id)
            .field("root", &self.is_root())
            .finish()
    }
}

/// Watches whether a [CallingContext] is still alive, without keeping it alive
#[derive(Debug, Clone)]
pub enum ContextWatch {
    Root,
    Scoped(Weak<()>),
}

impl ContextWatch {
    pub fn is_alive(&self) -> bool {
        match self {
            ContextWatch::Root => true,
            ContextWatch::Scoped(token) => token.strong_count() > 0,
        }
    }
}
