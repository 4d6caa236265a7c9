//! Page unload hooks.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Handle returned by `PageLifecycle::on_unload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnloadHandlerId(u64);

type UnloadHandler = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct LifecycleInner {
    next_id: u64,
    handlers: Vec<(UnloadHandlerId, UnloadHandler)>,
}

/// The tab's `beforeunload` registry.
///
/// Each handler runs at most once: either on `unload()` or never, if it was
/// detached first.
#[derive(Clone, Default)]
pub struct PageLifecycle {
    inner: Arc<Mutex<LifecycleInner>>,
}

impl PageLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_unload(&self, handler: impl FnOnce() + Send + 'static) -> UnloadHandlerId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = UnloadHandlerId(inner.next_id);
        inner.handlers.push((id, Box::new(handler)));
        id
    }

    /// Detach a handler. Returns `false` if it already ran or was detached.
    pub fn detach(&self, id: UnloadHandlerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.handlers.len();
        inner.handlers.retain(|(h, _)| *h != id);
        inner.handlers.len() != before
    }

    /// Fire every attached handler. Handlers run outside the registry lock,
    /// so they may detach or register handlers themselves.
    pub fn unload(&self) {
        let handlers = std::mem::take(&mut self.inner.lock().handlers);
        debug!(count = handlers.len(), "Page unloading");
        for (_, handler) in handlers {
            handler();
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner.lock().handlers.len()
    }
}
