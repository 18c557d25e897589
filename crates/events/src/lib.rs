use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use airlock_contracts::SystemEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerError(pub String);

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ListenerError {}

pub type EventHandler = Arc<dyn Fn(&SystemEvent) -> Result<(), ListenerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// In-process, synchronous fan-out of [`SystemEvent`]s by name.
///
/// Handlers for one name run in registration order on the dispatching
/// thread. A handler that errors or panics is logged and skipped; the
/// remaining handlers still run.
#[derive(Default)]
pub struct NotificationBus {
    listeners: RwLock<HashMap<String, Vec<EventHandler>>>,
    closed: AtomicBool,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<EventHandler>>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<EventHandler>>> {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false once the bus has been shut down.
    pub fn add_event_listener<F>(&self, name: &str, handler: F) -> bool
    where
        F: Fn(&SystemEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.write()
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(handler));
        true
    }

    pub fn dispatch_event(&self, event: &SystemEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        if self.closed.load(Ordering::Acquire) {
            return report;
        }

        // Snapshot so handlers may touch the bus without deadlocking.
        let handlers = self.read().get(event.name()).cloned().unwrap_or_default();

        for (position, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| (**handler)(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    tracing::warn!(
                        event_name = event.name(),
                        event_id = %event.header.id,
                        position,
                        error = %err,
                        "event listener failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!(
                        event_name = event.name(),
                        event_id = %event.header.id,
                        position,
                        "event listener panicked"
                    );
                }
            }
        }

        report
    }

    /// Drops every handler registered for `name`; returns how many.
    pub fn remove_event_listeners(&self, name: &str) -> usize {
        self.write().remove(name).map(|h| h.len()).unwrap_or(0)
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.read().get(name).map(Vec::len).unwrap_or(0)
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("NotificationBus")
            .field("names", &names)
            .field("closed", &self.is_closed())
            .finish()
    }
}
