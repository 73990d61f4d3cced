//! In-process registry of per-task cancellation handles.
//!
//! Only the worker actively running an attempt for a task inserts here, and
//! it removes itself on every exit path via [`RegistrationGuard`]. The HTTP
//! cancel path triggers the handle so an in-flight external command is
//! interrupted immediately instead of at the next poll.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Process-wide map from task id to the running attempt's cancel token.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the token for a task's running attempt, returning a guard
    /// that unregisters on drop. Overwrites any previous entry.
    pub fn register(
        self: &Arc<Self>,
        task_id: &str,
        token: CancellationToken,
    ) -> RegistrationGuard {
        self.inner
            .lock()
            .expect("cancel registry poisoned")
            .insert(task_id.to_string(), token);
        RegistrationGuard {
            registry: Arc::clone(self),
            task_id: task_id.to_string(),
        }
    }

    /// Trigger the registered handle for a task, if any. Returns whether a
    /// handle was found. The token is cancelled outside any lock-sensitive
    /// work; the registry holds no other state.
    pub fn cancel(&self, task_id: &str) -> bool {
        let token = {
            let map = self.inner.lock().expect("cancel registry poisoned");
            map.get(task_id).cloned()
        };
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn unregister(&self, task_id: &str) {
        self.inner
            .lock()
            .expect("cancel registry poisoned")
            .remove(task_id);
    }
}

/// Removes a task's registry entry when dropped, covering error paths the
/// same as success paths.
pub struct RegistrationGuard {
    registry: Arc<CancelRegistry>,
    task_id: String,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_triggers_registered_token() {
        let registry = Arc::new(CancelRegistry::new());
        let token = CancellationToken::new();
        let _guard = registry.register("t1", token.clone());

        assert!(registry.cancel("t1"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn missing_entry_is_a_noop() {
        let registry = Arc::new(CancelRegistry::new());
        assert!(!registry.cancel("unknown"));
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let registry = Arc::new(CancelRegistry::new());
        let token = CancellationToken::new();
        {
            let _guard = registry.register("t1", token.clone());
        }
        assert!(!registry.cancel("t1"));
        assert!(!token.is_cancelled());
    }
}
