//! Callback plumbing shared by the TCP and UDP fabrics.
//!
//! Subscribers are stored as a list of `Arc`'d closures. Invocation takes a
//! snapshot of the list first, so a handler can subscribe or clear handlers
//! on the same object without deadlocking the list lock, and handlers added
//! mid-invoke only see the next event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use crate::error::FabricError;

pub struct Callbacks<F: ?Sized> {
    list: Mutex<Vec<Arc<F>>>,
}

impl<F: ?Sized> Default for Callbacks<F> {
    fn default() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> Callbacks<F> {
    pub fn subscribe(&self, callback: Arc<F>) {
        self.lock().push(callback);
    }

    /// Copy-on-invoke: the returned list is detached from the live one.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<F>>> {
        // a panicking handler must not wedge the list for everyone else
        self.list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Run one user callback with panic containment, so a misbehaving handler
/// can never take down a receive or accept loop. The panic payload comes
/// back as [FabricError::UserCallback] for the error event channel.
pub fn guard_callback<R>(f: impl FnOnce() -> R) -> Result<R, FabricError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| {
        let message = if let Some(text) = panic.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = panic.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        FabricError::UserCallback(message)
    })
}
