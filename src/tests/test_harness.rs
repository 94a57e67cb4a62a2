//! Shared scaffolding for the socket tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

/// Best-effort tracing init; only the first test to call this wins, the
/// rest get a [crate::error::FabricError::StateMisuse] which is fine.
pub fn init_logging() {
    let _ = crate::logging::init_subscribers();
}

/// A oneshot sender that can be fired from inside a `Fn` event handler.
pub fn oneshot_slot<T>() -> (Arc<Mutex<Option<oneshot::Sender<T>>>>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(Mutex::new(Some(tx))), rx)
}

pub fn fire_slot<T>(slot: &Arc<Mutex<Option<oneshot::Sender<T>>>>, value: T) {
    if let Some(tx) = slot.lock().expect("slot lock poisoned").take() {
        let _ = tx.send(value);
    }
}

/// Polls `check` until it holds or the budget runs out.
pub async fn wait_until(budget: Duration, what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("gave up waiting for {what} after {budget:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn loopback() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().expect("loopback address parses")
}
