//! Concurrency Bridge.
//!
//! All network I/O and all motion monitoring run on one long-lived
//! execution context: a dedicated OS thread named `bcs-bridge` driving a
//! current-thread tokio runtime. Synchronous callers hand futures to it with
//! [`Bridge::block_on`] and park until the result comes back; async callers
//! talk to the same connections directly.
//!
//! ```text
//!   caller thread A ──┐                    ┌─────────── bcs-bridge thread ───────────┐
//!   caller thread B ──┼── block_on(fut) ──►│ current_thread runtime                   │
//!   async task C ─────┘                    │   Connection actor (one per Endpoint)    │
//!                                          │   motion monitors                        │
//!                                          └──────────────────────────────────────────┘
//! ```
//!
//! A blocking call issued from a thread that is already inside a tokio
//! runtime (including the bridge thread itself) is refused with
//! [`BridgeError::Reentrant`] instead of deadlocking.

pub mod connection;
pub mod pool;

pub use connection::{Connection, ConnectionState};
pub use pool::ConnectionPool;

use crate::error::{BridgeError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Thread name of the bridge execution context.
pub const BRIDGE_THREAD_NAME: &str = "bcs-bridge";

/// Handle to the bridge execution context. Cheap to clone; the context stops
/// when the last handle is dropped.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    handle: Handle,
    thread_id: thread::ThreadId,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Start the bridge thread and its runtime.
    pub fn start() -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(BRIDGE_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to create bridge runtime: {}", e);
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("bridge runtime stopping");
            })
            .map_err(|e| BridgeError::Runtime(format!("failed to spawn bridge thread: {e}")))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| BridgeError::Runtime("bridge thread exited during startup".into()))?
            .map_err(BridgeError::Runtime)?;

        info!("bridge execution context started");
        Ok(Self {
            inner: Arc::new(BridgeInner {
                handle,
                thread_id: thread.thread().id(),
                shutdown: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Runtime handle of the bridge context.
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Whether the current thread is the bridge thread.
    pub fn is_bridge_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Run `future` on the bridge and block the calling thread until it
    /// completes.
    ///
    /// Returns [`BridgeError::Reentrant`] when called from inside any tokio
    /// runtime, since parking that thread could starve the very runtime the
    /// result depends on.
    pub fn block_on<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_bridge_thread() || Handle::try_current().is_ok() {
            return Err(BridgeError::Reentrant);
        }

        let (tx, rx) = oneshot::channel();
        self.inner.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.blocking_recv()
            .map_err(|_| BridgeError::Runtime("bridge stopped before the call completed".into()))?
    }

    /// Spawn a background task on the bridge.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handle.spawn(future)
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("thread_id", &self.inner.thread_id)
            .finish()
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        // The last handle can be dropped by a task on the bridge itself.
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("bridge thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn block_on_runs_on_the_bridge_thread() {
        let bridge = Bridge::start().unwrap();
        let name = bridge
            .block_on(async { Ok(thread::current().name().map(str::to_string)) })
            .unwrap();
        assert_eq!(name.as_deref(), Some(BRIDGE_THREAD_NAME));
    }

    #[test]
    fn block_on_propagates_errors() {
        let bridge = Bridge::start().unwrap();
        let result: Result<()> = bridge.block_on(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(BridgeError::NoData {
                target: "AI 0".into(),
            })
        });
        assert!(matches!(result, Err(BridgeError::NoData { .. })));
    }

    #[tokio::test]
    async fn blocking_from_async_context_is_refused() {
        let bridge = tokio::task::spawn_blocking(Bridge::start)
            .await
            .unwrap()
            .unwrap();
        let result = bridge.block_on(async { Ok(1) });
        assert!(matches!(result, Err(BridgeError::Reentrant)));
        // Drop must happen off the runtime because it joins the bridge thread.
        tokio::task::spawn_blocking(move || drop(bridge)).await.unwrap();
    }

    #[test]
    fn blocking_from_bridge_thread_is_refused() {
        let bridge = Bridge::start().unwrap();
        let inner = bridge.clone();
        let nested = bridge
            .block_on(async move { Ok(inner.block_on(async { Ok(()) })) })
            .unwrap();
        assert!(matches!(nested, Err(BridgeError::Reentrant)));
    }
}
