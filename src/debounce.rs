/// Trailing-edge debouncer on the tokio runtime.
///
/// `schedule` (re)arms a timer; the action runs once the timer elapses with
/// no further calls. `flush` runs a pending action immediately.
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

pub type Task = Pin<Box<dyn Future<Output = ()> + Send>>;
type Action = Arc<dyn Fn() -> Task + Send + Sync>;

#[derive(Default)]
struct Pending {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

pub struct Debouncer {
    delay: Duration,
    action: Action,
    pending: Arc<Mutex<Pending>>,
}

impl Debouncer {
    pub fn new<F>(delay: Duration, action: F) -> Self
    where
        F: Fn() -> Task + Send + Sync + 'static,
    {
        Debouncer {
            delay,
            action: Arc::new(action),
            pending: Arc::new(Mutex::new(Pending::default())),
        }
    }

    /// Arms the timer, cancelling the previous one. Must run inside a tokio runtime.
    pub fn schedule(&self) {
        let Ok(mut pending) = self.pending.lock() else {
            warn!("Debouncer state poisoned, dropping call");
            return;
        };
        if let Some(previous) = pending.handle.take() {
            previous.abort();
        }
        pending.generation += 1;
        let generation = pending.generation;

        let delay = self.delay;
        let action = Arc::clone(&self.action);
        let state = Arc::clone(&self.pending);
        pending.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let Ok(mut pending) = state.lock() else {
                    return;
                };
                // A newer call re-armed the timer after this one woke up.
                if pending.generation != generation {
                    return;
                }
                pending.handle = None;
            }
            action().await;
        }));
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.handle.is_some())
            .unwrap_or(false)
    }

    /// Runs the pending action now. Returns false when nothing was pending.
    pub async fn flush(&self) -> bool {
        let armed = {
            let Ok(mut pending) = self.pending.lock() else {
                return false;
            };
            match pending.handle.take() {
                Some(handle) => {
                    handle.abort();
                    pending.generation += 1;
                    true
                }
                None => false,
            }
        };
        if armed {
            (self.action)().await;
        }
        armed
    }

    /// Drops the pending action without running it.
    pub fn cancel(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(handle) = pending.handle.take() {
                handle.abort();
            }
            pending.generation += 1;
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
