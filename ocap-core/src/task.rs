//! Task spawning for the single-threaded runtime.

use std::future::Future;

/// Provider trait for spawning local tasks.
///
/// Every per-peer connection driver and accept loop runs as one of these.
pub trait TaskProvider: Clone {
    /// Spawn a named task on the current thread.
    ///
    /// Must be called from inside a `tokio::task::LocalSet`.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;
}

/// Tokio-based task provider using `spawn_local`.
#[derive(Clone, Debug, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task_name = name.to_string();
        tokio::task::spawn_local(async move {
            tracing::trace!(task = %task_name, "task starting");
            future.await;
            tracing::trace!(task = %task_name, "task completed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[tokio::test]
    async fn test_spawned_task_runs_to_completion() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let ran = Rc::new(Cell::new(false));
                let flag = ran.clone();
                let handle = TokioTaskProvider.spawn_task("counter", async move {
                    flag.set(true);
                });
                handle.await.expect("join");
                assert!(ran.get());
            })
            .await;
    }
}
