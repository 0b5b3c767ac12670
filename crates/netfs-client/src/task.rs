//! Fire-and-forget background jobs.

use std::sync::Arc;

use async_trait::async_trait;
use netfs_types::{RPCCode, Result, Status};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A job run once on its own tokio task.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn name(&self) -> String;

    async fn execute(&self) -> Result<()>;

    /// Runs instead of a successful `execute`: when it fails, when the task
    /// could not be started, or when shutdown interrupts it. The owner uses
    /// it to undo whatever it set up before launching the task.
    fn cleanup(&self, error: Status);
}

/// Runs tasks and stops them all at shutdown.
pub struct TaskManager {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            shutdown_tx: watch::channel(false).0,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Start `task`. After shutdown the task is not run and only its
    /// `cleanup` is called.
    pub fn run_task(&self, task: Arc<dyn Task>) -> Result<()> {
        if self.is_shut_down() {
            let status = Status::with_message(RPCCode::SHUTTING_DOWN, "task manager stopped");
            task.cleanup(status.clone());
            return Err(status);
        }
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let name = task.name();
            tokio::select! {
                res = task.execute() => match res {
                    Ok(()) => tracing::debug!(task = %name, "task done"),
                    Err(error) => {
                        tracing::debug!(task = %name, %error, "task failed");
                        task.cleanup(error);
                    }
                },
                _ = shutdown.wait_for(|stop| *stop) => {
                    tracing::debug!(task = %name, "task interrupted");
                    task.cleanup(Status::new(RPCCode::SHUTTING_DOWN));
                }
            }
        });
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Interrupt every running task and wait until they are gone.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use netfs_types::StatusCode;

    use super::*;

    struct Probe {
        fail: bool,
        wait: Duration,
        ran: AtomicUsize,
        cleaned: Mutex<Vec<u16>>,
    }

    impl Probe {
        fn new(fail: bool, wait: Duration) -> Arc<Self> {
            Arc::new(Self {
                fail,
                wait,
                ran: AtomicUsize::new(0),
                cleaned: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Task for Probe {
        fn name(&self) -> String {
            "probe".into()
        }

        async fn execute(&self) -> Result<()> {
            tokio::time::sleep(self.wait).await;
            self.ran.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Status::new(StatusCode::IO_ERROR));
            }
            Ok(())
        }

        fn cleanup(&self, error: Status) {
            self.cleaned.lock().push(error.code());
        }
    }

    #[tokio::test]
    async fn test_success_skips_cleanup() {
        let tasks = TaskManager::new();
        let probe = Probe::new(false, Duration::ZERO);
        tasks.run_task(probe.clone()).unwrap();
        tasks.shutdown().await;
        assert_eq!(probe.ran.load(Ordering::SeqCst), 1);
        assert!(probe.cleaned.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failure_runs_cleanup() {
        let tasks = TaskManager::new();
        let probe = Probe::new(true, Duration::ZERO);
        tasks.run_task(probe.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*probe.cleaned.lock(), vec![StatusCode::IO_ERROR]);
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_and_refuses() {
        let tasks = TaskManager::new();
        let slow = Probe::new(false, Duration::from_secs(60));
        tasks.run_task(slow.clone()).unwrap();
        tasks.shutdown().await;
        assert_eq!(slow.ran.load(Ordering::SeqCst), 0);
        assert_eq!(*slow.cleaned.lock(), vec![RPCCode::SHUTTING_DOWN]);

        let late = Probe::new(false, Duration::ZERO);
        assert!(tasks.run_task(late.clone()).is_err());
        assert_eq!(*late.cleaned.lock(), vec![RPCCode::SHUTTING_DOWN]);
    }
}
