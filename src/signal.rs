//! Process-wide running flag and the termination signal listener.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug)]
struct Inner {
    running: AtomicBool,
    notify: Notify,
}

/// Cleared once to ask the relay loop to stop. Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct RunningFlag {
    inner: Arc<Inner>,
}

impl Default for RunningFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningFlag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(true),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        while self.is_running() {
            self.inner.notify.notified().await;
        }
    }
}

/// Spawns a task that clears `flag` on SIGTERM or SIGINT.
pub fn install_termination_handler(flag: RunningFlag) -> io::Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("Received SIGTERM"),
            _ = int.recv() => info!("Received SIGINT"),
        }
        flag.stop();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flag_starts_running() {
        let flag = RunningFlag::new();
        assert!(flag.is_running());
        let other = flag.clone();
        other.stop();
        assert!(!flag.is_running());
    }

    #[tokio::test]
    async fn test_stopped_wakes_waiter() {
        let flag = RunningFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });
        tokio::task::yield_now().await;
        flag.stop();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stopped_after_stop_returns_immediately() {
        let flag = RunningFlag::new();
        flag.stop();
        tokio::time::timeout(Duration::from_millis(100), flag.stopped()).await.unwrap();
    }
}
