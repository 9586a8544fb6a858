//! Graceful shutdown coordination.
//!
//! Every long-running task (scraper source loops, the manager's expiry
//! loop, check/label workers, the block-list GC, the supervisor, the API
//! listener) registers here and selects against its receiver in its own
//! `tokio::select!`. A signal broadcasts to all of them at once; the caller
//! decides how long to wait before giving up on stragglers.

use log::{info, warn};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

#[derive(Debug, Clone, Copy)]
pub enum ShutdownReason {
    UserInterrupt,
    Maintenance,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
        }
    }
}

pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    active_tasks: Arc<RwLock<HashMap<String, ()>>>,
    config: ShutdownConfig,
}

impl ShutdownManager {
    pub fn new(config: ShutdownConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(64);
        Self {
            shutdown_tx,
            active_tasks: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Register a task for cooperative shutdown; returns a receiver the
    /// task should select against.
    pub async fn register_task(&self, task_name: String) -> mpsc::Receiver<ShutdownReason> {
        let (tx, rx) = mpsc::channel(1);
        self.active_tasks.write().await.insert(task_name.clone(), ());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let tasks = self.active_tasks.clone();
        tokio::spawn(async move {
            if let Ok(reason) = shutdown_rx.recv().await {
                let _ = tx.send(reason).await;
                tasks.write().await.remove(&task_name);
            }
        });

        rx
    }

    pub async fn mark_done(&self, task_name: &str) {
        self.active_tasks.write().await.remove(task_name);
    }

    /// Broadcast the shutdown signal and wait up to `grace_period` for
    /// registered tasks to deregister themselves.
    pub async fn shutdown(&self, reason: ShutdownReason) {
        info!("initiating graceful shutdown: {:?}", reason);
        let _ = self.shutdown_tx.send(reason);

        let deadline = tokio::time::Instant::now() + self.config.grace_period;
        while tokio::time::Instant::now() < deadline {
            if self.active_tasks.read().await.is_empty() {
                info!("all tasks shut down gracefully");
                return;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        let remaining: Vec<_> = self.active_tasks.read().await.keys().cloned().collect();
        if !remaining.is_empty() {
            warn!(
                "shutdown grace period elapsed with {} task(s) still registered: {:?}",
                remaining.len(),
                remaining
            );
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active_tasks.read().await.len()
    }
}

pub static SHUTDOWN_MANAGER: Lazy<ShutdownManager> =
    Lazy::new(|| ShutdownManager::new(ShutdownConfig::default()));

pub static SHUTDOWN_TRIGGERED: AtomicBool = AtomicBool::new(false);

pub fn is_shutdown_triggered() -> bool {
    SHUTDOWN_TRIGGERED.load(Ordering::SeqCst)
}

pub async fn register_for_shutdown(task_name: impl Into<String>) -> mpsc::Receiver<ShutdownReason> {
    SHUTDOWN_MANAGER.register_task(task_name.into()).await
}

/// Install Ctrl+C / SIGTERM handlers that trigger the broadcast shutdown.
pub async fn setup_signal_handlers() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
    SHUTDOWN_TRIGGERED.store(true, Ordering::SeqCst);
    SHUTDOWN_MANAGER.shutdown(ShutdownReason::UserInterrupt).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_task_receives_shutdown_reason() {
        let manager = ShutdownManager::new(ShutdownConfig {
            grace_period: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        });
        let mut rx = manager.register_task("worker".to_string()).await;
        manager.shutdown(ShutdownReason::Maintenance).await;
        let reason = rx.recv().await.unwrap();
        assert!(matches!(reason, ShutdownReason::Maintenance));
    }

    #[tokio::test]
    async fn shutdown_with_no_tasks_returns_immediately() {
        let manager = ShutdownManager::new(ShutdownConfig::default());
        assert_eq!(manager.active_count().await, 0);
        manager.shutdown(ShutdownReason::Maintenance).await;
    }
}
