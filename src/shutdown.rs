use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::observability::metrics;

/// Graceful shutdown coordinator for the scheduler loop and event pump
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender,
            tasks: Vec::new(),
        }
    }

    /// Receiver that flips to `true` once shutdown starts
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Track a background task so shutdown waits for it
    pub fn track(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait for SIGINT (Ctrl-C)
    pub async fn wait_for_signal() -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        Ok(())
    }

    /// Signal every subscriber and wait up to `grace` for each tracked task
    pub async fn shutdown(self, grace: Duration) {
        info!("Initiating graceful shutdown...");
        self.sender.send_replace(true);

        for (name, handle) in self.tasks {
            match timeout(grace, handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
                Err(_) => warn!(task = name, grace_ms = grace.as_millis() as u64, "Timeout waiting for task to stop"),
            }
        }

        metrics().log_stats();
        info!("Graceful shutdown completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_stops_subscribed_tasks() {
        let mut coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        coordinator.track(
            "waiter",
            tokio::spawn(async move {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }),
        );

        assert!(!coordinator.is_shutting_down());
        coordinator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_on_stuck_tasks() {
        let mut coordinator = ShutdownCoordinator::new();
        coordinator.track(
            "stuck",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }),
        );

        coordinator.shutdown(Duration::from_millis(10)).await;
    }
}
