// ABOUTME: Periodic liveness loop for the sandbox container
// ABOUTME: Runs ensure_alive on an interval and records the outcome of the latest check

use crate::supervisor::ContainerSupervisor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogCheck {
    pub timestamp: DateTime<Utc>,
    pub alive: bool,
    /// A different container is current after the check
    pub restarted: bool,
}

/// Watchdog for the supervised container
pub struct Watchdog {
    supervisor: Arc<ContainerSupervisor>,
    interval: Duration,
    last_check: Arc<RwLock<Option<WatchdogCheck>>>,
    running: Arc<RwLock<bool>>,
}

impl Watchdog {
    pub fn new(supervisor: Arc<ContainerSupervisor>, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
            last_check: Arc::new(RwLock::new(None)),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Spawn the background loop. Calling start twice is a no-op.
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let supervisor = self.supervisor.clone();
        let last_check = self.last_check.clone();
        let running_flag = self.running.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            info!("Watchdog started (interval {:?})", interval);

            loop {
                time::sleep(interval).await;

                if !*running_flag.read().await {
                    info!("Watchdog stopped");
                    break;
                }

                let check = Self::check(&supervisor).await;
                *last_check.write().await = Some(check);
            }
        });
    }

    /// Stop the loop after its current iteration
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    pub async fn is_active(&self) -> bool {
        *self.running.read().await
    }

    /// Run a single check now, outside the loop
    pub async fn tick(&self) -> WatchdogCheck {
        let check = Self::check(&self.supervisor).await;
        *self.last_check.write().await = Some(check.clone());
        check
    }

    pub async fn last_check(&self) -> Option<WatchdogCheck> {
        self.last_check.read().await.clone()
    }

    async fn check(supervisor: &ContainerSupervisor) -> WatchdogCheck {
        let before = supervisor.current_handle().await.map(|h| h.id.clone());
        let alive = supervisor.ensure_alive().await;
        let after = supervisor.current_handle().await.map(|h| h.id.clone());
        let restarted = alive && before != after;

        if !alive {
            error!("Container could not be brought back; retrying next interval");
        } else if restarted {
            warn!(
                "Container restarted: {} -> {}",
                before.as_deref().unwrap_or("none"),
                after.as_deref().unwrap_or("none")
            );
        } else {
            debug!("Container healthy");
        }

        WatchdogCheck {
            timestamp: Utc::now(),
            alive,
            restarted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::local_supervisor;

    #[tokio::test]
    async fn test_tick_on_healthy_container() {
        let (_dir, provider, supervisor) = local_supervisor(&[]).await;
        supervisor.start().await.unwrap();
        let watchdog = Watchdog::new(supervisor, Duration::from_secs(60));

        let check = watchdog.tick().await;
        assert!(check.alive);
        assert!(!check.restarted);
        assert_eq!(provider.run_count(), 1);
        assert_eq!(watchdog.last_check().await, Some(check));
    }

    #[tokio::test]
    async fn test_tick_restarts_dead_container() {
        let (_dir, provider, supervisor) = local_supervisor(&[]).await;
        let handle = supervisor.start().await.unwrap();
        provider.simulate_exit(&handle.id, 137, false).unwrap();
        let watchdog = Watchdog::new(supervisor.clone(), Duration::from_secs(60));

        let check = watchdog.tick().await;
        assert!(check.alive);
        assert!(check.restarted);
        assert!(supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_loop_recovers_and_stops() {
        let (_dir, provider, supervisor) = local_supervisor(&[]).await;
        let handle = supervisor.start().await.unwrap();
        let watchdog = Watchdog::new(supervisor.clone(), Duration::from_millis(20));
        watchdog.start().await;
        watchdog.start().await;
        assert!(watchdog.is_active().await);

        provider.simulate_exit(&handle.id, 1, false).unwrap();
        for _ in 0..100 {
            if supervisor.is_running().await {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert!(supervisor.is_running().await);
        assert_eq!(provider.run_count(), 2);

        watchdog.stop().await;
        assert!(!watchdog.is_active().await);
    }
}
