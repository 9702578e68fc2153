//! Connection idle-timeout tracking.
//!
//! One monitor per connection; any inbound or outbound frame resets the
//! timer. The owning connection task races [`IdleMonitor::expired`] against
//! its serve loop and closes everything when it wins; in-flight streams are
//! terminated with UNAVAILABLE.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Shared activity tracker for one connection.
#[derive(Debug)]
pub struct IdleMonitor {
    last_activity: Mutex<Instant>,
    timeout: Duration,
}

impl IdleMonitor {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self { last_activity: Mutex::new(Instant::now()), timeout })
    }

    /// Record activity. Called for every frame in either direction.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Resolve when the connection has been idle for the full timeout.
    pub async fn expired(&self) {
        loop {
            let deadline = *self.last_activity.lock().unwrap() + self.timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_after_quiet_period() {
        let monitor = IdleMonitor::new(Duration::from_secs(5));
        tokio::time::timeout(Duration::from_secs(6), monitor.expired())
            .await
            .expect("monitor should expire");
    }

    #[tokio::test(start_paused = true)]
    async fn touch_defers_expiry() {
        let monitor = IdleMonitor::new(Duration::from_secs(5));
        let watcher = Arc::clone(&monitor);
        let expiry = tokio::spawn(async move { watcher.expired().await });

        // Stay active for 8 seconds; the monitor must not fire.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            monitor.touch();
        }
        assert!(!expiry.is_finished());

        // Then go quiet and it fires.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(expiry.is_finished());
    }
}
