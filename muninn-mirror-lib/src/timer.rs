//! Re-armable watchdog deadlines.
//!
//! The acknowledgement and processing timers are deadlines that move every
//! time progress is observed (an ack arrives, a write completes) and fire
//! only when a fully quiet interval elapses. A `Postpone` from the peer
//! extends them without resetting the accounting.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

pub struct Watchdog {
    deadline: Mutex<Option<Instant>>,
    changed: Notify,
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            deadline: Mutex::new(None),
            changed: Notify::new(),
        }
    }

    /// Arm (or re-arm) the deadline `after` from now.
    pub fn arm(&self, after: Duration) {
        *self.deadline.lock().expect("watchdog lock poisoned") = Some(Instant::now() + after);
        self.changed.notify_waiters();
    }

    pub fn disarm(&self) {
        *self.deadline.lock().expect("watchdog lock poisoned") = None;
        self.changed.notify_waiters();
    }

    /// Push an armed deadline out to `after` from now; no-op when disarmed.
    pub fn extend(&self, after: Duration) {
        let mut dl = self.deadline.lock().expect("watchdog lock poisoned");
        if dl.is_some() {
            *dl = Some(Instant::now() + after);
            self.changed.notify_waiters();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.lock().expect("watchdog lock poisoned").is_some()
    }

    /// Resolves when an armed deadline passes, disarming it. Pends
    /// indefinitely while disarmed; tracks every re-arm.
    pub async fn expired(&self) {
        loop {
            let notified = self.changed.notified();
            let deadline = *self.deadline.lock().expect("watchdog lock poisoned");
            match deadline {
                None => notified.await,
                Some(dl) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(dl) => {
                            let mut current =
                                self.deadline.lock().expect("watchdog lock poisoned");
                            if *current == Some(dl) {
                                *current = None;
                                return;
                            }
                        }
                        _ = notified => {}
                    }
                }
            }
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_only_after_quiet_interval() {
        let wd = Watchdog::new();
        wd.arm(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(60)).await;
        wd.arm(Duration::from_millis(100));
        let fired = tokio::time::timeout(Duration::from_millis(80), wd.expired()).await;
        assert!(fired.is_err(), "re-arm must push the deadline out");
        tokio::time::timeout(Duration::from_millis(40), wd.expired())
            .await
            .expect("deadline must fire once quiet");
    }

    #[tokio::test(start_paused = true)]
    async fn extend_is_a_noop_when_disarmed() {
        let wd = Watchdog::new();
        wd.extend(Duration::from_millis(10));
        assert!(!wd.is_armed());
        let fired = tokio::time::timeout(Duration::from_millis(50), wd.expired()).await;
        assert!(fired.is_err());
    }
}
