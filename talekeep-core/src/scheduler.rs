//! Windowed periodic scheduler.
//!
//! Drives cadenced maintenance (scheduled backups and similar) on a ticker,
//! but only acts inside a permitted local-hour window. Configuration is
//! re-read every tick so changes apply without a restart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Timelike;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Snapshot of scheduling configuration, produced by a callback each tick.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleSpec {
    pub enabled: bool,
    /// Tick cadence; floored to one minute.
    pub check_interval_minutes: u64,
    /// Local hour the action window opens.
    pub window_start: u8,
    /// Local hour the window closes (exclusive). `start > end` wraps the
    /// window across midnight.
    pub window_end: u8,
}

/// Work driven by the scheduler.
#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    /// Whether an action is currently warranted.
    async fn due(&self) -> Result<bool>;

    /// Perform the action.
    async fn run(&self) -> Result<()>;
}

/// `h ∈ [start, end)`, wrapping across midnight when `start > end`. An
/// empty window (`start == end`) admits nothing.
pub fn in_window(hour: u8, start: u8, end: u8) -> bool {
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Periodic driver for one [`ScheduledTask`].
pub struct Scheduler {
    name: &'static str,
    token: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("name", &self.name).finish()
    }
}

impl Scheduler {
    /// Start ticking. `config` is consulted at every tick; `task.due()` is
    /// only asked when enabled, and `task.run()` only inside the window.
    pub fn start<C>(name: &'static str, config: C, task: Arc<dyn ScheduledTask>) -> Self
    where
        C: Fn() -> ScheduleSpec + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let spec = config();
                let interval =
                    Duration::from_secs(spec.check_interval_minutes.max(1) * 60);
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if !spec.enabled {
                    continue;
                }
                match task.due().await {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(err) => {
                        tracing::warn!(scheduler = name, %err, "eligibility check failed");
                        continue;
                    }
                }

                let hour = chrono::Local::now().hour() as u8;
                if !in_window(hour, spec.window_start, spec.window_end) {
                    tracing::info!(
                        scheduler = name,
                        hour,
                        window_start = spec.window_start,
                        window_end = spec.window_end,
                        "action due but outside window, deferring"
                    );
                    continue;
                }

                tracing::info!(scheduler = name, "running scheduled action");
                if let Err(err) = task.run().await {
                    tracing::error!(scheduler = name, %err, "scheduled action failed");
                }
            }
            tracing::debug!(scheduler = name, "scheduler stopped");
        });

        Self {
            name,
            token,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Halt the ticker and release the task.
    pub fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().expect("scheduler lock").take() {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn window_plain_range() {
        assert!(in_window(2, 2, 5));
        assert!(in_window(4, 2, 5));
        assert!(!in_window(5, 2, 5));
        assert!(!in_window(1, 2, 5));
    }

    #[test]
    fn window_wraps_midnight() {
        // [22, 24) ∪ [0, 3)
        assert!(in_window(22, 22, 3));
        assert!(in_window(23, 22, 3));
        assert!(in_window(0, 22, 3));
        assert!(in_window(2, 22, 3));
        assert!(!in_window(3, 22, 3));
        assert!(!in_window(12, 22, 3));
    }

    #[test]
    fn empty_window_admits_nothing() {
        for hour in 0..24 {
            assert!(!in_window(hour, 7, 7));
        }
    }

    struct CountingTask {
        due: AtomicU64,
        ran: AtomicU64,
    }

    #[async_trait]
    impl ScheduledTask for CountingTask {
        async fn due(&self) -> Result<bool> {
            self.due.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        }

        async fn run(&self) -> Result<()> {
            self.ran.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_inside_an_always_open_window() {
        let task = Arc::new(CountingTask {
            due: AtomicU64::new(0),
            ran: AtomicU64::new(0),
        });
        let scheduler = Scheduler::start(
            "test",
            || ScheduleSpec {
                enabled: true,
                check_interval_minutes: 1,
                window_start: 0,
                window_end: 24,
            },
            task.clone() as Arc<dyn ScheduledTask>,
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        scheduler.stop();
        assert!(task.ran.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_scheduler_never_checks() {
        let task = Arc::new(CountingTask {
            due: AtomicU64::new(0),
            ran: AtomicU64::new(0),
        });
        let scheduler = Scheduler::start(
            "test",
            || ScheduleSpec {
                enabled: false,
                check_interval_minutes: 1,
                window_start: 0,
                window_end: 24,
            },
            task.clone() as Arc<dyn ScheduledTask>,
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        scheduler.stop();
        assert_eq!(task.due.load(Ordering::Relaxed), 0);
    }
}
