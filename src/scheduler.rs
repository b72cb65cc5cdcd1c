//! Periodic worker scheduler.
//!
//! Drives the reconcile → expire cycle on a fixed interval. Ticks run to
//! completion on this task, so two ticks can never touch the live session
//! store concurrently; a long tick simply delays the next one. A second
//! low-priority task re-reads the config file so timeout, cadence and log
//! verbosity can be adjusted at runtime.

use chrono::Utc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::{registry::Registry, reload, EnvFilter};

use crate::reconcile::{ExpirySweeper, ReconcileReport, ReconcileWorker, SweepReport};
use crate::storage::{Settings, SharedDatabase};

/// Reload handle for the runtime log filter.
pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Periodic scheduler over the reconcile worker and expiry sweeper.
pub struct Scheduler {
    worker: ReconcileWorker,
    sweeper: ExpirySweeper,
}

impl Scheduler {
    /// Create a scheduler over the shared database.
    pub fn new(db: SharedDatabase) -> Self {
        Self {
            worker: ReconcileWorker::new(db.clone()),
            sweeper: ExpirySweeper::new(db),
        }
    }

    /// One full cycle: reconcile all active sessions, then expire the
    /// inactive ones. Reconcile runs first so a session about to expire
    /// gets its fold via the normal path; the sweep's own fold is the
    /// safety net for sessions crossing the boundary in between.
    pub fn tick(&self) -> (ReconcileReport, SweepReport) {
        let now = Utc::now();
        let timeout =
            chrono::Duration::seconds(Settings::current().session_timeout_secs as i64);

        let reconcile = match self.worker.reconcile_active_sessions(now) {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "reconcile pass failed");
                ReconcileReport::default()
            }
        };

        let sweep = match self.sweeper.expire_inactive_sessions(now, timeout) {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "expiry sweep failed");
                SweepReport::default()
            }
        };

        (reconcile, sweep)
    }

    /// Run ticks forever at the configured interval.
    pub async fn run(self) {
        let mut period = Settings::current().worker_interval_secs;
        let mut ticker = interval(Duration::from_secs(period));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let (reconcile, sweep) = self.tick();
            tracing::info!(
                sessions = reconcile.sessions_seen,
                created = reconcile.metrics_created + sweep.metrics_created,
                updated = reconcile.metrics_updated + sweep.metrics_updated,
                expired = sweep.sessions_expired,
                failures = reconcile.failures + sweep.failures,
                "worker tick complete"
            );

            // Pick up a changed cadence on the next cycle.
            let configured = Settings::current().worker_interval_secs;
            if configured != period {
                period = configured;
                ticker = interval(Duration::from_secs(period));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                tracing::info!(interval_secs = period, "worker interval changed");
            }
        }
    }
}

/// Low-priority loop refreshing settings from disk and retargeting the log
/// filter when the configured directive changes.
pub async fn run_config_refresh(filter: FilterHandle) {
    let mut current_filter = Settings::current().log_filter.clone();

    loop {
        let period = Settings::current().config_refresh_secs.max(1);
        tokio::time::sleep(Duration::from_secs(period)).await;

        match Settings::refresh() {
            Ok(fresh) => {
                if fresh.log_filter != current_filter {
                    match fresh.log_filter.parse::<EnvFilter>() {
                        Ok(parsed) => {
                            if filter.reload(parsed).is_ok() {
                                tracing::info!(filter = %fresh.log_filter, "log filter updated");
                                current_filter = fresh.log_filter;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(filter = %fresh.log_filter, error = %e, "invalid log filter, keeping previous");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "config refresh failed, keeping current settings");
            }
        }
    }
}
