//! Decides whether a non-forced reconcile is due

use crate::crds::{AppStatus, ConditionType};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Backoff after `failures` consecutive failures: 1s doubling, capped at `cap`
#[must_use]
pub fn failure_backoff(failures: u32, cap: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    Duration::from_secs(1u64 << exponent).min(cap)
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileTimer<'a> {
    status: &'a AppStatus,
    generation: i64,
    sync_period: Duration,
}

impl<'a> ReconcileTimer<'a> {
    #[must_use]
    pub fn new(status: &'a AppStatus, generation: i64, sync_period: Duration) -> Self {
        Self {
            status,
            generation,
            sync_period,
        }
    }

    /// Wait between completed runs: the sync period, or the backoff while failing
    #[must_use]
    pub fn interval(&self) -> Duration {
        if self.status.consecutive_reconcile_failures > 0 {
            failure_backoff(self.status.consecutive_reconcile_failures, self.sync_period)
        } else {
            self.sync_period
        }
    }

    #[must_use]
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        if self.status.generic.observed_generation != self.generation {
            return true;
        }
        // A run that never wrote its outcome (controller restart) resumes now.
        if self.status.has_condition(ConditionType::Reconciling) {
            return true;
        }
        match self.status.last_reconcile_time() {
            None => true,
            Some(last) => self.next_run(last) <= now,
        }
    }

    /// Time left before [`Self::is_ready_at`] turns true
    #[must_use]
    pub fn duration_until_ready(&self, now: DateTime<Utc>) -> Duration {
        if self.is_ready_at(now) {
            return Duration::ZERO;
        }
        self.status
            .last_reconcile_time()
            .and_then(|last| (self.next_run(last) - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    fn next_run(&self, last: DateTime<Utc>) -> DateTime<Utc> {
        let interval = chrono::Duration::from_std(self.interval())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        last.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{Condition, DeployStatus};

    fn reconciled_at(at: DateTime<Utc>, failures: u32) -> AppStatus {
        let mut status = AppStatus {
            deploy: Some(DeployStatus {
                started_at: Some(at - chrono::Duration::seconds(5)),
                updated_at: Some(at),
                finished: true,
                ..DeployStatus::default()
            }),
            consecutive_reconcile_failures: failures,
            ..AppStatus::default()
        };
        status.generic.observed_generation = 1;
        status.generic.conditions = vec![Condition::new(if failures > 0 {
            ConditionType::ReconcileFailed
        } else {
            ConditionType::ReconcileSucceeded
        })];
        status
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cap = Duration::from_secs(30);
        assert_eq!(failure_backoff(1, cap), Duration::from_secs(1));
        assert_eq!(failure_backoff(2, cap), Duration::from_secs(2));
        assert_eq!(failure_backoff(4, cap), Duration::from_secs(8));
        assert_eq!(failure_backoff(10, cap), cap);
        assert_eq!(failure_backoff(u32::MAX, cap), cap);
    }

    #[test]
    fn waits_for_sync_period_after_success() {
        let t0 = Utc::now();
        let status = reconciled_at(t0, 0);
        let timer = ReconcileTimer::new(&status, 1, Duration::from_secs(60));

        assert!(!timer.is_ready_at(t0 + chrono::Duration::seconds(30)));
        assert_eq!(
            timer.duration_until_ready(t0 + chrono::Duration::seconds(30)),
            Duration::from_secs(30)
        );
        assert!(timer.is_ready_at(t0 + chrono::Duration::seconds(60)));
    }

    #[test]
    fn failing_app_retries_on_backoff() {
        let t0 = Utc::now();
        let status = reconciled_at(t0, 3);
        let timer = ReconcileTimer::new(&status, 1, Duration::from_secs(600));

        assert_eq!(timer.interval(), Duration::from_secs(4));
        assert!(!timer.is_ready_at(t0 + chrono::Duration::seconds(3)));
        assert!(timer.is_ready_at(t0 + chrono::Duration::seconds(4)));
    }

    #[test]
    fn new_generation_or_interrupted_run_is_ready() {
        let t0 = Utc::now();
        let status = reconciled_at(t0, 0);
        assert!(ReconcileTimer::new(&status, 2, Duration::from_secs(600)).is_ready_at(t0));

        let mut interrupted = status.clone();
        interrupted.generic.conditions = vec![Condition::new(ConditionType::Reconciling)];
        assert!(ReconcileTimer::new(&interrupted, 1, Duration::from_secs(600)).is_ready_at(t0));

        let fresh = AppStatus::default();
        assert!(ReconcileTimer::new(&fresh, 0, Duration::from_secs(600)).is_ready_at(t0));
    }
}
