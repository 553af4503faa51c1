//! Idle reaper: a timer-driven control loop that stops instances whose
//! inactivity exceeds their budget.
//!
//! One pass at a time: a tick that fires while the previous pass is still
//! executing performs zero scans. Instances are processed independently —
//! one failure never aborts the rest of the pass, and a failed stop leaves
//! the row Running so the next tick retries.

use inferd_common::{now_secs, Instance, InstanceStatus};
use inferd_runtime::ContainerRuntime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::tracker::{InstanceTracker, InstanceUpdate};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct IdleReaper {
    tracker: Arc<InstanceTracker>,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    in_flight: AtomicBool,
}

/// Outcome of one pass, for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub scanned: usize,
    pub stopped: usize,
    pub failed: usize,
    /// True when the pass was skipped because another was in flight.
    pub skipped: bool,
}

impl IdleReaper {
    pub fn new(
        tracker: Arc<InstanceTracker>,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
    ) -> Self {
        Self {
            tracker,
            runtime,
            interval,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run the reaper on its own task, ticking forever.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let report = self.tick().await;
                if !report.skipped && report.scanned > 0 {
                    info!(
                        scanned = report.scanned,
                        stopped = report.stopped,
                        failed = report.failed,
                        "reaper pass complete"
                    );
                }
            }
        })
    }

    /// One reaper pass. Public so tests (and an admin trigger) can drive it
    /// without the timer.
    pub async fn tick(&self) -> ReapReport {
        // Non-blocking try-lock: overlapping passes are skipped outright,
        // never queued.
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("previous reaper pass still running, skipping tick");
            return ReapReport {
                skipped: true,
                ..Default::default()
            };
        }

        let report = self.run_pass().await;

        // Cleared on every exit path so a failed batch cannot wedge the
        // scheduler.
        self.in_flight.store(false, Ordering::Release);
        report
    }

    async fn run_pass(&self) -> ReapReport {
        let now = now_secs();
        let candidates = self.tracker.running_with_budget();
        let mut report = ReapReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        for instance in candidates {
            if !is_eligible(&instance, now) {
                continue;
            }
            match self.stop_instance(&instance, now).await {
                Ok(()) => report.stopped += 1,
                Err(e) => {
                    // Leave the row Running; the next tick retries.
                    error!(
                        id = %instance.id,
                        error = %e,
                        "failed to stop idle instance"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn stop_instance(
        &self,
        instance: &Instance,
        pass_started: i64,
    ) -> inferd_runtime::Result<()> {
        debug!(
            id = %instance.id,
            idle_minutes = instance.idle_minutes(pass_started),
            budget = ?instance.auto_stop_minutes,
            "stopping idle instance"
        );
        // Idempotent at the gateway: already-stopped answers are success.
        self.runtime
            .stop_container(&instance.id, STOP_TIMEOUT)
            .await?;
        // Anchor the timestamp to this pass, not to whenever the stop call
        // happened to return.
        self.tracker.update(
            &instance.id,
            InstanceUpdate::status_at(InstanceStatus::Stopped, pass_started),
        );
        Ok(())
    }
}

fn is_eligible(instance: &Instance, now: i64) -> bool {
    match instance.auto_stop_minutes {
        // Eligible exactly at the boundary, not strictly after it.
        Some(budget) => instance.idle_minutes(now) >= budget as i64,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::NewInstance;
    use inferd_common::builtin_models;
    use inferd_runtime::test_utils::MockRuntime;

    fn setup() -> (Arc<InstanceTracker>, Arc<MockRuntime>, IdleReaper) {
        let tracker = Arc::new(InstanceTracker::new(builtin_models()));
        let runtime = Arc::new(MockRuntime::new());
        let reaper = IdleReaper::new(
            tracker.clone(),
            runtime.clone(),
            Duration::from_secs(60),
        );
        (tracker, runtime, reaper)
    }

    fn running_instance(
        tracker: &InstanceTracker,
        runtime: &MockRuntime,
        id: &str,
        port: u16,
        budget: Option<u64>,
        idle_secs: i64,
    ) {
        runtime.register_container(id, true);
        tracker
            .create(NewInstance {
                id: id.to_string(),
                user_id: "user-1".to_string(),
                engine_id: "ollama".to_string(),
                model_id: "qwen2-0.5b".to_string(),
                container_name: format!("inferd-ollama-{}", id),
                port,
                allocated_memory_mb: 4096,
                allocated_cpu_cores: 2.0,
                auto_stop_minutes: budget,
            })
            .unwrap();
        tracker.update(id, InstanceUpdate::activity(now_secs() - idle_secs));
    }

    #[tokio::test]
    async fn test_idle_instance_stopped_at_boundary() {
        let (tracker, runtime, reaper) = setup();
        // Exactly 30 minutes idle: eligible.
        running_instance(&tracker, &runtime, "c1", 32768, Some(30), 30 * 60);

        let report = reaper.tick().await;
        assert_eq!(report.stopped, 1);
        assert_eq!(
            tracker.get("c1").unwrap().status,
            InstanceStatus::Stopped
        );
        assert_eq!(runtime.stop_calls("c1"), 1);
    }

    #[tokio::test]
    async fn test_instance_under_budget_left_alone() {
        let (tracker, runtime, reaper) = setup();
        // 29m59s idle: not eligible.
        running_instance(&tracker, &runtime, "c1", 32768, Some(30), 29 * 60 + 59);

        let report = reaper.tick().await;
        assert_eq!(report.stopped, 0);
        assert_eq!(
            tracker.get("c1").unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_no_budget_never_reaped() {
        let (tracker, runtime, reaper) = setup();
        running_instance(&tracker, &runtime, "c1", 32768, None, 100 * 60);

        let report = reaper.tick().await;
        assert_eq!(report.scanned, 0);
        assert_eq!(
            tracker.get("c1").unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_abort_pass() {
        let (tracker, runtime, reaper) = setup();
        running_instance(&tracker, &runtime, "c1", 32768, Some(10), 20 * 60);
        running_instance(&tracker, &runtime, "c2", 32769, Some(10), 20 * 60);
        runtime.fail_stop_for("c1");

        let report = reaper.tick().await;
        assert_eq!(report.stopped, 1);
        assert_eq!(report.failed, 1);
        // Failed stop leaves the row Running for the next tick.
        assert_eq!(
            tracker.get("c1").unwrap().status,
            InstanceStatus::Running
        );
        assert_eq!(
            tracker.get("c2").unwrap().status,
            InstanceStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_across_ticks() {
        let (tracker, runtime, reaper) = setup();
        running_instance(&tracker, &runtime, "c1", 32768, Some(10), 20 * 60);

        let first = reaper.tick().await;
        assert_eq!(first.stopped, 1);
        // Second tick: the instance is no longer in the scan set.
        let second = reaper.tick().await;
        assert_eq!(second.scanned, 0);
        assert_eq!(runtime.stop_calls("c1"), 1);
        assert_eq!(
            tracker.get("c1").unwrap().status,
            InstanceStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let (tracker, runtime, reaper) = setup();
        running_instance(&tracker, &runtime, "c1", 32768, Some(10), 20 * 60);

        // Simulate a pass in flight.
        reaper.in_flight.store(true, Ordering::Release);
        let report = reaper.tick().await;
        assert!(report.skipped);
        assert_eq!(report.scanned, 0);
        assert_eq!(
            tracker.get("c1").unwrap().status,
            InstanceStatus::Running
        );

        // Guard released by the owner: next tick proceeds normally.
        reaper.in_flight.store(false, Ordering::Release);
        let report = reaper.tick().await;
        assert_eq!(report.stopped, 1);
    }

    #[tokio::test]
    async fn test_guard_cleared_after_failing_pass() {
        let (tracker, runtime, reaper) = setup();
        running_instance(&tracker, &runtime, "c1", 32768, Some(10), 20 * 60);
        runtime.fail_stop_for("c1");

        let report = reaper.tick().await;
        assert_eq!(report.failed, 1);
        assert!(!reaper.in_flight.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_touch_extends_lifetime() {
        let (tracker, runtime, reaper) = setup();
        running_instance(&tracker, &runtime, "c1", 32768, Some(30), 30 * 60);

        // Activity arrives just before the pass.
        tracker.touch_by_port(32768);
        let report = reaper.tick().await;
        assert_eq!(report.stopped, 0);
        assert_eq!(
            tracker.get("c1").unwrap().status,
            InstanceStatus::Running
        );
    }
}
