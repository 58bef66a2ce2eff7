//! Periodic maintenance: expiration, notification retry, analytics refresh
//!
//! Each sweep is idempotent and claims rows through the same conditional
//! commit user actions use, so the scheduler can run concurrently with
//! approvers without coordination.
use crate::service::ApprovalService;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const ANALYTICS_WINDOW_DAYS: u32 = 30;
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub workflows_expired: usize,
    pub notifications_retried: usize,
    pub summaries_refreshed: usize,
}

pub struct MaintenanceScheduler {
    service: Arc<ApprovalService>,
}

impl MaintenanceScheduler {
    pub fn new(service: Arc<ApprovalService>) -> Self {
        Self { service }
    }

    /// One round of all three sweeps. Safe to call at any time, from any
    /// thread, alongside user-driven mutations.
    pub fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        let workflows_expired = self.service.expire_stale(now)?;
        let notifications_retried = self.service.dispatcher().retry_failed(now)?;
        let summaries_refreshed = self.service.refresh_analytics(now, ANALYTICS_WINDOW_DAYS)?;

        Ok(SweepReport {
            workflows_expired,
            notifications_retried,
            summaries_refreshed,
        })
    }

    /// Run sweeps on a background thread until the handle is stopped.
    pub fn spawn(service: Arc<ApprovalService>, interval: Duration) -> ScheduleHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let scheduler = MaintenanceScheduler::new(service);
            while !flag.load(Ordering::Relaxed) {
                if let Err(err) = scheduler.run_once(Utc::now()) {
                    tracing::warn!(error = %err, "maintenance sweep failed");
                }
                // sleep in short steps so stop requests take effect promptly
                let mut waited = Duration::ZERO;
                while waited < interval && !flag.load(Ordering::Relaxed) {
                    thread::sleep(STOP_POLL);
                    waited += STOP_POLL;
                }
            }
        });

        ScheduleHandle { stop, handle }
    }
}

pub struct ScheduleHandle {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl ScheduleHandle {
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}
