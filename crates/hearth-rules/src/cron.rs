//! Cron delegation.
//!
//! The engine treats cron specs as opaque strings and delegates scheduling
//! to an injected [`CronScheduler`]. Jobs force a re-check of one rule and
//! are cancelled when the rule is destroyed or the engine stops.

use std::collections::HashMap;
use std::sync::Arc;

use hearth_core::{Error, Result};
use parking_lot::Mutex;
use tracing::error;

/// Handle to a scheduled cron job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CronJobId(pub u64);

pub type CronJob = Box<dyn Fn() + Send + Sync>;

/// External cron scheduler seam. The engine never parses cron specs.
pub trait CronScheduler: Send + Sync {
    fn schedule(&self, spec: &str, job: CronJob) -> Result<CronJobId>;
    fn cancel(&self, id: CronJobId);
}

/// Default scheduler: rejects cron rules so a missing scheduler surfaces as
/// an invalid rule instead of a silently dead schedule.
pub struct NoCron;

impl CronScheduler for NoCron {
    fn schedule(&self, spec: &str, _job: CronJob) -> Result<CronJobId> {
        error!(spec, "no cron scheduler configured");
        Err(Error::Rule(format!(
            "no cron scheduler configured (cron spec '{}')",
            spec
        )))
    }

    fn cancel(&self, _id: CronJobId) {}
}

/// Test scheduler: records jobs and fires them on demand.
#[derive(Clone, Default)]
pub struct ManualCron {
    inner: Arc<Mutex<ManualCronState>>,
}

#[derive(Default)]
struct ManualCronState {
    next_id: u64,
    jobs: HashMap<u64, (String, CronJob)>,
}

impl ManualCron {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduled `(id, spec)` pairs, in no particular order.
    pub fn jobs(&self) -> Vec<(CronJobId, String)> {
        let state = self.inner.lock();
        state
            .jobs
            .iter()
            .map(|(id, (spec, _))| (CronJobId(*id), spec.clone()))
            .collect()
    }

    /// Fire one job. Returns false if it is not scheduled (cancelled).
    pub fn fire(&self, id: CronJobId) -> bool {
        let state = self.inner.lock();
        match state.jobs.get(&id.0) {
            Some((_, job)) => {
                job();
                true
            }
            None => false,
        }
    }
}

impl CronScheduler for ManualCron {
    fn schedule(&self, spec: &str, job: CronJob) -> Result<CronJobId> {
        let mut state = self.inner.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(id, (spec.to_string(), job));
        Ok(CronJobId(id))
    }

    fn cancel(&self, id: CronJobId) {
        self.inner.lock().jobs.remove(&id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn manual_cron_fires_and_cancels() {
        let cron = ManualCron::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = cron
            .schedule("0 0 * * *", Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(cron.fire(id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        cron.cancel(id);
        assert!(!cron.fire(id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_cron_rejects() {
        assert!(NoCron.schedule("@hourly", Box::new(|| {})).is_err());
    }
}
