//! Periodic NORMAL-priority fetch requests, one timer per subscription.

use crate::{
    model::SubscriptionId,
    queue::{FetchQueue, Priority, QueueError, TaskId},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_stream::{StreamExt, wrappers::IntervalStream};

/// Where scheduled fetches go. Must return promptly: it is called from timer
/// tasks while the scheduler's job table is locked.
pub trait FetchRequester: Send + Sync {
    fn request_fetch(
        &self,
        subscription: &SubscriptionId,
        priority: Priority,
    ) -> Result<TaskId, QueueError>;
}

impl FetchRequester for FetchQueue {
    fn request_fetch(
        &self,
        subscription: &SubscriptionId,
        priority: Priority,
    ) -> Result<TaskId, QueueError> {
        self.enqueue(subscription, priority)
    }
}

/// Longest accepted fetch interval. Keeps every deadline well inside what
/// `Instant` can represent.
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("fetch interval for {0} must be greater than zero")]
    ZeroInterval(SubscriptionId),
    #[error("fetch interval for {0} exceeds {MAX_INTERVAL:?}")]
    IntervalTooLong(SubscriptionId),
}

/// Rejects intervals the scheduler would refuse, before anything is stored.
pub fn check_interval(
    subscription: &SubscriptionId,
    interval: Duration,
) -> Result<(), SchedulerError> {
    if interval.is_zero() {
        return Err(SchedulerError::ZeroInterval(subscription.clone()));
    }
    if interval > MAX_INTERVAL {
        return Err(SchedulerError::IntervalTooLong(subscription.clone()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub subscription_id: SubscriptionId,
    pub interval: Duration,
    pub next_fire: Instant,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    requester: Arc<dyn FetchRequester>,
    jobs: Mutex<Jobs>,
}

#[derive(Default)]
struct Jobs {
    by_subscription: HashMap<SubscriptionId, Job>,
    next_generation: u64,
    paused: bool,
}

struct Job {
    /// Tells a stale timer apart from the one currently installed.
    generation: u64,
    interval: Duration,
    next_fire: Instant,
    /// `None` while the scheduler is paused.
    handle: Option<JoinHandle<()>>,
}

impl Job {
    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Scheduler {
    pub fn new(requester: Arc<dyn FetchRequester>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                requester,
                jobs: Mutex::default(),
            }),
        }
    }

    /// Starts periodic fetches; the first one is due one `interval` from now.
    /// An existing timer for the subscription is replaced. While paused the
    /// job is only recorded.
    pub fn schedule(
        &self,
        subscription: &SubscriptionId,
        interval: Duration,
    ) -> Result<(), SchedulerError> {
        check_interval(subscription, interval)?;
        let mut jobs = self.inner.lock();
        let replaced = match self.install(&mut jobs, subscription, interval) {
            Some(mut previous) => {
                previous.stop();
                true
            }
            None => false,
        };
        tracing::info!(%subscription, ?interval, replaced, paused = jobs.paused, "fetch scheduled");
        Ok(())
    }

    /// Swaps in a timer with the new interval. The old timer can no longer
    /// fire once this returns, and the next fire is `new_interval` from now.
    pub fn reschedule(
        &self,
        subscription: &SubscriptionId,
        new_interval: Duration,
    ) -> Result<(), SchedulerError> {
        self.schedule(subscription, new_interval)
    }

    /// Returns whether a timer was removed.
    pub fn unschedule(&self, subscription: &SubscriptionId) -> bool {
        let removed = self.inner.lock().by_subscription.remove(subscription);
        match removed {
            Some(mut job) => {
                job.stop();
                tracing::info!(%subscription, "fetch unscheduled");
                true
            }
            None => false,
        }
    }

    /// Installed timers, soonest first.
    pub fn scheduled(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self
            .inner
            .lock()
            .by_subscription
            .iter()
            .map(|(subscription, job)| ScheduledJob {
                subscription_id: subscription.clone(),
                interval: job.interval,
                next_fire: job.next_fire,
            })
            .collect();
        jobs.sort_by_key(|job| job.next_fire);
        jobs
    }

    /// Holds every timer without forgetting the jobs.
    pub fn pause(&self) {
        let mut jobs = self.inner.lock();
        if jobs.paused {
            return;
        }
        jobs.paused = true;
        for job in jobs.by_subscription.values_mut() {
            job.stop();
        }
        tracing::info!(held = jobs.by_subscription.len(), "scheduler paused");
    }

    /// Restarts every held timer. The next fire of each job is one interval
    /// from now, ticks missed while paused are not made up.
    pub fn resume(&self) {
        let mut jobs = self.inner.lock();
        if !jobs.paused {
            return;
        }
        jobs.paused = false;
        let held: Vec<(SubscriptionId, Duration)> = jobs
            .by_subscription
            .iter()
            .map(|(subscription, job)| (subscription.clone(), job.interval))
            .collect();
        for (subscription, interval) in &held {
            self.install(&mut jobs, subscription, *interval);
        }
        tracing::info!(resumed = held.len(), "scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn shutdown(&self) {
        let mut jobs: Vec<Job> = self
            .inner
            .lock()
            .by_subscription
            .drain()
            .map(|(_, job)| job)
            .collect();
        for job in &mut jobs {
            job.stop();
        }
        tracing::info!(stopped = jobs.len(), "scheduler shut down");
    }

    /// Records a job under a fresh generation and, unless paused, spawns its
    /// timer. Returns the job it replaced, still running.
    fn install(
        &self,
        jobs: &mut Jobs,
        subscription: &SubscriptionId,
        interval: Duration,
    ) -> Option<Job> {
        jobs.next_generation += 1;
        let generation = jobs.next_generation;
        let next_fire = Instant::now() + interval;
        let handle = (!jobs.paused).then(|| {
            tokio::spawn(run_timer(
                Arc::downgrade(&self.inner),
                subscription.clone(),
                generation,
                next_fire,
                interval,
            ))
        });
        jobs.by_subscription.insert(
            subscription.clone(),
            Job {
                generation,
                interval,
                next_fire,
                handle,
            },
        )
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues the fetch request for one tick. Returns `false` when the timer
    /// has been replaced or removed and should stop.
    fn fire(&self, subscription: &SubscriptionId, generation: u64) -> bool {
        let mut jobs = self.lock();
        if jobs.paused {
            return false;
        }
        let Some(job) = jobs
            .by_subscription
            .get_mut(subscription)
            .filter(|job| job.generation == generation)
        else {
            return false;
        };
        job.next_fire = Instant::now() + job.interval;

        // under the lock, so a concurrent reschedule cannot slip in between
        // the generation check and the request
        match self.requester.request_fetch(subscription, Priority::Normal) {
            Ok(task) => tracing::debug!(%subscription, %task, "scheduled fetch requested"),
            Err(QueueError::Closed) => {
                tracing::debug!(%subscription, "queue closed, stopping timer");
                return false;
            }
            Err(err) => tracing::warn!(%subscription, error = %err, "scheduled fetch dropped"),
        }
        true
    }
}

async fn run_timer(
    scheduler: Weak<SchedulerInner>,
    subscription: SubscriptionId,
    generation: u64,
    first_fire: Instant,
    period: Duration,
) {
    let mut interval = interval_at(first_fire, period);
    // a sleeping laptop must not wake up to a burst of stale fetches
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ticks = IntervalStream::new(interval);

    while ticks.next().await.is_some() {
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        if !scheduler.fire(&subscription, generation) {
            break;
        }
    }
}
