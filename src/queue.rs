//! Single-flight priority queue in front of the Gmail API.
//!
//! Exactly one worker drains the queue and runs one [`SyncJob`] at a time.
//! Tasks start in priority order (FIFO within a tier), consecutive tasks are
//! spaced by `queue_delay` measured from the previous completion, and
//! retryable failures come back after an exponential backoff without blocking
//! the rest of the queue.

mod task;

pub use task::{FetchTask, Priority, QueueStatus, SyncResult, TaskId, TaskState};

use crate::{
    model::SubscriptionId,
    sync::{SyncError, SyncJob},
};
use backoff::{ExponentialBackoffBuilder, backoff::Backoff};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{
        Notify,
        broadcast::{self, error::RecvError},
        mpsc,
    },
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, bon::Builder)]
pub struct QueueConfig {
    #[builder(default = Duration::from_secs(5))]
    pub queue_delay: Duration,
    /// Total attempts per task, the first one included.
    #[builder(default = 3)]
    pub max_retry_attempts: u32,
    #[builder(default = Duration::from_secs(2))]
    pub retry_backoff_base: Duration,
    #[builder(default = Duration::from_secs(300))]
    pub retry_backoff_cap: Duration,
    /// Unbounded when unset.
    pub max_pending: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("fetch queue is full ({0} tasks pending)")]
    Overflow(usize),
    #[error("fetch queue is shut down")]
    Closed,
    #[error("result of task {0} was dropped by a lagging receiver")]
    ResultMissed(TaskId),
}

/// Receives every terminal [`SyncResult`]. Delivery must not block and must
/// not fail the queue.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, result: SyncResult);
}

impl NotificationSink for broadcast::Sender<SyncResult> {
    fn deliver(&self, result: SyncResult) {
        if self.send(result).is_err() {
            tracing::trace!("no result subscribers");
        }
    }
}

impl NotificationSink for mpsc::UnboundedSender<SyncResult> {
    fn deliver(&self, result: SyncResult) {
        if self.send(result).is_err() {
            tracing::trace!("result receiver dropped");
        }
    }
}

#[derive(Clone)]
pub struct FetchQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    job: Arc<dyn SyncJob>,
    sink: Arc<dyn NotificationSink>,
    state: Mutex<QueueState>,
    wakeup: Notify,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct QueueState {
    /// Waiting and running tasks. Settled tasks only live on in their result.
    tasks: HashMap<TaskId, FetchTask>,
    /// Waiting tasks in start order.
    order: BTreeMap<(Priority, u64), TaskId>,
    /// At most one waiting task per subscription.
    waiting: HashMap<SubscriptionId, TaskId>,
    running: Option<TaskId>,
    next_id: u64,
    next_seq: u64,
    completed: u64,
    failed: u64,
    closed: bool,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn insert_waiting(&mut self, task: FetchTask) {
        self.order.insert(task.key(), task.id);
        self.waiting.insert(task.subscription_id.clone(), task.id);
        self.tasks.insert(task.id, task);
    }

    fn is_pending(&self, id: TaskId) -> bool {
        self.tasks
            .get(&id)
            .is_some_and(|task| task.state == TaskState::Pending)
    }

    fn remove_waiting(&mut self, id: TaskId) -> Option<FetchTask> {
        if self.running == Some(id) {
            return None;
        }
        let task = self.tasks.remove(&id)?;
        self.order.remove(&task.key());
        self.waiting.remove(&task.subscription_id);
        Some(task)
    }

    /// Moves the first eligible task to running. Otherwise reports when the
    /// earliest deferred retry becomes eligible, if there is one.
    fn take_eligible(&mut self, now: Instant) -> Result<FetchTask, Option<Instant>> {
        let mut wake_at: Option<Instant> = None;
        let mut chosen = None;
        for task in self.order.values().filter_map(|id| self.tasks.get(id)) {
            if task.is_eligible(now) {
                chosen = Some(task.id);
                break;
            }
            if let Some(at) = task.not_before {
                wake_at = Some(wake_at.map_or(at, |earliest| earliest.min(at)));
            }
        }

        let Some(mut task) = chosen.and_then(|id| self.remove_waiting(id)) else {
            return Err(wake_at);
        };
        task.state = TaskState::Running;
        task.attempt_count += 1;
        task.not_before = None;
        self.running = Some(task.id);
        self.tasks.insert(task.id, task.clone());
        Ok(task)
    }
}

impl FetchQueue {
    pub fn new(
        config: QueueConfig,
        job: Arc<dyn SyncJob>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                job,
                sink,
                state: Mutex::default(),
                wakeup: Notify::new(),
                shutdown: CancellationToken::new(),
                worker: Mutex::default(),
            }),
        }
    }

    /// Requests a sync. A request for a subscription that already has a
    /// waiting task joins that task, raising its priority if needed, and
    /// returns its id.
    pub fn enqueue(
        &self,
        subscription: &SubscriptionId,
        priority: Priority,
    ) -> Result<TaskId, QueueError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }

        if let Some(id) = state.waiting.get(subscription).copied() {
            let current = state.tasks.get(&id).map(|task| task.priority);
            if current.is_some_and(|current| priority.outranks(current)) {
                if let Some(mut task) = state.remove_waiting(id) {
                    task.priority = priority;
                    state.insert_waiting(task);
                }
                tracing::debug!(task = %id, %subscription, %priority, "pending fetch escalated");
            } else {
                tracing::debug!(task = %id, %subscription, "fetch request coalesced");
            }
            return Ok(id);
        }

        if let Some(limit) = self
            .inner
            .config
            .max_pending
            .filter(|limit| state.order.len() >= *limit)
        {
            tracing::warn!(%subscription, limit, "fetch queue full, request refused");
            return Err(QueueError::Overflow(limit));
        }

        state.next_id += 1;
        let id = TaskId(state.next_id);
        let seq = state.next_seq();
        state.insert_waiting(FetchTask {
            id,
            subscription_id: subscription.clone(),
            priority,
            enqueued_at: Instant::now(),
            attempt_count: 0,
            state: TaskState::Pending,
            not_before: None,
            absorbed: Vec::new(),
            seq,
        });
        drop(state);

        tracing::debug!(task = %id, %subscription, %priority, "fetch enqueued");
        self.inner.wakeup.notify_one();
        Ok(id)
    }

    /// Enqueues every subscription at the same priority, stopping at the first
    /// refusal.
    pub fn enqueue_all<'a>(
        &self,
        subscriptions: impl IntoIterator<Item = &'a SubscriptionId>,
        priority: Priority,
    ) -> Result<Vec<TaskId>, QueueError> {
        subscriptions
            .into_iter()
            .map(|subscription| self.enqueue(subscription, priority))
            .collect()
    }

    /// Drops a task that has not started yet. Running tasks and tasks waiting
    /// for a retry already owe a result; for those this returns `false`.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.inner.lock();
        let cancelled = state.is_pending(id) && state.remove_waiting(id).is_some();
        if cancelled {
            tracing::debug!(task = %id, "fetch cancelled");
        }
        cancelled
    }

    /// Drops every task that has not started yet and returns how many there
    /// were. Retries stay queued.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.lock();
        let ids: Vec<TaskId> = state
            .order
            .values()
            .copied()
            .filter(|id| state.is_pending(*id))
            .collect();
        for id in &ids {
            state.remove_waiting(*id);
        }
        ids.len()
    }

    /// Waits for the result that settles `id`. When `results` lagged past it,
    /// the task is reported as [`QueueError::ResultMissed`] instead of
    /// waiting forever.
    pub async fn wait_for(
        &self,
        results: &mut broadcast::Receiver<SyncResult>,
        id: TaskId,
    ) -> Result<SyncResult, QueueError> {
        loop {
            match results.recv().await {
                Ok(result) if result.answers(id) => return Ok(result),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(task = %id, skipped, "result receiver lagged");
                    if self.state(id).is_some() {
                        continue;
                    }
                    // settled, so its result is either still buffered or gone
                    while let Ok(result) = results.try_recv() {
                        if result.answers(id) {
                            return Ok(result);
                        }
                    }
                    return Err(QueueError::ResultMissed(id));
                }
                Err(RecvError::Closed) => return Err(QueueError::Closed),
            }
        }
    }

    /// Zeroes the completed and failed counters reported by [`Self::status`].
    pub fn reset_stats(&self) {
        let mut state = self.inner.lock();
        state.completed = 0;
        state.failed = 0;
    }

    /// Waiting tasks in the order they will start, ignoring retry backoff.
    pub fn pending(&self) -> Vec<FetchTask> {
        let state = self.inner.lock();
        state
            .order
            .values()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    /// State of a waiting or running task. `None` once it has settled, at
    /// which point its [`SyncResult`] has been delivered.
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.inner
            .lock()
            .tasks
            .values()
            .find(|task| task.answers(id))
            .map(|task| task.state)
    }

    pub fn status(&self) -> QueueStatus {
        let is_running = self.is_running();
        let state = self.inner.lock();
        QueueStatus {
            is_running,
            pending: state.order.len(),
            current: state
                .running
                .and_then(|id| state.tasks.get(&id))
                .map(|task| task.subscription_id.clone()),
            completed: state.completed,
            failed: state.failed,
        }
    }

    pub fn is_running(&self) -> bool {
        let worker = self.inner.worker.lock().unwrap_or_else(PoisonError::into_inner);
        worker.as_ref().is_some_and(|handle| !handle.is_finished())
            && !self.inner.shutdown.is_cancelled()
    }

    /// Spawns the worker. Calling it again while the worker runs, or after
    /// shutdown, does nothing.
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }
        *worker = Some(tokio::spawn(self.inner.clone().drain()));
    }

    /// Refuses new requests and stops the worker once the running task, if
    /// any, has settled. Waiting tasks are abandoned.
    pub async fn shutdown(&self) {
        self.inner.lock().closed = true;
        self.inner.shutdown.cancel();

        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "fetch queue worker failed");
            }
        }

        let abandoned = self.inner.lock().order.len();
        tracing::info!(abandoned, "fetch queue shut down");
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_retry_attempts.max(1)
    }

    /// Backoff before attempt `failed_attempts + 1`: base, 2×base, 4×base and
    /// so on, capped.
    fn retry_delay(&self, failed_attempts: u32) -> Duration {
        let mut policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry_backoff_base)
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(self.config.retry_backoff_cap)
            .with_max_elapsed_time(None)
            .build();
        (0..failed_attempts)
            .filter_map(|_| policy.next_backoff())
            .last()
            .unwrap_or(self.config.retry_backoff_base)
    }

    async fn drain(self: Arc<Self>) {
        tracing::info!("fetch queue worker started");
        let mut last_finished: Option<Instant> = None;
        loop {
            if let Some(finished) = last_finished {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = sleep_until(finished + self.config.queue_delay) => {}
                }
            }
            let Some(task) = self.next_task().await else {
                break;
            };

            tracing::info!(
                task = %task.id,
                subscription = %task.subscription_id,
                priority = %task.priority,
                attempt = task.attempt_count,
                "fetch started"
            );
            // no select here: a started sync always runs to completion
            let outcome = self.job.run(&task.subscription_id).await;
            self.settle(task, outcome);
            last_finished = Some(Instant::now());
        }
        tracing::info!("fetch queue worker stopped");
    }

    async fn next_task(&self) -> Option<FetchTask> {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.lock().take_eligible(Instant::now()) {
                Ok(task) => return Some(task),
                Err(wake_at) => wake_at,
            };
            let deferred = async {
                match wake_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = &mut notified => {}
                _ = deferred => {}
            }
        }
    }

    fn settle(&self, task: FetchTask, outcome: Result<usize, SyncError>) {
        let result = {
            let mut state = self.lock();
            state.running = None;
            let mut task = state.tasks.remove(&task.id).unwrap_or(task);

            match outcome {
                Err(err) if err.is_retryable() && task.attempt_count < self.max_attempts() => {
                    let delay = self.retry_delay(task.attempt_count);
                    let follow_up = state.waiting.get(&task.subscription_id).copied();
                    if let Some(follow_up) = follow_up.and_then(|id| state.remove_waiting(id)) {
                        task.priority = task.priority.escalate(follow_up.priority);
                        task.absorbed.push(follow_up.id);
                        task.absorbed.extend(follow_up.absorbed);
                    }
                    tracing::warn!(
                        task = %task.id,
                        subscription = %task.subscription_id,
                        attempt = task.attempt_count,
                        retry_in = ?delay,
                        error = %err,
                        "fetch failed, will retry"
                    );
                    task.state = TaskState::Retrying;
                    task.not_before = Some(Instant::now() + delay);
                    task.seq = state.next_seq();
                    state.insert_waiting(task);
                    None
                }
                outcome => {
                    let (new_message_count, error) = match outcome {
                        Ok(count) => (count, None),
                        Err(err) => (0, Some(err)),
                    };
                    match &error {
                        None => state.completed += 1,
                        Some(_) => state.failed += 1,
                    }
                    Some(SyncResult {
                        task_id: task.id,
                        subscription_id: task.subscription_id,
                        new_message_count,
                        attempts: task.attempt_count,
                        error,
                        absorbed: task.absorbed,
                    })
                }
            }
        };

        match result {
            Some(result) => {
                match &result.error {
                    None => tracing::info!(
                        task = %result.task_id,
                        subscription = %result.subscription_id,
                        new_messages = result.new_message_count,
                        attempts = result.attempts,
                        "fetch completed"
                    ),
                    Some(err) => tracing::error!(
                        task = %result.task_id,
                        subscription = %result.subscription_id,
                        attempts = result.attempts,
                        error = %err,
                        "fetch failed"
                    ),
                }
                self.sink.deliver(result);
            }
            None => self.wakeup.notify_one(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Run {
        subscription: SubscriptionId,
        started: Instant,
        finished: Instant,
    }

    /// Sync stand-in that takes `duration` and replays scripted outcomes per
    /// subscription, succeeding with one new message once the script is empty.
    #[derive(Default)]
    struct RecordingJob {
        duration: Duration,
        script: Mutex<HashMap<SubscriptionId, VecDeque<Result<usize, SyncError>>>>,
        runs: Mutex<Vec<Run>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl RecordingJob {
        fn taking(duration: Duration) -> Self {
            Self {
                duration,
                ..Default::default()
            }
        }

        fn script(self, subscription: &str, outcomes: Vec<Result<usize, SyncError>>) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(subscription.into(), outcomes.into());
            self
        }

        fn order(&self) -> Vec<String> {
            self.runs
                .lock()
                .unwrap()
                .iter()
                .map(|run| run.subscription.to_string())
                .collect()
        }

        /// Idle time between the end of run `i - 1` and the start of run `i`.
        fn gap_before(&self, i: usize) -> Duration {
            let runs = self.runs.lock().unwrap();
            runs[i].started.duration_since(runs[i - 1].finished)
        }
    }

    #[async_trait]
    impl SyncJob for RecordingJob {
        async fn run(&self, subscription: &SubscriptionId) -> Result<usize, SyncError> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let started = Instant::now();
            tokio::time::sleep(self.duration).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.runs.lock().unwrap().push(Run {
                subscription: subscription.clone(),
                started,
                finished: Instant::now(),
            });
            self.script
                .lock()
                .unwrap()
                .get_mut(subscription)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(1))
        }
    }

    fn retryable() -> Result<usize, SyncError> {
        Err(SyncError::Retryable("429 Too Many Requests".into()))
    }

    fn no_delay() -> QueueConfig {
        QueueConfig::builder()
            .queue_delay(Duration::ZERO)
            .retry_backoff_base(Duration::from_secs(1))
            .build()
    }

    fn setup(
        config: QueueConfig,
        job: RecordingJob,
    ) -> (FetchQueue, Arc<RecordingJob>, UnboundedReceiver<SyncResult>) {
        let job = Arc::new(job);
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = FetchQueue::new(config, job.clone(), Arc::new(tx));
        (queue, job, rx)
    }

    async fn collect(rx: &mut UnboundedReceiver<SyncResult>, n: usize) -> Vec<SyncResult> {
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(rx.recv().await.expect("queue dropped the sink"));
        }
        results
    }

    fn sub(id: &str) -> SubscriptionId {
        SubscriptionId::from(id)
    }

    #[tokio::test(start_paused = true)]
    async fn never_runs_two_syncs_at_once() {
        let (queue, job, mut rx) = setup(no_delay(), RecordingJob::taking(Duration::from_secs(1)));
        queue.start();

        let mut requesters = Vec::new();
        for i in 0..6 {
            let queue = queue.clone();
            requesters.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300 * i)).await;
                queue.enqueue(&sub(&format!("s{i}")), Priority::Normal).unwrap();
            }));
        }
        collect(&mut rx, 6).await;

        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
        let runs = job.runs.lock().unwrap();
        for pair in runs.windows(2) {
            assert!(pair[1].started >= pair[0].finished);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn starts_by_priority_then_fifo() {
        let (queue, job, mut rx) = setup(no_delay(), RecordingJob::default());
        queue.enqueue(&sub("b"), Priority::Low).unwrap();
        queue.enqueue(&sub("a"), Priority::High).unwrap();
        queue.enqueue(&sub("c"), Priority::Normal).unwrap();
        queue.enqueue(&sub("d"), Priority::High).unwrap();
        queue.enqueue(&sub("e"), Priority::Low).unwrap();
        queue.start();

        collect(&mut rx, 5).await;
        assert_eq!(job.order(), ["a", "d", "c", "b", "e"]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_requests_coalesce_at_highest_priority() {
        let (queue, job, mut rx) = setup(no_delay(), RecordingJob::default());
        let first = queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        let second = queue.enqueue(&sub("a"), Priority::High).unwrap();
        let third = queue.enqueue(&sub("a"), Priority::Low).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, third);

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].priority, Priority::High);

        queue.start();
        let results = collect(&mut rx, 1).await;
        assert!(results[0].answers(first));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(job.order(), ["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn escalated_task_overtakes_its_old_tier() {
        let (queue, job, mut rx) = setup(no_delay(), RecordingJob::default());
        queue.enqueue(&sub("x"), Priority::Normal).unwrap();
        queue.enqueue(&sub("a"), Priority::Low).unwrap();
        queue.enqueue(&sub("a"), Priority::High).unwrap();
        queue.start();

        collect(&mut rx, 2).await;
        assert_eq!(job.order(), ["a", "x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_tasks_from_previous_completion() {
        let config = QueueConfig::builder().queue_delay(Duration::from_secs(5)).build();
        let (queue, job, mut rx) = setup(config, RecordingJob::taking(Duration::from_secs(2)));
        queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        queue.enqueue(&sub("b"), Priority::Normal).unwrap();
        queue.start();

        collect(&mut rx, 2).await;
        assert!(job.gap_before(1) >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queue_still_waits_out_the_delay() {
        let config = QueueConfig::builder().queue_delay(Duration::from_secs(5)).build();
        let (queue, job, mut rx) = setup(config, RecordingJob::default());
        queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        queue.start();
        collect(&mut rx, 1).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.enqueue(&sub("b"), Priority::High).unwrap();
        collect(&mut rx, 1).await;
        assert!(job.gap_before(1) >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_within_cap() {
        let job = RecordingJob::default().script("a", vec![retryable(), retryable(), Ok(4)]);
        let (queue, job, mut rx) = setup(no_delay(), job);
        let id = queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        queue.start();

        let result = collect(&mut rx, 1).await.remove(0);
        assert!(result.answers(id));
        assert_eq!(result.state(), TaskState::Completed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.new_message_count, 4);
        assert_eq!(job.order(), ["a", "a", "a"]);
        // exponential: 1s, then 2s
        assert!(job.gap_before(1) >= Duration::from_secs(1));
        assert!(job.gap_before(2) >= Duration::from_secs(2));
        assert_eq!(queue.status().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let job = RecordingJob::default().script("a", (0..10).map(|_| retryable()).collect());
        let (queue, job, mut rx) = setup(no_delay(), job);
        queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        queue.start();

        let result = collect(&mut rx, 1).await.remove(0);
        assert_eq!(result.state(), TaskState::Failed);
        assert_eq!(result.attempts, 3);
        assert!(result.error.as_ref().is_some_and(SyncError::is_retryable));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(job.order().len(), 3);
        assert_eq!(queue.status().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_means_one() {
        let job = RecordingJob::default().script("a", vec![retryable(), Ok(1)]);
        let config = QueueConfig::builder()
            .queue_delay(Duration::ZERO)
            .max_retry_attempts(0)
            .build();
        let (queue, _, mut rx) = setup(config, job);
        queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        queue.start();

        let result = collect(&mut rx, 1).await.remove(0);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.state(), TaskState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let revoked = SyncError::CredentialRefreshFailed("invalid_grant".into());
        let job = RecordingJob::default().script("a", vec![Err(revoked.clone())]);
        let (queue, job, mut rx) = setup(no_delay(), job);
        queue.enqueue(&sub("a"), Priority::High).unwrap();
        queue.start();

        let result = collect(&mut rx, 1).await.remove(0);
        assert_eq!(result.error, Some(revoked));
        assert_eq!(result.attempts, 1);
        assert_eq!(job.order(), ["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_does_not_block_other_tasks() {
        let job = RecordingJob::default().script("a", vec![retryable()]);
        let config = QueueConfig::builder()
            .queue_delay(Duration::ZERO)
            .retry_backoff_base(Duration::from_secs(30))
            .build();
        let (queue, job, mut rx) = setup(config, job);
        queue.enqueue(&sub("a"), Priority::High).unwrap();
        queue.enqueue(&sub("b"), Priority::Low).unwrap();
        queue.start();

        collect(&mut rx, 2).await;
        assert_eq!(job.order(), ["a", "b", "a"]);
        let runs = job.runs.lock().unwrap();
        assert!(runs[2].started.duration_since(runs[0].finished) >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn cancels_only_waiting_tasks() {
        let (queue, job, mut rx) = setup(no_delay(), RecordingJob::taking(Duration::from_secs(5)));
        let a = queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        let b = queue.enqueue(&sub("b"), Priority::Normal).unwrap();
        assert!(queue.cancel(b));
        assert!(!queue.cancel(b));
        assert_eq!(queue.state(b), None);

        queue.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.state(a), Some(TaskState::Running));
        assert_eq!(queue.status().current, Some(sub("a")));
        assert!(!queue.cancel(a));

        collect(&mut rx, 1).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(job.order(), ["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_everything_waiting() {
        let (queue, job, mut rx) = setup(no_delay(), RecordingJob::default());
        queue
            .enqueue_all(&[sub("a"), sub("b"), sub("c")], Priority::Low)
            .unwrap();
        assert_eq!(queue.clear(), 3);
        assert_eq!(queue.status().pending, 0);

        queue.enqueue(&sub("d"), Priority::Low).unwrap();
        queue.start();
        collect(&mut rx, 1).await;
        assert_eq!(job.order(), ["d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_cannot_be_cancelled_or_cleared() {
        let job = RecordingJob::taking(Duration::from_secs(2)).script("a", vec![retryable()]);
        let config = QueueConfig::builder()
            .queue_delay(Duration::ZERO)
            .retry_backoff_base(Duration::from_secs(30))
            .build();
        let (queue, job, mut rx) = setup(config, job);
        let first = queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        queue.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let follow_up = queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        queue.enqueue(&sub("b"), Priority::Low).unwrap();

        // b runs at 2s and finishes at 4s, the retry of a is due at 32s
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.state(first), Some(TaskState::Retrying));
        assert!(!queue.cancel(first));
        queue.enqueue(&sub("c"), Priority::Low).unwrap();
        assert_eq!(queue.clear(), 1);

        let results = collect(&mut rx, 2).await;
        assert!(results[1].answers(first) && results[1].answers(follow_up));
        assert_eq!(results[1].state(), TaskState::Completed);
        assert_eq!(job.order(), ["a", "b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_stats_zeroes_counters() {
        let job = RecordingJob::default().script("b", vec![Err(SyncError::Fatal("gone".into()))]);
        let (queue, _, mut rx) = setup(no_delay(), job);
        queue.enqueue_all(&[sub("a"), sub("b")], Priority::Normal).unwrap();
        queue.start();
        collect(&mut rx, 2).await;
        assert_eq!((queue.status().completed, queue.status().failed), (1, 1));

        queue.reset_stats();
        let status = queue.status();
        assert_eq!((status.completed, status.failed), (0, 0));
        assert!(status.is_running);
    }

    #[tokio::test(start_paused = true)]
    async fn request_during_run_becomes_follow_up() {
        let (queue, job, mut rx) = setup(no_delay(), RecordingJob::taking(Duration::from_secs(2)));
        let first = queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        queue.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let follow_up = queue.enqueue(&sub("a"), Priority::High).unwrap();
        assert_ne!(first, follow_up);
        assert_eq!(queue.state(follow_up), Some(TaskState::Pending));

        let results = collect(&mut rx, 2).await;
        assert!(results[0].answers(first));
        assert!(results[1].answers(follow_up));
        assert_eq!(job.order(), ["a", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_absorbs_follow_up() {
        let job = RecordingJob::taking(Duration::from_secs(2)).script("a", vec![retryable()]);
        let (queue, job, mut rx) = setup(no_delay(), job);
        let first = queue.enqueue(&sub("a"), Priority::Low).unwrap();
        queue.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let follow_up = queue.enqueue(&sub("a"), Priority::High).unwrap();

        // first attempt fails at 2s, the retry is due at 3s
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(queue.state(follow_up), Some(TaskState::Retrying));
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].priority, Priority::High);

        let result = collect(&mut rx, 1).await.remove(0);
        assert!(result.answers(first) && result.answers(follow_up));
        assert_eq!(result.attempts, 2);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(job.order(), ["a", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_queue_refuses_when_full() {
        let config = QueueConfig::builder().max_pending(1).build();
        let (queue, _, _rx) = setup(config, RecordingJob::default());
        queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        assert_eq!(queue.enqueue(&sub("b"), Priority::High), Err(QueueError::Overflow(1)));
        // joining the existing task needs no room
        assert!(queue.enqueue(&sub("a"), Priority::High).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_running_task_finish() {
        let (queue, job, mut rx) = setup(no_delay(), RecordingJob::taking(Duration::from_secs(10)));
        queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        queue.enqueue(&sub("b"), Priority::Normal).unwrap();
        queue.start();
        assert!(queue.is_running());
        tokio::time::sleep(Duration::from_secs(1)).await;

        queue.shutdown().await;
        let result = rx.try_recv().unwrap();
        assert_eq!(result.subscription_id, sub("a"));
        assert_eq!(job.order(), ["a"]);

        let status = queue.status();
        assert!(!status.is_running);
        assert_eq!(status.pending, 1);
        assert_eq!(queue.enqueue(&sub("c"), Priority::High), Err(QueueError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_survives_a_lagging_receiver() {
        let (tx, mut early) = broadcast::channel(1);
        let mut late = tx.subscribe();
        let queue = FetchQueue::new(no_delay(), Arc::new(RecordingJob::default()), Arc::new(tx));
        let a = queue.enqueue(&sub("a"), Priority::High).unwrap();
        let b = queue.enqueue(&sub("b"), Priority::Low).unwrap();
        queue.start();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(queue.status().completed, 2);

        // only the newest result is still buffered
        let found = queue.wait_for(&mut late, b).await.unwrap();
        assert_eq!(found.subscription_id, sub("b"));
        let missed = queue.wait_for(&mut early, a).await.unwrap_err();
        assert_eq!(missed, QueueError::ResultMissed(a));
    }

    #[tokio::test(start_paused = true)]
    async fn broadcasts_results_to_every_subscriber() {
        let (tx, mut first) = broadcast::channel(8);
        let mut second = tx.subscribe();
        let queue = FetchQueue::new(no_delay(), Arc::new(RecordingJob::default()), Arc::new(tx));
        queue.enqueue(&sub("a"), Priority::Normal).unwrap();
        queue.start();

        assert_eq!(first.recv().await.unwrap().subscription_id, sub("a"));
        assert_eq!(second.recv().await.unwrap().subscription_id, sub("a"));
    }
}
