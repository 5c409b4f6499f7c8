//! Consumer fan-out.
//!
//! Each distinct consumer gets one worker task fed by a bounded queue, so a
//! consumer sees reports in log order no matter how many filters it is
//! attached to. Workers for different consumers run concurrently, limited
//! by a shared semaphore. An invocation that errors, panics or times out is
//! recorded and does not affect any other invocation.
//!
//! Every queued invocation is tracked by the log position of its report
//! until it finishes, so checkpoints can stay behind undelivered reports.

use super::events::{PipelineEvent, Recorder};
use crate::config::DispatchConfig;
use crate::error::ConsumerError;
use crate::filter::{Consumer, FilterRule, RoutePlan};
use crate::metrics;
use futures::FutureExt;
use hwpc_shared::HwpcReport;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// How a single invocation ended, as far as the dispatch call knows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Delivered,
    Failed(ConsumerError),
    /// Still queued or running when the dispatch call returned
    Pending,
}

/// Outcome of one `(filter, consumer)` delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInvocationResult {
    pub filter: String,
    pub consumer: String,
    pub outcome: InvocationOutcome,
}

struct Job {
    position: u64,
    filter: Arc<str>,
    report: Arc<HwpcReport>,
    reply: oneshot::Sender<Result<(), ConsumerError>>,
}

#[derive(Clone)]
struct WorkerContext {
    recorder: Recorder,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    // Log position -> invocations not finished yet.
    unfinished: Arc<Mutex<BTreeMap<u64, usize>>>,
    abort: CancellationToken,
    invocation_timeout: Duration,
}

impl WorkerContext {
    fn start_one(&self, position: u64) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        metrics::IN_FLIGHT.inc();
        let mut unfinished = self.unfinished.lock().unwrap_or_else(PoisonError::into_inner);
        *unfinished.entry(position).or_insert(0) += 1;
    }

    /// The invocation will not run, but its report is still owed
    fn drop_one(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        metrics::IN_FLIGHT.dec();
    }

    fn finish_one(&self, position: u64) {
        self.drop_one();
        let mut unfinished = self.unfinished.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = unfinished.get_mut(&position) {
            *count -= 1;
            if *count == 0 {
                unfinished.remove(&position);
            }
        }
    }
}

struct Worker {
    sender: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    // Keyed by consumer identity (Arc data pointer).
    active: HashMap<usize, Worker>,
    // Workers of removed consumers that may still be draining their queue.
    retired: HashMap<usize, JoinHandle<()>>,
}

fn consumer_key(consumer: &Arc<dyn Consumer>) -> usize {
    Arc::as_ptr(consumer) as *const () as usize
}

pub struct Dispatcher {
    config: DispatchConfig,
    context: WorkerContext,
    workers: Mutex<Workers>,
    closed: AtomicBool,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, recorder: Recorder) -> Self {
        let context = WorkerContext {
            recorder,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            unfinished: Arc::new(Mutex::new(BTreeMap::new())),
            abort: CancellationToken::new(),
            invocation_timeout: config.invocation_timeout(),
        };
        Self {
            config,
            context,
            workers: Mutex::new(Workers::default()),
            closed: AtomicBool::new(false),
            tracker: TaskTracker::new(),
        }
    }

    /// Invocations queued or running
    pub fn in_flight(&self) -> usize {
        self.context.in_flight.load(Ordering::SeqCst)
    }

    /// Lowest log position with an invocation that has not finished: still
    /// queued or running, abandoned at shutdown, or never enqueued.
    pub fn lowest_unfinished(&self) -> Option<u64> {
        let unfinished = self
            .context
            .unfinished
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        unfinished.keys().next().copied()
    }

    /// Consumers with a live worker
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .len()
    }

    fn worker_for(&self, consumer: &Arc<dyn Consumer>) -> Option<mpsc::Sender<Job>> {
        let key = consumer_key(consumer);
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(worker) = workers.active.get(&key) {
            return Some(worker.sender.clone());
        }

        // A consumer registered again must not overtake its previous worker.
        let previous = workers.retired.remove(&key);
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        debug!(consumer = consumer.name(), "Starting consumer worker");
        let handle = self.tracker.spawn(run_worker(
            consumer.clone(),
            receiver,
            self.context.clone(),
            previous,
        ));
        workers.active.insert(
            key,
            Worker {
                sender: sender.clone(),
                handle,
            },
        );
        Some(sender)
    }

    /// Stop the workers of consumers no longer attached to any of `rules`.
    ///
    /// A stopped worker finishes what is already queued, then exits.
    /// Returns the number of workers stopped.
    pub fn retain_consumers(&self, rules: &[Arc<FilterRule>]) -> usize {
        let live: HashSet<usize> = rules
            .iter()
            .flat_map(|rule| rule.consumers())
            .map(consumer_key)
            .collect();

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retired.retain(|_, handle| !handle.is_finished());
        let stale: Vec<usize> = workers
            .active
            .keys()
            .filter(|key| !live.contains(key))
            .copied()
            .collect();
        for key in &stale {
            if let Some(worker) = workers.active.remove(key) {
                // Dropping the sender ends the worker once its queue is empty.
                workers.retired.insert(*key, worker.handle);
            }
        }
        if !stale.is_empty() {
            debug!(stopped = stale.len(), "Stopped workers of removed consumers");
        }
        stale.len()
    }

    /// Hand one report to every delivery in `plan`, in plan order.
    ///
    /// Waits for queue space and for results until the dispatch timeout, or
    /// until `cancel` fires. Whatever has not finished by then is reported as
    /// [`InvocationOutcome::Pending`] and keeps running in its worker.
    pub async fn dispatch(
        &self,
        plan: &RoutePlan,
        report: &Arc<HwpcReport>,
        position: u64,
        cancel: &CancellationToken,
    ) -> Vec<ConsumerInvocationResult> {
        let deadline = tokio::time::Instant::now() + self.config.dispatch_timeout();
        let mut results = Vec::with_capacity(plan.deliveries.len());
        let mut waiting = Vec::with_capacity(plan.deliveries.len());

        for delivery in &plan.deliveries {
            let consumer = delivery.consumer.name().to_string();
            let enqueued = match self.worker_for(&delivery.consumer) {
                Some(sender) => {
                    self.enqueue(&sender, position, delivery.filter.clone(), report, deadline)
                        .await
                }
                None => Err(ConsumerError::Closed),
            };

            let outcome = match enqueued {
                Ok(receiver) => {
                    waiting.push((results.len(), receiver));
                    InvocationOutcome::Pending
                }
                Err(error) => {
                    self.fail(&delivery.filter, &consumer, error.clone());
                    InvocationOutcome::Failed(error)
                }
            };
            results.push(ConsumerInvocationResult {
                filter: delivery.filter.to_string(),
                consumer,
                outcome,
            });
        }

        for (index, receiver) in waiting {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => InvocationOutcome::Pending,
                reply = tokio::time::timeout_at(deadline, receiver) => match reply {
                    Ok(Ok(Ok(()))) => InvocationOutcome::Delivered,
                    Ok(Ok(Err(error))) => InvocationOutcome::Failed(error),
                    // Worker aborted before answering.
                    Ok(Err(_)) => InvocationOutcome::Failed(ConsumerError::Closed),
                    Err(_) => InvocationOutcome::Pending,
                },
            };
            results[index].outcome = outcome;
        }

        results
    }

    async fn enqueue(
        &self,
        sender: &mpsc::Sender<Job>,
        position: u64,
        filter: Arc<str>,
        report: &Arc<HwpcReport>,
        deadline: tokio::time::Instant,
    ) -> Result<oneshot::Receiver<Result<(), ConsumerError>>, ConsumerError> {
        let (reply, receiver) = oneshot::channel();
        let job = Job {
            position,
            filter,
            report: report.clone(),
            reply,
        };
        self.context.start_one(position);
        let sent = match tokio::time::timeout_at(deadline, sender.send(job)).await {
            Ok(Ok(())) => return Ok(receiver),
            Ok(Err(_)) => ConsumerError::Closed,
            Err(_) => ConsumerError::QueueFull,
        };
        self.context.drop_one();
        Err(sent)
    }

    fn fail(&self, filter: &str, consumer: &str, error: ConsumerError) {
        metrics::INVOCATIONS_TOTAL
            .with_label_values(&[filter, "error"])
            .inc();
        self.context.recorder.record(PipelineEvent::ConsumerFailed {
            filter: filter.to_string(),
            consumer: consumer.to_string(),
            error,
        });
    }

    /// Stop accepting work and let workers finish their queues.
    ///
    /// Returns the number of invocations abandoned because they were still
    /// queued or running after `drain_timeout`. Their positions stay in
    /// [`Dispatcher::lowest_unfinished`].
    pub async fn shutdown(&self, drain_timeout: Duration) -> usize {
        {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::SeqCst);
            // Dropping the senders lets each worker exit once its queue is empty.
            workers.active.clear();
            workers.retired.clear();
        }
        self.tracker.close();

        if tokio::time::timeout(drain_timeout, self.tracker.wait()).await.is_ok() {
            return 0;
        }

        let abandoned = self.in_flight();
        warn!(abandoned, ?drain_timeout, "Drain timeout expired, abandoning consumer work");
        self.context.abort.cancel();
        self.tracker.wait().await;
        self.context.in_flight.store(0, Ordering::SeqCst);
        metrics::IN_FLIGHT.sub(abandoned as f64);
        abandoned
    }
}

async fn run_worker(
    consumer: Arc<dyn Consumer>,
    mut jobs: mpsc::Receiver<Job>,
    ctx: WorkerContext,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    loop {
        let job = tokio::select! {
            biased;
            _ = ctx.abort.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = ctx.abort.cancelled() => break,
            result = invoke(consumer.as_ref(), &job, &ctx) => result,
        };
        ctx.finish_one(job.position);

        match &result {
            Ok(()) => {
                ctx.recorder.stats().record_delivery();
                metrics::INVOCATIONS_TOTAL
                    .with_label_values(&[job.filter.as_ref(), "ok"])
                    .inc();
            }
            Err(error) => {
                metrics::INVOCATIONS_TOTAL
                    .with_label_values(&[job.filter.as_ref(), "error"])
                    .inc();
                ctx.recorder.record(PipelineEvent::ConsumerFailed {
                    filter: job.filter.to_string(),
                    consumer: consumer.name().to_string(),
                    error: error.clone(),
                });
            }
        }
        // The dispatch call may have stopped waiting.
        let _ = job.reply.send(result);
    }
    debug!(consumer = consumer.name(), "Consumer worker stopped");
}

async fn invoke(consumer: &dyn Consumer, job: &Job, ctx: &WorkerContext) -> Result<(), ConsumerError> {
    let _permit = ctx
        .permits
        .acquire()
        .await
        .map_err(|_| ConsumerError::Closed)?;

    let started = Instant::now();
    let call = AssertUnwindSafe(consumer.consume(job.report.clone())).catch_unwind();
    let result = match tokio::time::timeout(ctx.invocation_timeout, call).await {
        Ok(Ok(result)) => result,
        Ok(Err(_panic)) => Err(ConsumerError::Panicked),
        Err(_) => Err(ConsumerError::TimedOut(ctx.invocation_timeout)),
    };
    metrics::INVOCATION_DURATION.observe(started.elapsed().as_secs_f64());
    result
}
