//! Tick-driven periodic job scheduler with startup/shutdown hooks.
//!
//! One loop wakes every tick interval and launches each job whose period
//! divides the current tick count. Jobs and hooks run as detached tasks: a
//! failing or panicking task is logged and never takes the loop down. All
//! launched tasks are tracked so a caller can optionally wait for them after
//! [`Scheduler::stop`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, Instrument};

pub const CRATE_NAME: &str = "cerberus-sched";

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

pub type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// Zero-argument async action shared by every dispatch of a job or hook.
pub type Action = Arc<dyn Fn() -> ActionFuture + Send + Sync>;

pub fn action<F, Fut>(f: F) -> Action
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as ActionFuture)
}

/// A named action fired every `period` ticks, starting at tick 0.
#[derive(Clone)]
pub struct Job {
    name: String,
    period: u64,
    action: Action,
}

impl Job {
    pub fn new<F, Fut>(name: impl Into<String>, period: u64, f: F) -> anyhow::Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        anyhow::ensure!(period > 0, "job {name} must have a period of at least one tick");
        Ok(Self {
            name,
            period,
            action: action(f),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn is_due(&self, tick: u64) -> bool {
        tick % self.period == 0
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Hook {
    name: String,
    action: Action,
}

impl Hook {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: action(f),
        }
    }
}

#[derive(Default)]
struct Registry {
    jobs: Vec<Job>,
    startup: Vec<Hook>,
    shutdown: Vec<Hook>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    tick_loop: Option<JoinHandle<()>>,
}

struct Shared {
    tick_interval: Duration,
    registry: Mutex<Registry>,
    state: Mutex<RunState>,
    ticks: Arc<AtomicU64>,
    tracker: TaskTracker,
    stopped: watch::Sender<bool>,
}

/// Cheaply cloneable handle to one scheduler.
///
/// Jobs and hooks must be registered before [`Scheduler::run`]; the tick loop
/// works on the job list captured at start.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How one detached run of a job or hook ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Runs the action to completion, turning errors and panics into log events.
async fn run_isolated(kind: &'static str, name: &str, action: Action) -> TaskOutcome {
    let outcome = match AssertUnwindSafe(async move { action().await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => TaskOutcome::Completed,
        Ok(Err(err)) => TaskOutcome::Failed(format!("{err:#}")),
        Err(payload) => TaskOutcome::Panicked(panic_message(payload.as_ref())),
    };
    match &outcome {
        TaskOutcome::Completed => {}
        TaskOutcome::Failed(error) => {
            error!(kind, name = %name, error = %error, "scheduled task failed");
        }
        TaskOutcome::Panicked(panic) => {
            error!(kind, name = %name, panic = %panic, "scheduled task panicked");
        }
    }
    outcome
}

fn spawn_isolated(tracker: &TaskTracker, kind: &'static str, name: String, action: Action) {
    let span = info_span!("task", kind, name = %name);
    tracker.spawn(
        async move {
            run_isolated(kind, &name, action).await;
        }
        .instrument(span),
    );
}

async fn tick_loop(jobs: Vec<Job>, interval: Duration, ticks: Arc<AtomicU64>, tracker: TaskTracker) {
    loop {
        let tick = ticks.load(Ordering::SeqCst);
        for job in jobs.iter().filter(|job| job.is_due(tick)) {
            debug!(job = %job.name, tick, "dispatching job");
            spawn_isolated(&tracker, "job", job.name.clone(), job.action.clone());
        }
        ticks.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(interval).await;
    }
}

impl Scheduler {
    pub fn new(tick_interval: Duration) -> Self {
        let (stopped, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                tick_interval,
                registry: Mutex::new(Registry::default()),
                state: Mutex::new(RunState::default()),
                ticks: Arc::new(AtomicU64::new(0)),
                tracker: TaskTracker::new(),
                stopped,
            }),
        }
    }

    pub fn register(&self, job: Job) {
        debug!(job = %job.name, period = job.period, "registering job");
        lock(&self.shared.registry).jobs.push(job);
    }

    pub fn on_startup(&self, hook: Hook) {
        lock(&self.shared.registry).startup.push(hook);
    }

    pub fn on_shutdown(&self, hook: Hook) {
        lock(&self.shared.registry).shutdown.push(hook);
    }

    pub fn jobs(&self) -> Vec<Job> {
        lock(&self.shared.registry).jobs.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).running
    }

    /// Number of ticks dispatched so far.
    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }

    /// Fires startup hooks and starts the tick loop. No-op while running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(&self) {
        let mut state = lock(&self.shared.state);
        if state.running {
            return;
        }
        state.running = true;

        let (jobs, startup) = {
            let registry = lock(&self.shared.registry);
            (registry.jobs.clone(), registry.startup.clone())
        };
        info!(jobs = jobs.len(), "scheduler starting");

        for hook in startup {
            spawn_isolated(&self.shared.tracker, "startup", hook.name, hook.action);
        }

        state.tick_loop = Some(tokio::spawn(tick_loop(
            jobs,
            self.shared.tick_interval,
            Arc::clone(&self.shared.ticks),
            self.shared.tracker.clone(),
        )));
        self.shared.stopped.send_replace(false);
    }

    /// Cancels the tick loop and fires shutdown hooks. No-op unless running.
    ///
    /// Jobs already dispatched keep running; see [`Scheduler::drain`].
    pub fn stop(&self) {
        let mut state = lock(&self.shared.state);
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(handle) = state.tick_loop.take() {
            handle.abort();
        }
        drop(state);

        info!(ticks = self.tick_count(), "scheduler stopping");
        let shutdown = lock(&self.shared.registry).shutdown.clone();
        for hook in shutdown {
            spawn_isolated(&self.shared.tracker, "shutdown", hook.name, hook.action);
        }
        self.shared.stopped.send_replace(true);
    }

    /// Resolves once the scheduler is not running.
    pub async fn stopped(&self) {
        let mut rx = self.shared.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Waits up to `timeout` for every dispatched job and hook task to
    /// finish. Returns `false` if some were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let tracker = &self.shared.tracker;
        tracker.close();
        let finished = tokio::time::timeout(timeout, tracker.wait()).await.is_ok();
        tracker.reopen();
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting_job(name: &str, period: u64, hits: &Arc<AtomicUsize>) -> Job {
        let hits = Arc::clone(hits);
        Job::new(name, period, move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .expect("job")
    }

    fn counting_hook(name: &str, hits: &Arc<AtomicUsize>) -> Hook {
        let hits = Arc::clone(hits);
        Hook::new(name, move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn unavailable() -> anyhow::Result<()> {
        anyhow::bail!("wiki unavailable")
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_task_reports_its_payload() {
        assert_eq!(
            run_isolated("job", "panics", action(explode)).await,
            TaskOutcome::Panicked("boom".to_string())
        );
        assert_eq!(
            run_isolated("job", "fails", action(unavailable)).await,
            TaskOutcome::Failed("wiki unavailable".to_string())
        );
        let sync_panic: Action = Arc::new(|| -> ActionFuture { panic!("before the future") });
        assert_eq!(
            run_isolated("hook", "eager", sync_panic).await,
            TaskOutcome::Panicked("before the future".to_string())
        );
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn job_is_due_on_multiples_of_its_period() {
        let job = counting_job("mark", 3, &counter());
        let due: Vec<u64> = (0..8).filter(|t| job.is_due(*t)).collect();
        assert_eq!(due, vec![0, 3, 6]);
    }

    #[test]
    fn zero_period_is_rejected() {
        let err = Job::new("broken", 0, || async { Ok(()) }).expect_err("zero period");
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_fire_on_their_ticks() {
        let every_third = counter();
        let every_tick = counter();
        let scheduler = Scheduler::new(Duration::from_secs(60));
        scheduler.register(counting_job("every-third", 3, &every_third));
        scheduler.register(counting_job("every-tick", 1, &every_tick));

        scheduler.run();
        tokio::time::sleep(Duration::from_secs(6 * 60 + 30)).await;
        settle().await;

        assert_eq!(every_third.load(Ordering::SeqCst), 3);
        assert_eq!(every_tick.load(Ordering::SeqCst), 7);
        assert_eq!(scheduler.tick_count(), 7);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn run_is_idempotent() {
        let started = counter();
        let scheduler = Scheduler::new(Duration::from_secs(60));
        scheduler.on_startup(counting_hook("hello", &started));

        scheduler.run();
        scheduler.run();
        settle().await;

        assert!(scheduler.is_running());
        assert_eq!(started.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_tick_dispatches_nothing() {
        let hits = counter();
        let shutdowns = counter();
        let scheduler = Scheduler::new(Duration::from_secs(60));
        scheduler.register(counting_job("mark", 1, &hits));
        scheduler.on_shutdown(counting_hook("bye", &shutdowns));

        scheduler.run();
        scheduler.stop();
        scheduler.stop();
        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;

        assert!(!scheduler.is_running());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.tick_count(), 0);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_run_skips_shutdown_hooks() {
        let shutdowns = counter();
        let scheduler = Scheduler::new(Duration::from_secs(60));
        scheduler.on_shutdown(counting_hook("bye", &shutdowns));

        scheduler.stop();
        settle().await;

        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_jobs_do_not_stop_the_loop() {
        let hits = counter();
        let scheduler = Scheduler::new(Duration::from_secs(60));
        scheduler.register(Job::new("fails", 1, unavailable).expect("job"));
        scheduler.register(Job::new("panics", 1, explode).expect("job"));
        scheduler.register(counting_job("healthy", 1, &hits));

        scheduler.run();
        tokio::time::sleep(Duration::from_secs(150)).await;
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_running());
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_in_flight_jobs() {
        let finished = counter();
        let scheduler = Scheduler::new(Duration::from_secs(60));
        let done = Arc::clone(&finished);
        scheduler.register(
            Job::new("slow", 10, move || {
                let done = Arc::clone(&done);
                async move {
                    tokio::time::sleep(Duration::from_secs(20)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .expect("job"),
        );

        scheduler.run();
        settle().await;
        scheduler.stop();
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        assert!(scheduler.drain(Duration::from_secs(30)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_resolves_after_stop() {
        let scheduler = Scheduler::new(Duration::from_secs(60));
        scheduler.run();
        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.stopped().await })
        };
        settle().await;
        assert!(!waiter.is_finished());

        scheduler.stop();
        waiter.await.expect("waiter");
    }
}
