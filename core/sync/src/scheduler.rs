//! Background refresh scheduler.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use switchyard_common::{Error, Result};

/// Lifecycle of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Created,
    /// Running the initial cycle.
    Starting,
    Running,
    Stopping,
    Closed,
}

/// Outcome of one successful sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Settings declared this cycle.
    pub declared: usize,
    /// Settings whose rule store was replaced.
    pub updated: usize,
    pub rules_loaded: usize,
    /// Rules outside the tracked contexts or the effective features.
    pub rules_discarded: usize,
    /// Rules and defaults accepted after a lossy conversion.
    pub coercions: usize,
    /// Rules and defaults rejected during conversion.
    pub rejections: usize,
    /// The service reported no change since the last fetch.
    pub not_modified: bool,
    /// Service calls repeated after a transient failure.
    pub retries: usize,
    pub duration: Duration,
}

/// Callbacks fired after every cycle.
///
/// Exactly one of the two runs per cycle, whether the cycle was the initial
/// one, periodic, or a manual reload.
pub trait UpdateHooks: Send + Sync {
    fn on_update_ok(&self, _report: &CycleReport) {}

    fn on_update_error(&self, _error: &Error) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl UpdateHooks for NoopHooks {}

/// Requests handled by the worker task.
#[derive(Debug)]
enum SchedulerRequest {
    Reload,
    Shutdown,
}

type Reply = oneshot::Sender<Result<CycleReport>>;

/// Runs sync cycles: once on start, then periodically and on demand.
///
/// Cycles never overlap. The period is measured from the end of the previous
/// cycle, whatever triggered it.
pub struct Scheduler {
    interval: Duration,
    hooks: Arc<dyn UpdateHooks>,
    state: Arc<Mutex<SchedulerState>>,
    request_tx: Mutex<Option<mpsc::Sender<(SchedulerRequest, Reply)>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Set once the worker has exited and the state is `Closed`.
    closed: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(interval: Duration, hooks: Arc<dyn UpdateHooks>) -> Self {
        Self {
            interval,
            hooks,
            state: Arc::new(Mutex::new(SchedulerState::Created)),
            request_tx: Mutex::new(None),
            worker: Mutex::new(None),
            closed: watch::channel(false).0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the first cycle, then spawn the worker on `handle`.
    ///
    /// # Errors
    /// - `Error::InvalidState` if the scheduler was already started
    /// - `Error::SchedulerFatal` if the first cycle fails; the scheduler is
    ///   closed and cannot be restarted
    pub async fn start<F, Fut>(&self, handle: &Handle, cycle: F) -> Result<CycleReport>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CycleReport>> + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if *state != SchedulerState::Created {
                return Err(Error::InvalidState(format!(
                    "Scheduler cannot start from state {:?}",
                    *state
                )));
            }
            *state = SchedulerState::Starting;
        }

        info!("Starting scheduler, running initial sync");
        let first = cycle().await;
        report_outcome(self.hooks.as_ref(), &first);
        let report = match first {
            Ok(report) => report,
            Err(e) => {
                error!("Initial sync failed: {}", e);
                *self.state.lock() = SchedulerState::Closed;
                self.closed.send_replace(true);
                return Err(Error::SchedulerFatal(Box::new(e)));
            }
        };

        let (request_tx, request_rx) = mpsc::channel(16);
        let worker = Worker {
            interval: self.interval,
            hooks: self.hooks.clone(),
            request_rx,
            cycle,
        };
        *self.worker.lock() = Some(handle.spawn(worker.run()));

        {
            let mut state = self.state.lock();
            if *state != SchedulerState::Starting {
                // Dropping the sender stops the worker.
                return Err(Error::InvalidState(
                    "Scheduler was closed while starting".to_string(),
                ));
            }
            *self.request_tx.lock() = Some(request_tx);
            *state = SchedulerState::Running;
        }

        info!("Scheduler running, refreshing every {:?}", self.interval);
        Ok(report)
    }

    /// Run a cycle now and restart the period.
    ///
    /// Concurrent reloads are queued and run one after another.
    ///
    /// # Errors
    /// - `Error::InvalidState` if the scheduler is not running
    /// - The cycle's own error
    pub async fn reload(&self) -> Result<CycleReport> {
        let request_tx = {
            if *self.state.lock() != SchedulerState::Running {
                return Err(Error::InvalidState("Scheduler is not running".to_string()));
            }
            self.request_tx.lock().clone()
        }
        .ok_or_else(|| Error::InvalidState("Scheduler is not running".to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        request_tx
            .send((SchedulerRequest::Reload, reply_tx))
            .await
            .map_err(|_| Error::InvalidState("Scheduler is not running".to_string()))?;

        reply_rx.await.map_err(|_| {
            Error::InvalidState("Scheduler stopped before the reload completed".to_string())
        })?
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// An in-flight cycle completes first. Every caller returns only once the
    /// scheduler is closed, including one racing another `close`.
    pub async fn close(&self) {
        let mut closed = self.closed.subscribe();
        let stops_worker = {
            let mut state = self.state.lock();
            match *state {
                SchedulerState::Closed => return,
                SchedulerState::Stopping => false,
                SchedulerState::Running => {
                    *state = SchedulerState::Stopping;
                    true
                }
                SchedulerState::Created | SchedulerState::Starting => {
                    *state = SchedulerState::Closed;
                    self.closed.send_replace(true);
                    return;
                }
            }
        };
        if !stops_worker {
            debug!("Scheduler already stopping, waiting for the worker");
            let _ = closed.wait_for(|done| *done).await;
            return;
        }

        let request_tx = self.request_tx.lock().take();
        if let Some(request_tx) = request_tx {
            let (reply_tx, _) = oneshot::channel();
            let _ = request_tx.send((SchedulerRequest::Shutdown, reply_tx)).await;
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Scheduler worker did not exit cleanly: {}", e);
            }
        }

        *self.state.lock() = SchedulerState::Closed;
        self.closed.send_replace(true);
        info!("Scheduler closed");
    }
}

fn report_outcome(hooks: &dyn UpdateHooks, outcome: &Result<CycleReport>) {
    match outcome {
        Ok(report) => hooks.on_update_ok(report),
        Err(e) => hooks.on_update_error(e),
    }
}

struct Worker<F> {
    interval: Duration,
    hooks: Arc<dyn UpdateHooks>,
    request_rx: mpsc::Receiver<(SchedulerRequest, Reply)>,
    cycle: F,
}

impl<F, Fut> Worker<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CycleReport>> + Send + 'static,
{
    async fn run(mut self) {
        let mut next = Instant::now() + self.interval;
        debug!("Scheduler worker started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some((SchedulerRequest::Reload, reply)) => {
                        debug!("Processing reload request");
                        let result = (self.cycle)().await;
                        report_outcome(self.hooks.as_ref(), &result);
                        next = Instant::now() + self.interval;
                        let _ = reply.send(result);
                    }
                    Some((SchedulerRequest::Shutdown, _)) | None => {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                },

                _ = sleep_until(next) => {
                    debug!("Triggering periodic sync");
                    let result = (self.cycle)().await;
                    if let Err(e) = &result {
                        error!("Periodic sync failed: {}", e);
                    }
                    report_outcome(self.hooks.as_ref(), &result);
                    next = Instant::now() + self.interval;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHooks {
        ok: AtomicUsize,
        err: AtomicUsize,
    }

    impl UpdateHooks for CountingHooks {
        fn on_update_ok(&self, _report: &CycleReport) {
            self.ok.fetch_add(1, Ordering::SeqCst);
        }

        fn on_update_error(&self, _error: &Error) {
            self.err.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_cycle(
        count: Arc<AtomicUsize>,
    ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<CycleReport>> + Send + Sync + 'static
    {
        move || {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(CycleReport::default())
            })
        }
    }

    async fn close_and_count(scheduler: &Scheduler, finished: &AtomicUsize) -> usize {
        scheduler.close().await;
        assert_eq!(scheduler.state(), SchedulerState::Closed);
        finished.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_start_reload_close() {
        let hooks = Arc::new(CountingHooks::default());
        let scheduler = Scheduler::new(Duration::from_secs(3600), hooks.clone());
        let count = Arc::new(AtomicUsize::new(0));

        assert!(matches!(scheduler.reload().await, Err(Error::InvalidState(_))));

        scheduler
            .start(&Handle::current(), counting_cycle(count.clone()))
            .await
            .unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.reload().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.ok.load(Ordering::SeqCst), 2);

        assert!(scheduler
            .start(&Handle::current(), counting_cycle(count.clone()))
            .await
            .is_err());

        scheduler.close().await;
        scheduler.close().await;
        assert_eq!(scheduler.state(), SchedulerState::Closed);
        assert!(matches!(scheduler.reload().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_failed_start_is_fatal() {
        let hooks = Arc::new(CountingHooks::default());
        let scheduler = Scheduler::new(Duration::from_secs(3600), hooks.clone());

        let result = scheduler
            .start(&Handle::current(), || async {
                Err::<CycleReport, _>(Error::Transport("down".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::SchedulerFatal(_))));
        assert_eq!(scheduler.state(), SchedulerState::Closed);
        assert_eq!(hooks.err.load(Ordering::SeqCst), 1);
        assert!(scheduler.reload().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_cycles() {
        let hooks = Arc::new(CountingHooks::default());
        let scheduler = Scheduler::new(Duration::from_secs(10), hooks.clone());
        let count = Arc::new(AtomicUsize::new(0));

        scheduler
            .start(&Handle::current(), counting_cycle(count.clone()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert_eq!(hooks.ok.load(Ordering::SeqCst), 4);

        scheduler.close().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_close_waits_for_worker() {
        let hooks = Arc::new(CountingHooks::default());
        let scheduler = Arc::new(Scheduler::new(Duration::from_secs(3600), hooks.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();

        scheduler
            .start(&Handle::current(), move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let done = done.clone();
                async move {
                    if n > 0 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(CycleReport::default())
                }
            })
            .await
            .unwrap();

        let reload = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.reload().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        let (first, second) = tokio::join!(
            close_and_count(&scheduler, &finished),
            close_and_count(&scheduler, &finished)
        );
        assert_eq!((first, second), (2, 2));
        reload.await.unwrap().unwrap();
        assert_eq!(hooks.ok.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let scheduler = Scheduler::new(Duration::from_secs(3600), Arc::new(NoopHooks));
        scheduler.close().await;
        assert_eq!(scheduler.state(), SchedulerState::Closed);
        assert!(scheduler
            .start(&Handle::current(), || async { Ok(CycleReport::default()) })
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_failures_are_swallowed() {
        let hooks = Arc::new(CountingHooks::default());
        let scheduler = Scheduler::new(Duration::from_secs(10), hooks.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        scheduler
            .start(&Handle::current(), move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok(CycleReport::default())
                    } else {
                        Err(Error::Transport("down".to_string()))
                    }
                }
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(hooks.ok.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.err.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert!(matches!(scheduler.reload().await, Err(Error::Transport(_))));

        scheduler.close().await;
    }
}
