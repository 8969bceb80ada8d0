use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::pool::WorkerPool;
use crate::error::ProcessorError;

/// Lifecycle state of a recurring task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Started,
}

type Job = dyn Fn(&Rearm) -> Result<(), ProcessorError> + Send + Sync;

struct Shared {
    name: String,
    status: watch::Sender<Status>,
    /// A run is in flight or an immediate one is pending.
    busy: watch::Sender<bool>,
    /// The driver has exited.
    done: watch::Sender<bool>,
    /// A run is executing on a pool thread, possibly orphaned by `stop`.
    in_flight: watch::Sender<bool>,
    next_run: Mutex<Option<Instant>>,
    wake: Notify,
    /// Bumped on every start; a driver from an older start exits.
    generation: AtomicU64,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn next_run(&self) -> MutexGuard<'_, Option<Instant>> {
        match self.next_run.lock() {
            Ok(next) => next,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn request(&self, delay: Duration) {
        let at = Instant::now() + delay;
        {
            let mut next = self.next_run();
            *next = Some(match *next {
                Some(existing) if existing <= at => existing,
                _ => at,
            });
        }
        if delay.is_zero() {
            self.busy.send_replace(true);
        }
        self.wake.notify_one();
    }

    fn request_if_unarmed(&self, delay: Duration) {
        if self.next_run().is_none() {
            self.request(delay);
        }
    }

    fn settle(&self) {
        let immediate = self
            .next_run()
            .map(|at| at <= Instant::now())
            .unwrap_or(false);
        self.busy.send_replace(immediate);
    }
}

/// Marks a run as executing until dropped, wherever the job ends up.
struct InFlight(Arc<Shared>);

impl InFlight {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.in_flight.send_replace(true);
        Self(Arc::clone(shared))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.send_replace(false);
    }
}

/// Lets a run schedule the next one.
#[derive(Clone)]
pub struct Rearm {
    shared: Arc<Shared>,
    generation: u64,
}

impl Rearm {
    /// Run again as soon as the current run is over.
    pub fn immediately(&self) {
        self.after(Duration::ZERO);
    }

    /// Ignored once the schedule that started this run has been stopped or replaced.
    pub fn after(&self, delay: Duration) {
        if self.shared.is_current(self.generation) {
            self.shared.request(delay);
        }
    }
}

/// A recurring unit of work with at most one run in flight.
///
/// Every run is requested through `Rearm`; requests made while a run is in
/// flight are merged and honored once it returns.
pub struct SingletonTask {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SingletonTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                status: watch::channel(Status::Stopped).0,
                busy: watch::channel(false).0,
                done: watch::channel(true).0,
                in_flight: watch::channel(false).0,
                next_run: Mutex::new(None),
                wake: Notify::new(),
                generation: AtomicU64::new(0),
            }),
            driver: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn status(&self) -> Status {
        *self.shared.status.borrow()
    }

    /// Arm the first run right away and keep rearming as runs request.
    ///
    /// A run that fails without rearming is retried after `failure_delay`.
    /// Starting again replaces the schedule once the previous run, if any,
    /// has finished.
    pub fn start<F>(&self, pool: &WorkerPool, failure_delay: Duration, job: F)
    where
        F: Fn(&Rearm) -> Result<(), ProcessorError> + Send + Sync + 'static,
    {
        let mut driver = match self.driver.lock() {
            Ok(driver) => driver,
            Err(poisoned) => poisoned.into_inner(),
        };
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.done.send_replace(false);
        self.shared.status.send_replace(Status::Started);
        self.shared.request(Duration::ZERO);

        let job: Arc<Job> = Arc::new(job);
        let previous = driver.take();
        *driver = Some(pool.spawn(drive(
            Arc::clone(&self.shared),
            pool.clone(),
            job,
            failure_delay,
            generation,
            previous,
        )));
    }

    /// Stop arming runs. The returned future resolves once the run in
    /// flight, if any, has finished.
    pub fn pre_stop(&self) -> impl Future<Output = ()> + Send + 'static {
        self.shared.status.send_replace(Status::Stopped);
        self.shared.wake.notify_one();
        let mut done = self.shared.done.subscribe();
        let mut in_flight = self.shared.in_flight.subscribe();
        async move {
            let _ = done.wait_for(|done| *done).await;
            let _ = in_flight.wait_for(|running| !*running).await;
        }
    }

    /// Resolves when no run is in flight and none is due immediately.
    pub fn completion(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut busy = self.shared.busy.subscribe();
        async move {
            let _ = busy.wait_for(|busy| !*busy).await;
        }
    }

    /// Cancel the schedule. A blocking run already executing is not
    /// interrupted; nothing is scheduled after it and a later `start` waits
    /// for it before running again.
    pub async fn stop(&self) -> Result<(), ProcessorError> {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.status.send_replace(Status::Stopped);
        let handle = match self.driver.lock() {
            Ok(mut driver) => driver.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let result = match handle {
            Some(handle) => {
                handle.abort();
                match handle.await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_cancelled() => Ok(()),
                    Err(err) => Err(ProcessorError::Task(err)),
                }
            }
            None => Ok(()),
        };

        *self.shared.next_run() = None;
        self.shared.busy.send_replace(false);
        self.shared.done.send_replace(true);
        result
    }
}

async fn drive(
    shared: Arc<Shared>,
    pool: WorkerPool,
    job: Arc<Job>,
    failure_delay: Duration,
    generation: u64,
    previous: Option<JoinHandle<()>>,
) {
    let mut status = shared.status.subscribe();
    // the driver of an earlier start may still be finishing its run
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    debug!(task = %shared.name, generation, "task driver started");

    loop {
        if *status.borrow_and_update() == Status::Stopped || !shared.is_current(generation) {
            break;
        }

        let due = *shared.next_run();
        let now = Instant::now();
        match due {
            Some(at) if at <= now => {}
            Some(at) => {
                let keep_going = tokio::select! {
                    _ = tokio::time::sleep_until(at) => true,
                    _ = shared.wake.notified() => true,
                    changed = status.changed() => changed.is_ok(),
                };
                if !keep_going {
                    break;
                }
                continue;
            }
            None => {
                let keep_going = tokio::select! {
                    _ = shared.wake.notified() => true,
                    changed = status.changed() => changed.is_ok(),
                };
                if !keep_going {
                    break;
                }
                continue;
            }
        }

        if *shared.in_flight.borrow() {
            let mut in_flight = shared.in_flight.subscribe();
            let keep_going = tokio::select! {
                finished = async { in_flight.wait_for(|running| !*running).await.is_ok() } => finished,
                changed = status.changed() => changed.is_ok(),
            };
            if !keep_going {
                break;
            }
            continue;
        }

        *shared.next_run() = None;
        shared.busy.send_replace(true);

        let rearm = Rearm {
            shared: Arc::clone(&shared),
            generation,
        };
        let run = Arc::clone(&job);
        let guard = InFlight::enter(&shared);
        let outcome = match pool
            .run(move || {
                let _guard = guard;
                run(&rearm)
            })
            .await
        {
            Ok(result) => result,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            warn!(task = %shared.name, "run failed: {}", err);
            if shared.is_current(generation) {
                shared.request_if_unarmed(failure_delay);
            }
        }
        if shared.is_current(generation) {
            shared.settle();
        }
    }

    if shared.is_current(generation) {
        shared.busy.send_replace(false);
        shared.done.send_replace(true);
    }
    debug!(task = %shared.name, generation, "task driver stopped");
}
