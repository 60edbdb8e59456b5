use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::task::{Wake, Waker};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use crate::runtime::fiber::{yield_to_hold, Fiber, FiberCallback, FiberState};

/// Identifies one worker thread of a [Scheduler]. Work items carrying a worker id run only on
///  that worker.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct WorkerId(usize);
impl WorkerId {
    pub fn new(index: usize) -> WorkerId {
        WorkerId(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Upper bound for a parked worker's sleep, so that it notices work for its own affinity or
///  the stop condition even if a wakeup went to a different worker
const IDLE_PARK_TIMEOUT: Duration = Duration::from_millis(50);

enum Task {
    Fiber(Arc<Fiber>),
    Callback(FiberCallback),
}

struct WorkItem {
    task: Task,
    affinity: Option<WorkerId>,
}

struct SchedulerShared {
    name: String,
    queue: Mutex<VecDeque<WorkItem>>,
    condvar: Condvar,
    /// number of workers currently running a work item, guarded by `queue` for changes that
    ///  take work from it
    active_threads: AtomicUsize,
    stop_requested: AtomicBool,
    /// number of endpoints and sessions bound to each worker
    loads: Vec<AtomicUsize>,
}

impl SchedulerShared {
    fn push(&self, item: WorkItem) {
        self.queue.lock().unwrap().push_back(item);
        self.tickle();
    }

    fn tickle(&self) {
        self.condvar.notify_all();
    }

    fn is_eligible(item: &WorkItem, worker: WorkerId) -> bool {
        item.affinity.map_or(true, |a| a == worker)
    }

    fn take_next(&self, worker: WorkerId) -> Option<WorkItem> {
        let mut queue = self.queue.lock().unwrap();
        let pos = queue.iter().position(|item| Self::is_eligible(item, worker))?;
        let item = queue.remove(pos)?;
        self.active_threads.fetch_add(1, Ordering::AcqRel);

        let more_work = !queue.is_empty();
        drop(queue);
        if more_work {
            self.tickle();
        }
        Some(item)
    }

    fn finish_item(&self) {
        self.active_threads.fetch_sub(1, Ordering::AcqRel);
        if self.stop_requested.load(Ordering::Acquire) {
            self.tickle();
        }
    }

    fn stopping(&self) -> bool {
        let queue = self.queue.lock().unwrap();
        self.stop_requested.load(Ordering::Acquire)
            && queue.is_empty()
            && self.active_threads.load(Ordering::Acquire) == 0
    }

    /// Blocks the calling worker until work may be available
    fn park(&self, worker: WorkerId) {
        let queue = self.queue.lock().unwrap();
        if self.stop_requested.load(Ordering::Acquire) || queue.iter().any(|item| Self::is_eligible(item, worker)) {
            return;
        }
        let _ = self.condvar.wait_timeout(queue, IDLE_PARK_TIMEOUT);
    }
}

/// Re-queues a fiber on hold when it is woken
struct FiberWaker {
    fiber: Arc<Fiber>,
    shared: Weak<SchedulerShared>,
}
impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.fiber.wake() {
            match self.shared.upgrade() {
                Some(shared) => shared.push(WorkItem {
                    task: Task::Fiber(self.fiber.clone()),
                    affinity: self.fiber.affinity(),
                }),
                None => debug!("scheduler is gone, dropping wakeup for fiber {}", self.fiber.id()),
            }
        }
    }
}

/// For fibers driven directly by their worker
struct NoopWaker;
impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

/// A fixed pool of worker threads running fibers and callbacks from a shared run queue.
///
/// Callbacks run to completion in a per-worker scratch fiber that is reused. Without work, a
///  worker runs its idle fiber which parks the thread. Workers exit once a stop was requested,
///  the queue is drained and no worker is busy.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    num_workers: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(name: &str, num_workers: usize) -> Scheduler {
        let num_workers = num_workers.max(1);
        Scheduler {
            shared: Arc::new(SchedulerShared {
                name: name.to_string(),
                queue: Default::default(),
                condvar: Condvar::new(),
                active_threads: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(false),
                loads: (0..num_workers).map(|_| AtomicUsize::new(0)).collect(),
            }),
            num_workers,
            threads: Default::default(),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let mut threads = self.threads.lock().unwrap();
        if !threads.is_empty() {
            warn!("scheduler {} is already started", self.shared.name);
            return Ok(());
        }

        info!("starting scheduler {} with {} workers", self.shared.name, self.num_workers);
        for index in 0..self.num_workers {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{}", self.shared.name, index))
                .spawn(move || run_worker(shared, WorkerId(index)))?;
            threads.push(handle);
        }
        Ok(())
    }

    /// Requests shutdown and waits for the workers to drain the queue and exit
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.tickle();

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                warn!("scheduler {} stopped from its own worker thread, not joining it", self.shared.name);
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread of scheduler {} panicked", self.shared.name);
            }
        }
        info!("scheduler {} stopped", self.shared.name);
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping()
    }

    /// Wakes parked workers
    pub fn tickle(&self) {
        self.shared.tickle();
    }

    pub fn schedule(&self, affinity: Option<WorkerId>, callback: impl FnOnce() + Send + 'static) {
        self.shared.push(WorkItem {
            task: Task::Callback(Box::new(callback)),
            affinity: self.checked_affinity(affinity),
        });
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        let affinity = self.checked_affinity(fiber.affinity());
        self.shared.push(WorkItem {
            task: Task::Fiber(fiber),
            affinity,
        });
    }

    pub fn spawn(&self, affinity: Option<WorkerId>, future: impl Future<Output = ()> + Send + 'static) -> Arc<Fiber> {
        let fiber = Arc::new(Fiber::from_future(future, self.checked_affinity(affinity)));
        self.schedule_fiber(fiber.clone());
        fiber
    }

    /// Binds an endpoint or session to the worker with the fewest bindings
    pub fn assign_worker(&self) -> WorkerId {
        let (index, load) = self.shared.loads.iter()
            .enumerate()
            .min_by_key(|(_, load)| load.load(Ordering::Acquire))
            .unwrap_or((0, &self.shared.loads[0]));
        load.fetch_add(1, Ordering::AcqRel);
        WorkerId(index)
    }

    pub fn release_worker(&self, worker: WorkerId) {
        if let Some(load) = self.shared.loads.get(worker.0) {
            let _ = load.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    pub fn worker_load(&self, worker: WorkerId) -> usize {
        self.shared.loads.get(worker.0)
            .map(|load| load.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn checked_affinity(&self, affinity: Option<WorkerId>) -> Option<WorkerId> {
        match affinity {
            Some(worker) if worker.0 >= self.num_workers => {
                warn!("affinity {:?} exceeds the number of workers of scheduler {} - ignoring it", worker, self.shared.name);
                None
            }
            other => other,
        }
    }
}

fn run_worker(shared: Arc<SchedulerShared>, worker: WorkerId) {
    debug!("worker {:?} of scheduler {} started", worker, shared.name);

    let noop_waker = Waker::from(Arc::new(NoopWaker));
    let scratch = Fiber::empty();
    let idle = {
        let shared = shared.clone();
        Fiber::from_future(async move {
            while !shared.stopping() {
                shared.park(worker);
                yield_to_hold().await;
            }
        }, Some(worker))
    };

    loop {
        match shared.take_next(worker) {
            Some(WorkItem { task: Task::Fiber(fiber), affinity }) => {
                let waker = Waker::from(Arc::new(FiberWaker {
                    fiber: fiber.clone(),
                    shared: Arc::downgrade(&shared),
                }));
                if fiber.resume(&waker) == FiberState::Ready {
                    shared.push(WorkItem { task: Task::Fiber(fiber), affinity });
                }
                shared.finish_item();
            }
            Some(WorkItem { task: Task::Callback(callback), .. }) => {
                match scratch.reset_callback(callback) {
                    Ok(()) => {
                        scratch.resume(&noop_waker);
                    }
                    Err(e) => error!("worker {:?}: {}", worker, e),
                }
                shared.finish_item();
            }
            None => {
                idle.wake();
                if idle.resume(&noop_waker) == FiberState::Term {
                    break;
                }
            }
        }
    }

    debug!("worker {:?} of scheduler {} terminated", worker, shared.name);
}
