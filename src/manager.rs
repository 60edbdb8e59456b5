use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use anyhow::bail;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};
use crate::config::ManagerConfig;
use crate::endpoint::Endpoint;
use crate::runtime::clock::MonotonicClock;
use crate::runtime::handle::RuntimeHandle;
use crate::runtime::scheduler::{Scheduler, WorkerId};
use crate::runtime::timer::{TimerFrontListener, TimerManager};

const WAKER_TOKEN: Token = Token(0);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct EndpointId(usize);

/// Interrupts a blocking poll when a timer becomes due earlier than the poll's timeout
struct PollWakeup {
    waker: Arc<Waker>,
}
impl TimerFrontListener for PollWakeup {
    fn on_timer_inserted_at_front(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("error waking the poll thread: {}", e);
        }
    }
}

struct EndpointSlot {
    endpoint: Arc<dyn Endpoint>,
    worker: WorkerId,
    fd: RawFd,
}

struct ManagerShared {
    registry: Registry,
    endpoints: RwLock<FxHashMap<usize, EndpointSlot>>,
    runtime: RuntimeHandle,
    stopping: AtomicBool,
}

impl ManagerShared {
    fn on_readable(&self, token: usize) {
        let endpoint = self.endpoints.read().unwrap()
            .get(&token)
            .map(|slot| (slot.endpoint.clone(), slot.worker));

        match endpoint {
            Some((endpoint, worker)) => {
                self.runtime.schedule(Some(worker), move || endpoint.on_read_event());
            }
            None => trace!("readiness for removed endpoint {} - ignoring", token),
        }
    }

    fn dispatch_expired_timers(&self) {
        for timer in self.runtime.timers().list_expired() {
            let callback = timer.callback;
            self.runtime.schedule(timer.affinity, move || callback());
        }
    }
}

/// Ties endpoints to a runtime: one thread polls the sockets of all registered endpoints for
///  readability and waits for the earliest timer, and a pool of workers runs the endpoints'
///  read handlers and expired timers.
///
/// Endpoints are pinned to the least loaded worker when they are added, and so are the
///  sessions created by a server.
pub struct ConnectionManager {
    config: ManagerConfig,
    shared: Arc<ManagerShared>,
    waker: Arc<Waker>,
    poll: Mutex<Option<Poll>>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
    next_token: AtomicUsize,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig) -> anyhow::Result<ConnectionManager> {
        config.validate()?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let registry = poll.registry().try_clone()?;

        let timers = Arc::new(TimerManager::new(Arc::new(MonotonicClock), Arc::new(PollWakeup { waker: waker.clone() })));
        let scheduler = Arc::new(Scheduler::new(&config.name, config.num_workers));

        Ok(ConnectionManager {
            shared: Arc::new(ManagerShared {
                registry,
                endpoints: Default::default(),
                runtime: RuntimeHandle::new(scheduler, timers),
                stopping: AtomicBool::new(false),
            }),
            config,
            waker,
            poll: Mutex::new(Some(poll)),
            poll_thread: Default::default(),
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
        })
    }

    /// Starts the worker threads and the poll thread
    pub fn start(&self) -> anyhow::Result<()> {
        let Some(poll) = self.poll.lock().unwrap().take() else {
            bail!("connection manager {} was already started", self.config.name);
        };

        self.shared.runtime.scheduler().start()?;

        let shared = self.shared.clone();
        let max_events = self.config.max_events;
        let handle = std::thread::Builder::new()
            .name(format!("{}-poll", self.config.name))
            .spawn(move || run_poll_loop(shared, poll, max_events))?;
        *self.poll_thread.lock().unwrap() = Some(handle);

        info!("connection manager {} started", self.config.name);
        Ok(())
    }

    pub fn runtime(&self) -> RuntimeHandle {
        self.shared.runtime.clone()
    }

    pub fn num_endpoints(&self) -> usize {
        self.shared.endpoints.read().unwrap().len()
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<Arc<dyn Endpoint>> {
        self.shared.endpoints.read().unwrap()
            .get(&id.0)
            .map(|slot| slot.endpoint.clone())
    }

    /// Attaches the endpoint to this manager's runtime and starts watching its socket
    pub fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) -> anyhow::Result<EndpointId> {
        if self.shared.stopping.load(Ordering::Acquire) {
            bail!("connection manager {} is stopping", self.config.name);
        }

        let mut endpoints = self.shared.endpoints.write().unwrap();
        if endpoints.len() >= self.config.max_endpoints {
            bail!("connection manager {} already has the maximum of {} endpoints", self.config.name, self.config.max_endpoints);
        }

        let runtime = &self.shared.runtime;
        let worker = runtime.assign_worker();
        if let Err(e) = endpoint.clone().attach(runtime.clone(), worker) {
            runtime.release_worker(worker);
            return Err(e);
        }

        let token = self.next_token.fetch_add(1, Ordering::AcqRel);
        let fd = endpoint.socket().raw_fd();
        if let Err(e) = self.shared.registry.register(&mut SourceFd(&fd), Token(token), Interest::READABLE) {
            endpoint.detach();
            runtime.release_worker(worker);
            return Err(e.into());
        }

        endpoints.insert(token, EndpointSlot {
            endpoint: endpoint.clone(),
            worker,
            fd,
        });
        drop(endpoints);
        info!("added endpoint {:?} on worker {:?}", endpoint.socket().local_addr(), worker);

        // datagrams received before registration do not produce a readiness event
        runtime.schedule(Some(worker), move || endpoint.on_read_event());
        Ok(EndpointId(token))
    }

    /// Stops watching the endpoint and detaches it, resetting its live sessions. Returns false
    ///  for an unknown id.
    pub fn remove_endpoint(&self, id: EndpointId) -> bool {
        let Some(slot) = self.shared.endpoints.write().unwrap().remove(&id.0) else {
            return false;
        };
        self.release_slot(slot);
        true
    }

    fn release_slot(&self, slot: EndpointSlot) {
        if let Err(e) = self.shared.registry.deregister(&mut SourceFd(&slot.fd)) {
            debug!("error deregistering endpoint {:?}: {}", slot.endpoint.socket().local_addr(), e);
        }
        slot.endpoint.detach();
        self.shared.runtime.release_worker(slot.worker);
        info!("removed endpoint {:?}", slot.endpoint.socket().local_addr());
    }

    /// Detaches all endpoints and stops the poll thread and the workers. Called on drop.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping connection manager {}", self.config.name);

        if let Err(e) = self.waker.wake() {
            error!("error waking the poll thread: {}", e);
        }
        if let Some(handle) = self.poll_thread.lock().unwrap().take() {
            if handle.join().is_err() {
                error!("poll thread of connection manager {} panicked", self.config.name);
            }
        }

        let slots = self.shared.endpoints.write().unwrap()
            .drain()
            .map(|(_, slot)| slot)
            .collect::<Vec<_>>();
        for slot in slots {
            self.release_slot(slot);
        }

        self.shared.runtime.scheduler().stop();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_poll_loop(shared: Arc<ManagerShared>, mut poll: Poll, max_events: usize) {
    let mut events = Events::with_capacity(max_events);

    while !shared.stopping.load(Ordering::Acquire) {
        let timeout = shared.runtime.timers().next_timeout()
            .map(Duration::from_millis);

        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() != ErrorKind::Interrupted {
                error!("error polling sockets: {}", e);
            }
            continue;
        }

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => trace!("poll thread woken"),
                Token(token) => shared.on_readable(token),
            }
        }

        shared.dispatch_expired_timers();
    }
    debug!("poll thread exiting");
}
