use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};
use anyhow::bail;
use tracing::{trace, warn};
use crate::runtime::scheduler::WorkerId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FiberState {
    /// runnable, waiting in a run queue
    Ready,
    /// suspended, resumed only after being woken
    Hold,
    Exec,
    Term,
    /// terminated by a panic
    Except,
}

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type FiberCallback = Box<dyn FnOnce() + Send + 'static>;

enum FiberBody {
    Future(BoxFuture),
    Callback(FiberCallback),
    Empty,
}

struct FiberStatus {
    state: FiberState,
    /// woken while executing, i.e. it must be run again right after yielding
    woken: bool,
}

/// A cooperative unit of execution. A fiber runs on a worker thread until it completes or
///  yields, it is never preempted.
///
/// A fiber either wraps a future, which may yield any number of times, or a plain callback,
///  which runs to completion.
pub struct Fiber {
    id: u64,
    affinity: Option<WorkerId>,
    status: Mutex<FiberStatus>,
    body: Mutex<FiberBody>,
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl Fiber {
    fn new(body: FiberBody, state: FiberState, affinity: Option<WorkerId>) -> Fiber {
        Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            affinity,
            status: Mutex::new(FiberStatus { state, woken: false }),
            body: Mutex::new(body),
        }
    }

    pub fn from_future(future: impl Future<Output = ()> + Send + 'static, affinity: Option<WorkerId>) -> Fiber {
        Fiber::new(FiberBody::Future(Box::pin(future)), FiberState::Ready, affinity)
    }

    pub fn from_callback(callback: impl FnOnce() + Send + 'static, affinity: Option<WorkerId>) -> Fiber {
        Fiber::new(FiberBody::Callback(Box::new(callback)), FiberState::Ready, affinity)
    }

    /// A terminated fiber without a body, to be [reset](Fiber::reset_callback) before use
    pub fn empty() -> Fiber {
        Fiber::new(FiberBody::Empty, FiberState::Term, None)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn affinity(&self) -> Option<WorkerId> {
        self.affinity
    }

    pub fn state(&self) -> FiberState {
        self.status.lock().unwrap().state
    }

    /// Reuses a finished fiber for a new callback
    pub fn reset_callback(&self, callback: FiberCallback) -> anyhow::Result<()> {
        let mut status = self.status.lock().unwrap();
        if !matches!(status.state, FiberState::Term | FiberState::Except) {
            bail!("fiber {} can not be reset in state {:?}", self.id, status.state);
        }

        *self.body.lock().unwrap() = FiberBody::Callback(callback);
        status.state = FiberState::Ready;
        status.woken = false;
        Ok(())
    }

    /// Runs the fiber until it completes or yields, returning its new state. Only fibers in
    ///  state `Ready` are run.
    pub fn resume(&self, waker: &Waker) -> FiberState {
        {
            let mut status = self.status.lock().unwrap();
            if status.state != FiberState::Ready {
                warn!("fiber {} can not be resumed in state {:?}", self.id, status.state);
                return status.state;
            }
            status.state = FiberState::Exec;
            status.woken = false;
        }

        let outcome = {
            let mut body = self.body.lock().unwrap();
            match std::mem::replace(&mut *body, FiberBody::Empty) {
                FiberBody::Future(mut future) => {
                    let mut cx = Context::from_waker(waker);
                    match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
                        Ok(Poll::Ready(())) => FiberState::Term,
                        Ok(Poll::Pending) => {
                            *body = FiberBody::Future(future);
                            FiberState::Hold
                        }
                        Err(_) => FiberState::Except,
                    }
                }
                FiberBody::Callback(callback) => {
                    match catch_unwind(AssertUnwindSafe(callback)) {
                        Ok(()) => FiberState::Term,
                        Err(_) => FiberState::Except,
                    }
                }
                FiberBody::Empty => FiberState::Term,
            }
        };

        let mut status = self.status.lock().unwrap();
        status.state = match outcome {
            FiberState::Hold if status.woken => FiberState::Ready,
            other => other,
        };
        status.woken = false;

        if status.state == FiberState::Except {
            warn!("fiber {} panicked", self.id);
        }
        trace!("fiber {} yielded in state {:?}", self.id, status.state);
        status.state
    }

    /// Called by the fiber's waker. Returns true if the fiber moved from `Hold` to `Ready` and
    ///  must be put back into a run queue by the caller.
    pub(crate) fn wake(&self) -> bool {
        let mut status = self.status.lock().unwrap();
        match status.state {
            FiberState::Hold => {
                status.state = FiberState::Ready;
                true
            }
            FiberState::Exec => {
                status.woken = true;
                false
            }
            _ => false,
        }
    }
}

/// Yields to the scheduler, staying runnable
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}
impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Suspends the fiber once. It continues only after something wakes it (or, for a fiber
///  driven directly by a worker, on its next resume).
pub fn yield_to_hold() -> YieldToHold {
    YieldToHold { yielded: false }
}

pub struct YieldToHold {
    yielded: bool,
}
impl Future for YieldToHold {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        Poll::Pending
    }
}
