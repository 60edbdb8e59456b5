use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use crate::runtime::clock::Clock;
use crate::runtime::scheduler::{Scheduler, WorkerId};
use crate::runtime::timer::{TimerId, TimerManager};

/// Explicit access to the runtime an endpoint is attached to. Cloning is cheap, all clones
///  refer to the same scheduler and timers.
#[derive(Clone)]
pub struct RuntimeHandle {
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
}

impl RuntimeHandle {
    pub fn new(scheduler: Arc<Scheduler>, timers: Arc<TimerManager>) -> RuntimeHandle {
        RuntimeHandle { scheduler, timers }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.timers.clock().clone()
    }

    pub fn now_millis(&self) -> u64 {
        self.timers.now_millis()
    }

    pub fn add_timer(&self, delay_ms: u64, recurring: bool, affinity: Option<WorkerId>, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.timers.add_timer(delay_ms, recurring, affinity, Arc::new(callback))
    }

    pub fn del_timer(&self, id: TimerId) -> bool {
        self.timers.del_timer(id)
    }

    pub fn schedule(&self, affinity: Option<WorkerId>, callback: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule(affinity, callback);
    }

    /// Runs a future as a fiber. The returned receiver completes with the future's result, it
    ///  can be awaited from another fiber or waited for with `blocking_recv` from a plain thread.
    pub fn spawn<T: Send + 'static>(&self, affinity: Option<WorkerId>, future: impl Future<Output = T> + Send + 'static) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.scheduler.spawn(affinity, async move {
            let _ = tx.send(future.await);
        });
        rx
    }

    /// A future completing `delay_ms` after it is first polled. The fiber awaiting it is on
    ///  hold in the meantime.
    pub fn sleep(&self, delay_ms: u64) -> Sleep {
        Sleep {
            timers: self.timers.clone(),
            delay_ms,
            registered: None,
        }
    }

    pub fn assign_worker(&self) -> WorkerId {
        self.scheduler.assign_worker()
    }

    pub fn release_worker(&self, worker: WorkerId) {
        self.scheduler.release_worker(worker);
    }
}

pub struct Sleep {
    timers: Arc<TimerManager>,
    delay_ms: u64,
    registered: Option<(TimerId, Arc<AtomicBool>)>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if let Some((_, fired)) = &this.registered {
            return if fired.load(Ordering::Acquire) {
                Poll::Ready(())
            }
            else {
                Poll::Pending
            };
        }

        let fired = Arc::new(AtomicBool::new(false));
        let waker = cx.waker().clone();
        let callback_fired = fired.clone();
        let id = this.timers.add_timer(this.delay_ms, false, None, Arc::new(move || {
            callback_fired.store(true, Ordering::Release);
            waker.wake_by_ref();
        }));
        this.registered = Some((id, fired));
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((id, fired)) = &self.registered {
            if !fired.load(Ordering::Acquire) {
                self.timers.del_timer(*id);
            }
        }
    }
}
