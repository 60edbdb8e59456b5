use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::runtime::clock::Clock;
use crate::runtime::scheduler::WorkerId;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TimerId(u64);

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Notified synchronously when a new timer becomes the earliest one, so that an event loop
///  waiting for the previous earliest deadline can recompute its wait
#[cfg_attr(test, automock)]
pub trait TimerFrontListener: Send + Sync + 'static {
    fn on_timer_inserted_at_front(&self);
}

/// A timer that fired, detached from the manager so that it can run without holding any lock
pub struct ExpiredTimer {
    pub id: TimerId,
    pub callback: TimerCallback,
    pub affinity: Option<WorkerId>,
}
impl Debug for ExpiredTimer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiredTimer")
            .field("id", &self.id)
            .field("affinity", &self.affinity)
            .finish()
    }
}

struct TimerEntry {
    /// 0 for one-shot timers
    interval_ms: u64,
    callback: TimerCallback,
    affinity: Option<WorkerId>,
}

#[derive(Default)]
struct TimerQueue {
    by_deadline: BTreeMap<(u64, TimerId), TimerEntry>,
    deadlines: FxHashMap<TimerId, u64>,
    /// set after the front listener was notified, reset when the poll budget is recomputed
    tickled: bool,
}

/// Ordered set of one-shot and recurring timers, keyed by absolute deadline in milliseconds
///  of the manager's clock. Timer ids are unique for the lifetime of the manager.
pub struct TimerManager {
    queue: RwLock<TimerQueue>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    front_listener: Arc<dyn TimerFrontListener>,
}

impl TimerManager {
    pub fn new(clock: Arc<dyn Clock>, front_listener: Arc<dyn TimerFrontListener>) -> TimerManager {
        TimerManager {
            queue: Default::default(),
            next_id: AtomicU64::new(1),
            clock,
            front_listener,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Registers a timer firing `delay_ms` from now. A recurring timer fires every `delay_ms`
    ///  until it is deleted.
    pub fn add_timer(&self, delay_ms: u64, recurring: bool, affinity: Option<WorkerId>, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = self.clock.now_millis() + delay_ms;
        let entry = TimerEntry {
            interval_ms: if recurring { delay_ms.max(1) } else { 0 },
            callback,
            affinity,
        };

        let notify_front = {
            let mut queue = self.queue.write().unwrap();
            queue.by_deadline.insert((deadline, id), entry);
            queue.deadlines.insert(id, deadline);

            let is_front = queue.by_deadline.keys().next() == Some(&(deadline, id));
            if is_front && !queue.tickled {
                queue.tickled = true;
                true
            }
            else {
                false
            }
        };

        trace!("added timer {:?} with deadline {} (recurring: {})", id, deadline, recurring);
        if notify_front {
            self.front_listener.on_timer_inserted_at_front();
        }
        id
    }

    /// Cancels a timer. Returns false if there is no timer with this id, e.g. because it was
    ///  a one-shot timer that fired already.
    pub fn del_timer(&self, id: TimerId) -> bool {
        let mut queue = self.queue.write().unwrap();
        match queue.deadlines.remove(&id) {
            Some(deadline) => {
                queue.by_deadline.remove(&(deadline, id));
                trace!("deleted timer {:?}", id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.queue.read().unwrap().deadlines.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.queue.read().unwrap().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time until the earliest deadline, 0 if it passed already. None if there are no timers.
    pub fn next_timeout(&self) -> Option<u64> {
        let mut queue = self.queue.write().unwrap();
        queue.tickled = false;

        let &(deadline, _) = queue.by_deadline.keys().next()?;
        Some(deadline.saturating_sub(self.clock.now_millis()))
    }

    /// Removes all timers whose deadline passed, re-arming recurring ones relative to now
    pub fn list_expired(&self) -> Vec<ExpiredTimer> {
        let now = self.clock.now_millis();
        let mut result = Vec::new();

        let mut queue = self.queue.write().unwrap();
        while let Some((&(deadline, id), _)) = queue.by_deadline.first_key_value() {
            if deadline > now {
                break;
            }

            let Some((_, entry)) = queue.by_deadline.pop_first() else {
                break;
            };

            result.push(ExpiredTimer {
                id,
                callback: entry.callback.clone(),
                affinity: entry.affinity,
            });

            if entry.interval_ms > 0 {
                let next = now + entry.interval_ms;
                queue.deadlines.insert(id, next);
                queue.by_deadline.insert((next, id), entry);
            }
            else {
                queue.deadlines.remove(&id);
            }
        }

        if !result.is_empty() {
            trace!("{} timers expired", result.len());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use rstest::rstest;
    use super::*;
    use crate::runtime::clock::ManualClock;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn silent_listener() -> Arc<dyn TimerFrontListener> {
        let mut listener = MockTimerFrontListener::new();
        listener.expect_on_timer_inserted_at_front().return_const(());
        Arc::new(listener)
    }

    fn run_expired(timers: &TimerManager) -> usize {
        let expired = timers.list_expired();
        for timer in &expired {
            (timer.callback)();
        }
        expired.len()
    }

    #[rstest]
    #[case::single(vec![50], 50)]
    #[case::min_first(vec![10, 50, 30], 10)]
    #[case::min_last(vec![50, 30, 20], 20)]
    fn test_next_timeout_is_min_delay(#[case] delays: Vec<u64>, #[case] expected: u64) {
        let clock = Arc::new(ManualClock::new(1000));
        let timers = TimerManager::new(clock.clone(), silent_listener());
        for delay in delays {
            timers.add_timer(delay, false, None, Arc::new(|| {}));
        }

        assert_eq!(timers.next_timeout(), Some(expected));

        clock.advance(expected + 5);
        assert_eq!(timers.next_timeout(), Some(0));
    }

    #[test]
    fn test_next_timeout_without_timers() {
        let timers = TimerManager::new(Arc::new(ManualClock::new(0)), silent_listener());
        assert_eq!(timers.next_timeout(), None);
    }

    #[test]
    fn test_one_shot() {
        let clock = Arc::new(ManualClock::new(0));
        let timers = TimerManager::new(clock.clone(), silent_listener());
        let counter = Arc::new(AtomicUsize::new(0));

        let id = timers.add_timer(100, false, None, counting_callback(&counter));
        clock.advance(99);
        assert_eq!(run_expired(&timers), 0);

        clock.advance(1);
        assert_eq!(run_expired(&timers), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        clock.advance(1000);
        assert_eq!(run_expired(&timers), 0);
        assert!(!timers.contains(id));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_recurring() {
        let clock = Arc::new(ManualClock::new(0));
        let timers = TimerManager::new(clock.clone(), silent_listener());
        let counter = Arc::new(AtomicUsize::new(0));

        let id = timers.add_timer(40, true, None, counting_callback(&counter));
        for _ in 0..5 {
            clock.advance(40);
            assert_eq!(run_expired(&timers), 1);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(timers.next_timeout(), Some(40));

        assert!(timers.del_timer(id));
        clock.advance(40);
        assert_eq!(run_expired(&timers), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_del_timer() {
        let clock = Arc::new(ManualClock::new(0));
        let timers = TimerManager::new(clock.clone(), silent_listener());
        let counter = Arc::new(AtomicUsize::new(0));

        let a = timers.add_timer(10, false, None, counting_callback(&counter));
        let b = timers.add_timer(20, false, None, counting_callback(&counter));
        assert_eq!(timers.len(), 2);

        assert!(timers.del_timer(a));
        assert!(!timers.del_timer(a));
        assert_eq!(timers.next_timeout(), Some(20));

        clock.advance(20);
        let expired = timers.list_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, b);
    }

    #[test]
    fn test_del_unknown_timer() {
        let timers = TimerManager::new(Arc::new(ManualClock::new(0)), silent_listener());
        assert!(!timers.del_timer(TimerId(12345)));
    }

    #[test]
    fn test_expired_in_deadline_order_with_affinity() {
        let clock = Arc::new(ManualClock::new(0));
        let timers = TimerManager::new(clock.clone(), silent_listener());

        let late = timers.add_timer(30, false, Some(WorkerId::new(1)), Arc::new(|| {}));
        let early = timers.add_timer(10, false, None, Arc::new(|| {}));
        clock.advance(30);

        let expired = timers.list_expired();
        assert_eq!(expired.iter().map(|t| t.id).collect::<Vec<_>>(), vec![early, late]);
        assert_eq!(expired[0].affinity, None);
        assert_eq!(expired[1].affinity, Some(WorkerId::new(1)));
    }

    #[test]
    fn test_front_listener_tickled_once_until_next_timeout() {
        let mut listener = MockTimerFrontListener::new();
        listener.expect_on_timer_inserted_at_front()
            .times(2)
            .return_const(());

        let timers = TimerManager::new(Arc::new(ManualClock::new(0)), Arc::new(listener));

        // new front: notified
        timers.add_timer(100, false, None, Arc::new(|| {}));
        // new front, but no poll since the last notification
        timers.add_timer(50, false, None, Arc::new(|| {}));
        // not at the front
        timers.add_timer(500, false, None, Arc::new(|| {}));

        assert_eq!(timers.next_timeout(), Some(50));

        // new front after the wait was recomputed: notified again
        timers.add_timer(10, false, None, Arc::new(|| {}));
    }
}
