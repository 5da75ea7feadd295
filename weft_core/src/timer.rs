//! Ordered set of deadlines, grounded in
//! `original_source/ljrServer/timer.cpp`/`timer.h`.
//!
//! A [`TimerSet`] is a single-owner structure (the reactor owns exactly
//! one); concurrent access goes through the reactor's own lock, so this
//! module does not take locks itself.

use crate::time::now_ms;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

type Callback = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    next_deadline: u64,
    period_ms: u64,
    recurring: bool,
    seq: u64,
    cb: parking_lot::Mutex<Option<Callback>>,
    /// When set, the callback only fires if this still upgrades.
    condition: Option<Weak<dyn Send + Sync>>,
}

impl TimerEntry {
    fn is_cancelled(&self) -> bool {
        self.cb.lock().is_none()
    }
}

#[derive(Clone)]
struct OrderKey {
    deadline: u64,
    seq: u64,
    entry: Arc<TimerEntry>,
}

impl PartialEq for OrderKey {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for OrderKey {}
impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// A handle to a scheduled timer. Dropping the handle does *not* cancel
/// the timer; call [`TimerHandle::cancel`] explicitly.
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<TimerEntry>,
    anchor_ms: u64,
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("deadline_ms", &self.entry.next_deadline)
            .field("cancelled", &self.entry.is_cancelled())
            .finish()
    }
}

impl TimerHandle {
    /// Removes the timer and nulls its callback. A future
    /// [`TimerSet::collect_expired`] will neither see nor invoke it.
    pub fn cancel(&self) {
        self.entry.cb.lock().take();
    }

    /// Recomputes the deadline. If `from_now`, anchors on the current
    /// time; otherwise reuses the original insertion anchor (so a timer
    /// reset repeatedly with `from_now = false` drifts back to its first
    /// schedule rather than accumulating delay).
    ///
    /// Returns `false` if the timer was already cancelled.
    pub fn reset(&self, set: &mut TimerSet, ms: u64, from_now: bool) -> bool {
        if self.entry.is_cancelled() {
            return false;
        }
        set.order.retain(|k| !Arc::ptr_eq(&k.entry, &self.entry));
        let base = if from_now { now_ms() } else { self.anchor_ms };
        let new_deadline = base + ms;
        let entry_mut = Arc::as_ptr(&self.entry) as *mut TimerEntry;
        // Safety: `self.entry` was just removed from `set.order` above,
        // and `TimerHandle::reset` takes `&mut TimerSet`, so no other
        // reader can observe `next_deadline` while we mutate it here.
        unsafe {
            (*entry_mut).next_deadline = new_deadline;
        }
        let front_before = set.order.iter().next().map(|k| k.deadline);
        set.order.insert(OrderKey {
            deadline: new_deadline,
            seq: self.entry.seq,
            entry: self.entry.clone(),
        });
        let front_after = set.order.iter().next().map(|k| k.deadline);
        if front_after != front_before {
            set.on_first_changed();
        }
        true
    }
}

impl std::fmt::Debug for TimerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSet")
            .field("len", &self.order.len())
            .finish()
    }
}

/// Ordered set of pending timers, owned by the reactor.
pub struct TimerSet {
    order: BTreeSet<OrderKey>,
    next_seq: u64,
    previous_observed_ms: u64,
    on_first_changed: Box<dyn Fn() + Send>,
}

/// One hour, in milliseconds: the clock-rollback threshold past which
/// `collect_expired` treats every pending timer as expired rather than
/// risk wedging forever on a clock that jumped backwards.
const ROLLOVER_GUARD_MS: u64 = 60 * 60 * 1000;

impl TimerSet {
    /// `on_first_changed` is invoked whenever an insertion or reset lands
    /// at the front of the set; the reactor wires this to its tickle.
    pub fn new(on_first_changed: impl Fn() + Send + 'static) -> Self {
        Self {
            order: BTreeSet::new(),
            next_seq: 0,
            previous_observed_ms: now_ms(),
            on_first_changed: Box::new(on_first_changed),
        }
    }

    fn on_first_changed(&self) {
        (self.on_first_changed)();
    }

    fn insert_entry(&mut self, entry: Arc<TimerEntry>, anchor_ms: u64) -> TimerHandle {
        let front_before = self.order.iter().next().map(|k| k.deadline);
        self.order.insert(OrderKey {
            deadline: entry.next_deadline,
            seq: entry.seq,
            entry: entry.clone(),
        });
        let front_after = self.order.iter().next().map(|k| k.deadline);
        if front_after != front_before {
            self.on_first_changed();
        }
        TimerHandle { entry, anchor_ms }
    }

    /// Schedules `cb` to run `ms` milliseconds from now.
    pub fn add_timer(
        &mut self,
        ms: u64,
        cb: impl FnOnce() + Send + 'static,
        recurring: bool,
    ) -> TimerHandle {
        let now = now_ms();
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = Arc::new(TimerEntry {
            next_deadline: now + ms,
            period_ms: ms,
            recurring,
            seq,
            cb: parking_lot::Mutex::new(Some(Box::new(cb))),
            condition: None,
        });
        self.insert_entry(entry, now)
    }

    /// Like [`Self::add_timer`], but `cb` only fires if `condition` still
    /// upgrades at fire time. Used by the syscall shim so a torn-down
    /// call state silently disarms its timeout timer.
    pub fn add_conditional<T: Send + Sync + 'static>(
        &mut self,
        ms: u64,
        cb: impl FnOnce() + Send + 'static,
        condition: Weak<T>,
        recurring: bool,
    ) -> TimerHandle {
        let now = now_ms();
        let seq = self.next_seq;
        self.next_seq += 1;
        let condition: Weak<dyn Send + Sync> = condition;
        let entry = Arc::new(TimerEntry {
            next_deadline: now + ms,
            period_ms: ms,
            recurring,
            seq,
            cb: parking_lot::Mutex::new(Some(Box::new(cb))),
            condition: Some(condition),
        });
        self.insert_entry(entry, now)
    }

    /// Milliseconds until the next deadline, or `None` if the set is
    /// empty (caller should block indefinitely, subject to its own hard
    /// cap — see the reactor's `HARD_MAX`).
    pub fn next_timeout(&self) -> Option<u64> {
        let now = now_ms();
        self.order
            .iter()
            .next()
            .map(|k| k.deadline.saturating_sub(now))
    }

    /// Removes and returns every callback whose deadline has passed,
    /// re-arming recurring timers. Cancelled entries (empty `cb`) and
    /// conditional entries whose condition no longer upgrades are
    /// dropped silently.
    pub fn collect_expired(&mut self) -> Vec<Callback> {
        let now = now_ms();
        let rolled_back = now + ROLLOVER_GUARD_MS < self.previous_observed_ms;
        self.previous_observed_ms = now;

        let mut expired = Vec::new();
        let mut to_reinsert = Vec::new();

        loop {
            let front = match self.order.iter().next() {
                Some(k) => k.clone(),
                None => break,
            };
            if !rolled_back && front.deadline > now {
                break;
            }
            self.order.remove(&front);

            if front.entry.is_cancelled() {
                continue;
            }
            if let Some(cond) = &front.entry.condition {
                if cond.upgrade().is_none() {
                    continue;
                }
            }
            if let Some(cb) = front.entry.cb.lock().take() {
                expired.push(cb);
            }
            if front.entry.recurring {
                let entry_mut = Arc::as_ptr(&front.entry) as *mut TimerEntry;
                // Safety: `front.entry` was just removed from `order`, so
                // no ordering key referencing it is live right now.
                unsafe {
                    (*entry_mut).next_deadline = now + (*entry_mut).period_ms;
                }
                to_reinsert.push(front.entry);
            }
        }

        for entry in to_reinsert {
            self.order.insert(OrderKey {
                deadline: entry.next_deadline,
                seq: entry.seq,
                entry,
            });
        }

        expired
    }

    /// Number of live (non-cancelled) timers, for diagnostics/tests.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the set holds no live timers.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc as StdArc;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn fires_once_and_is_removed() {
        let mut set = TimerSet::new(|| {});
        let fired = StdArc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        set.add_timer(0, move || {
            fired2.fetch_add(1, AtomicOrdering::SeqCst);
        }, false);
        sleep(Duration::from_millis(5));
        let cbs = set.collect_expired();
        assert_eq!(cbs.len(), 1);
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn cancel_before_fire_suppresses_callback() {
        let mut set = TimerSet::new(|| {});
        let fired = StdArc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let handle = set.add_timer(50, move || {
            fired2.fetch_add(1, AtomicOrdering::SeqCst);
        }, false);
        handle.cancel();
        sleep(Duration::from_millis(60));
        let cbs = set.collect_expired();
        assert!(cbs.is_empty());
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn recurring_timer_reinserts_with_period() {
        let mut set = TimerSet::new(|| {});
        set.add_timer(0, || {}, true);
        sleep(Duration::from_millis(5));
        let cbs = set.collect_expired();
        assert_eq!(cbs.len(), 1);
        assert_eq!(set.len(), 1, "recurring timer should be re-armed");
    }

    #[test]
    fn conditional_timer_noop_once_condition_drops() {
        let mut set = TimerSet::new(|| {});
        let guard = StdArc::new(());
        let weak = StdArc::downgrade(&guard);
        let fired = StdArc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        set.add_conditional(0, move || {
            fired2.fetch_add(1, AtomicOrdering::SeqCst);
        }, weak, false);
        drop(guard);
        sleep(Duration::from_millis(5));
        let cbs = set.collect_expired();
        assert!(cbs.is_empty());
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }
}
