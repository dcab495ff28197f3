//! Timer queue for SA expirations
//!
//! A deadline-ordered queue of events. Nothing here runs on its own: the
//! owner polls [`TimerQueue::pop_due`] with the current time, either from a
//! test or from the [`driver`](crate::driver) task.
//!
//! Time comes from a [`Clock`] so tests can move it forward by hand.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Identifier of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Source of monotonic time
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset_ns: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Create clock frozen at the current instant
    pub fn new() -> Self {
        ManualClock {
            base: Instant::now(),
            offset_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        let ns = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(ns, Ordering::SeqCst);
    }

    /// Time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}

/// Deadline-ordered event queue with a capacity limit
#[derive(Debug)]
pub struct TimerQueue<E> {
    pending: BTreeMap<(Instant, u64), E>,
    deadlines: HashMap<u64, Instant>,
    next_id: u64,
    capacity: usize,
}

impl<E> TimerQueue<E> {
    /// Create queue holding at most `capacity` pending timers
    pub fn new(capacity: usize) -> Self {
        TimerQueue {
            pending: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 0,
            capacity,
        }
    }

    /// Schedule `event` at `at`
    ///
    /// Fails with [`Error::ResourceExhausted`] when the queue is full.
    pub fn schedule(&mut self, at: Instant, event: E) -> Result<TimerId> {
        if self.pending.len() >= self.capacity {
            return Err(Error::ResourceExhausted(format!(
                "{} timers pending",
                self.pending.len()
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert((at, id), event);
        self.deadlines.insert(id, at);
        Ok(TimerId(id))
    }

    /// Cancel a pending timer, returning its event
    pub fn cancel(&mut self, id: TimerId) -> Option<E> {
        let at = self.deadlines.remove(&id.0)?;
        self.pending.remove(&(at, id.0))
    }

    /// Remove and return the earliest timer due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, E)> {
        let (&(at, id), _) = self.pending.iter().next()?;
        if at > now {
            return None;
        }
        self.deadlines.remove(&id);
        self.pending.remove(&(at, id)).map(|e| (TimerId(id), e))
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.keys().next().map(|(at, _)| *at)
    }

    /// Deadline of a pending timer
    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.deadlines.get(&id.0).copied()
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Maximum number of pending timers
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_in_deadline_order() {
        let clock = ManualClock::new();
        let mut q = TimerQueue::new(8);
        let t0 = clock.now();
        q.schedule(t0 + Duration::from_secs(10), "late").unwrap();
        q.schedule(t0 + Duration::from_secs(5), "early").unwrap();

        assert!(q.pop_due(t0).is_none());
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(5)));

        clock.advance(Duration::from_secs(10));
        assert_eq!(q.pop_due(clock.now()).map(|(_, e)| e), Some("early"));
        assert_eq!(q.pop_due(clock.now()).map(|(_, e)| e), Some("late"));
        assert!(q.is_empty());
    }

    #[test]
    fn test_same_deadline_fifo() {
        let mut q = TimerQueue::new(8);
        let at = Instant::now();
        q.schedule(at, 1).unwrap();
        q.schedule(at, 2).unwrap();
        assert_eq!(q.pop_due(at).map(|(_, e)| e), Some(1));
        assert_eq!(q.pop_due(at).map(|(_, e)| e), Some(2));
    }

    #[test]
    fn test_cancel() {
        let mut q = TimerQueue::new(8);
        let at = Instant::now();
        let id = q.schedule(at, "x").unwrap();
        assert_eq!(q.deadline(id), Some(at));
        assert_eq!(q.cancel(id), Some("x"));
        assert_eq!(q.cancel(id), None);
        assert!(q.pop_due(at).is_none());
    }

    #[test]
    fn test_capacity() {
        let mut q = TimerQueue::new(1);
        let at = Instant::now();
        q.schedule(at, ()).unwrap();
        assert!(matches!(
            q.schedule(at, ()),
            Err(Error::ResourceExhausted(_))
        ));
        assert_eq!(q.capacity(), 1);
    }

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = clock.now();
        other.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - start, Duration::from_millis(1500));
    }
}
