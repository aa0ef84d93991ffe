//! The event pool: a binary min-heap keyed by `(time, seq)`.
//!
//! The pool owns the current simulated time `tc`, which advances to the time
//! of each popped event. Events scheduled in the past or after the end time
//! are rejected. Canceled events stay in the heap and are skipped by the
//! simulator loop when popped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::event::Event;
use crate::time::Time;

/// Priority-ordered pool of pending events.
#[derive(Debug)]
pub struct EventPool<T> {
    ts: Time,
    te: Option<Time>,
    tc: Time,
    heap: BinaryHeap<Reverse<Event<T>>>,
    next_seq: u64,
}

impl<T> EventPool<T> {
    /// Create a pool covering `[ts, te]`. `None` end time means no upper bound
    /// (continuous mode).
    pub fn new(ts: Time, te: Option<Time>) -> Self {
        Self {
            ts,
            te,
            tc: ts,
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Pool start time.
    pub fn ts(&self) -> Time {
        self.ts
    }

    /// Pool end time, if bounded.
    pub fn te(&self) -> Option<Time> {
        self.te
    }

    /// Current time: the time of the last popped event.
    pub fn tc(&self) -> Time {
        self.tc
    }

    /// Insert an event. Returns whether the event was accepted.
    ///
    /// Events in the past (before the current time) or beyond the end time
    /// are silently rejected.
    pub fn add(&mut self, mut event: Event<T>) -> bool {
        if event.time() < self.tc {
            return false;
        }
        if let Some(te) = self.te {
            if event.time() > te {
                return false;
            }
        }
        event.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(event));
        true
    }

    /// Pop the head-of-line event and advance the current time to it.
    ///
    /// When the pool drains in bounded mode, the current time jumps to the
    /// end time.
    pub fn pop_head(&mut self) -> Option<Event<T>> {
        match self.heap.pop() {
            Some(Reverse(event)) => {
                self.tc = event.time();
                Some(event)
            }
            None => {
                if let Some(te) = self.te {
                    self.tc = te;
                }
                None
            }
        }
    }

    /// Number of pending events, including canceled ones.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(end: i64) -> EventPool<&'static str> {
        EventPool::new(Time::new(0, 1000), Some(Time::new(end, 1000)))
    }

    #[test]
    fn pops_in_time_order() {
        let mut p = pool(100);
        assert!(p.add(Event::new(Time::new(30, 1000), "b")));
        assert!(p.add(Event::new(Time::new(10, 1000), "a")));
        assert!(p.add(Event::new(Time::new(70, 1000), "c")));

        let order: Vec<_> = std::iter::from_fn(|| p.pop_head())
            .map(Event::into_payload)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(p.tc(), Time::new(100, 1000));
    }

    #[test]
    fn equal_times_pop_in_insertion_order() {
        let mut p = pool(100);
        for name in ["first", "second", "third"] {
            p.add(Event::new(Time::new(50, 1000), name));
        }
        let order: Vec<_> = std::iter::from_fn(|| p.pop_head())
            .map(Event::into_payload)
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn rejects_out_of_range() {
        let mut p = pool(100);
        assert!(p.add(Event::new(Time::new(100, 1000), "at-end")));
        assert!(!p.add(Event::new(Time::new(101, 1000), "late")));

        p.add(Event::new(Time::new(50, 1000), "mid"));
        p.pop_head();
        // tc is now 50, earlier events are in the past
        assert!(!p.add(Event::new(Time::new(49, 1000), "past")));
        assert!(p.add(Event::new(Time::new(50, 1000), "now")));
    }

    #[test]
    fn unbounded_pool_accepts_any_future_time() {
        let mut p: EventPool<&str> = EventPool::new(Time::new(0, 1000), None);
        assert!(p.add(Event::new(Time::new(i64::MAX / 2, 1000), "far")));
        assert!(p.pop_head().is_some());
        assert!(p.pop_head().is_none());
    }
}
