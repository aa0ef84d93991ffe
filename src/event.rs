//! Events: a scheduled time, an insertion sequence number, a cancellation
//! token, and an application payload.
//!
//! Events are totally ordered by `(time, seq)`. The sequence number is
//! assigned by the event pool at insertion, which makes dispatch of
//! same-time events deterministic: insertion order wins.

use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use crate::time::Time;

/// Classifies event payloads for monitor registration.
///
/// The tag is a cheap, field-less discriminant of the payload type, used as
/// the key of the simulator's monitors map.
pub trait EventTag {
    /// Discriminant type.
    type Tag: Copy + Eq + Hash + fmt::Debug;

    /// Discriminant of this payload value.
    fn tag(&self) -> Self::Tag;
}

/// Shared cancellation flag for a scheduled event.
///
/// Cancellation is lazy: the event stays in the pool and is skipped when it
/// reaches the head.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.0.get()
    }
}

/// A scheduled event carrying a payload of type `T`.
#[derive(Debug)]
pub struct Event<T> {
    t: Time,
    pub(crate) seq: u64,
    token: CancelToken,
    payload: T,
}

impl<T> Event<T> {
    /// Create an event scheduled at `t`. The sequence number is assigned on
    /// insertion into a pool.
    pub fn new(t: Time, payload: T) -> Self {
        Self {
            t,
            seq: 0,
            token: CancelToken::new(),
            payload,
        }
    }

    /// Scheduled time.
    pub fn time(&self) -> Time {
        self.t
    }

    /// Insertion sequence number, zero until the event enters a pool.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Borrow the payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume the event, yielding the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// A handle that can cancel this event later.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Mark this event as canceled.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this event has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }
}

impl<T> PartialEq for Event<T> {
    fn eq(&self, other: &Self) -> bool {
        self.t == other.t && self.seq == other.seq
    }
}

impl<T> Eq for Event<T> {}

impl<T> PartialOrd for Event<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Event<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.t.cmp(&other.t).then_with(|| self.seq.cmp(&other.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared() {
        let ev = Event::new(Time::new(5, 1000), ());
        let token = ev.token();
        assert!(!ev.is_canceled());
        token.cancel();
        assert!(ev.is_canceled());
    }

    #[test]
    fn ordering_by_time_then_seq() {
        let mut a = Event::new(Time::new(1, 1000), ());
        let mut b = Event::new(Time::new(1, 1000), ());
        let c = Event::new(Time::new(2, 1000), ());
        a.seq = 1;
        b.seq = 2;
        assert!(a < b);
        assert!(b < c);
    }
}
