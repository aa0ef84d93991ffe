//! The discrete-event simulator core.
//!
//! The simulator owns the event pool and drives the dispatch loop. All
//! application logic runs on the simulator thread, inside
//! [`EventHandler::handle`]; handlers suspend by scheduling future events and
//! returning. The only cross-thread interaction is the stop flag, which a
//! wall-clock timer may flip from another OS thread.
//!
//! Two modes:
//! - **finite**: the loop exits when the pool drains or [`Simulator::stop`]
//!   is called;
//! - **continuous** (`end_second = f64::INFINITY`): an empty pool makes the
//!   loop idle briefly and retry, until something calls `stop()`.
//!
//! Ordering guarantee: events dispatch in nondecreasing time, and events with
//! equal time dispatch in insertion order. Monitors registered for an event's
//! tag run synchronously on the same thread, after the primary invocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::event::{CancelToken, Event, EventTag};
use crate::pool::EventPool;
use crate::time::{default_accuracy, Time};

/// Receives every dispatched event.
pub trait EventHandler<T: EventTag> {
    fn handle(&mut self, sim: &mut Simulator<T>, event: Event<T>);
}

/// Observes dispatched events of a registered tag, after the primary handler.
pub trait Monitor<T: EventTag> {
    fn handle(&mut self, tc: Time, payload: &T);
}

/// Cross-thread handle that stops a running simulator cooperatively.
///
/// The in-flight event invocation completes first; the loop exits on its next
/// iteration.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The discrete-event simulator.
pub struct Simulator<T: EventTag> {
    accuracy: u64,
    ts: Time,
    te: Option<Time>,
    pool: EventPool<T>,
    running: Arc<AtomicBool>,
    total_events: u64,
    time_spend: Duration,
    monitors: HashMap<T::Tag, Vec<Box<dyn Monitor<T>>>>,
}

impl<T: EventTag> Simulator<T> {
    /// Create a simulator covering `[start_second, end_second]` with the
    /// process default accuracy. Pass `f64::INFINITY` as the end for
    /// continuous mode.
    #[must_use]
    pub fn new(start_second: f64, end_second: f64) -> Self {
        Self::with_accuracy(start_second, end_second, default_accuracy())
    }

    /// Create a simulator with an explicit accuracy (slots per second).
    #[must_use]
    pub fn with_accuracy(start_second: f64, end_second: f64, accuracy: u64) -> Self {
        assert!(start_second >= 0.0);
        assert!(end_second >= start_second);
        let ts = Time::from_sec_accuracy(start_second, accuracy);
        let te = end_second
            .is_finite()
            .then(|| Time::from_sec_accuracy(end_second, accuracy));
        Self {
            accuracy,
            ts,
            te,
            pool: EventPool::new(ts, te),
            running: Arc::new(AtomicBool::new(false)),
            total_events: 0,
            time_spend: Duration::ZERO,
            monitors: HashMap::new(),
        }
    }

    /// Simulator accuracy in slots per second.
    pub fn accuracy(&self) -> u64 {
        self.accuracy
    }

    /// Produce a `Time` at the given second count with this simulator's accuracy.
    pub fn time(&self, sec: f64) -> Time {
        Time::from_sec_accuracy(sec, self.accuracy)
    }

    /// Simulation start time.
    pub fn ts(&self) -> Time {
        self.ts
    }

    /// Simulation end time; `None` in continuous mode.
    pub fn te(&self) -> Option<Time> {
        self.te
    }

    /// Current simulated time.
    pub fn tc(&self) -> Time {
        self.pool.tc()
    }

    /// Number of accepted events so far.
    pub fn total_events(&self) -> u64 {
        self.total_events
    }

    /// Wall-clock duration of the last `run()`.
    pub fn time_spend(&self) -> Duration {
        self.time_spend
    }

    /// Whether the dispatch loop is active.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Insert an event into the pool. Out-of-range events are silently dropped.
    pub fn add_event(&mut self, event: Event<T>) {
        if self.pool.add(event) {
            self.total_events += 1;
        }
    }

    /// Schedule a payload at time `t`, returning a cancellation token.
    pub fn schedule(&mut self, t: Time, payload: T) -> CancelToken {
        let event = Event::new(t, payload);
        let token = event.token();
        self.add_event(event);
        token
    }

    /// Register a monitor for events whose payload carries `tag`.
    pub fn watch(&mut self, tag: T::Tag, monitor: Box<dyn Monitor<T>>) {
        self.monitors.entry(tag).or_default().push(monitor);
    }

    /// Request the loop to exit after the current invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Handle usable from other threads (wall-clock timers) to stop the loop.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.running))
    }

    /// Run the dispatch loop to completion.
    pub fn run<H: EventHandler<T>>(&mut self, handler: &mut H)
    where
        T: Clone,
    {
        let continuous = self.te.is_none();
        info!(
            "{} simulation started",
            if continuous { "continuous" } else { "finite" }
        );

        self.running.store(true, Ordering::SeqCst);
        let wall_start = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            match self.pool.pop_head() {
                Some(event) => {
                    if event.is_canceled() {
                        continue;
                    }
                    let tag = event.payload().tag();
                    let snapshot = self
                        .monitors
                        .contains_key(&tag)
                        .then(|| (event.time(), event.payload().clone()));
                    handler.handle(self, event);
                    if let Some((t, payload)) = snapshot {
                        if let Some(monitors) = self.monitors.get_mut(&tag) {
                            for monitor in monitors.iter_mut() {
                                monitor.handle(t, &payload);
                            }
                        }
                    }
                }
                None if continuous => std::thread::sleep(Duration::from_millis(1)),
                None => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.time_spend = wall_start.elapsed();
        let sim_time = (self.tc() - self.ts).sec();
        info!(
            "simulation finished: runtime {:?}, {} events, sim_time {sim_time}",
            self.time_spend, self.total_events
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Tick(&'static str),
        Stop,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestTag {
        Tick,
        Stop,
    }

    impl EventTag for TestEvent {
        type Tag = TestTag;

        fn tag(&self) -> TestTag {
            match self {
                TestEvent::Tick(_) => TestTag::Tick,
                TestEvent::Stop => TestTag::Stop,
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        invoked: Vec<(i64, &'static str)>,
    }

    impl EventHandler<TestEvent> for Recorder {
        fn handle(&mut self, sim: &mut Simulator<TestEvent>, event: Event<TestEvent>) {
            let t = event.time().ticks();
            match event.into_payload() {
                TestEvent::Tick(name) => self.invoked.push((t, name)),
                TestEvent::Stop => {
                    assert!(sim.running());
                    sim.stop();
                }
            }
        }
    }

    #[test]
    fn finite_run_dispatches_in_range_events() {
        let mut sim = Simulator::with_accuracy(0.0, 15.0, 1000);
        let mut handler = Recorder::default();

        let canceled = sim.schedule(sim.time(1.0), TestEvent::Tick("canceled"));
        canceled.cancel();

        let mut t = 0.0;
        while t <= 12.0 {
            sim.add_event(Event::new(sim.time(t), TestEvent::Tick("a")));
            t += 0.5;
        }
        let mut t = 5.0;
        while t <= 20.0 {
            sim.add_event(Event::new(sim.time(t), TestEvent::Tick("b")));
            t += 1.0;
        }
        // 1 canceled + 25 "a" + 11 "b" accepted (b events beyond te rejected)
        assert_eq!(sim.total_events(), 1 + 25 + 11);

        sim.run(&mut handler);

        assert_eq!(sim.tc(), sim.te().unwrap());
        assert!(!sim.running());
        let a = handler.invoked.iter().filter(|(_, n)| *n == "a").count();
        let b = handler.invoked.iter().filter(|(_, n)| *n == "b").count();
        assert_eq!((a, b), (25, 11));
        assert!(!handler.invoked.iter().any(|(_, n)| *n == "canceled"));

        let times: Vec<i64> = handler.invoked.iter().map(|(t, _)| *t).collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted, "events must dispatch in time order");
    }

    #[test]
    fn stop_event_halts_finite_run() {
        let mut sim = Simulator::with_accuracy(0.0, 15.0, 1000);
        let mut handler = Recorder::default();
        sim.add_event(Event::new(sim.time(9.5), TestEvent::Stop));
        for t in 1..=14 {
            sim.add_event(Event::new(sim.time(t as f64), TestEvent::Tick("t")));
        }
        sim.run(&mut handler);
        assert_eq!(handler.invoked.len(), 9);
        assert!(sim.tc() < sim.te().unwrap());
    }

    #[test]
    fn stop_event_halts_continuous_run() {
        let mut sim = Simulator::with_accuracy(0.0, f64::INFINITY, 1000);
        let mut handler = Recorder::default();
        sim.add_event(Event::new(sim.time(9.5), TestEvent::Stop));
        for t in 1..=60 {
            sim.add_event(Event::new(sim.time(t as f64), TestEvent::Tick("t")));
        }
        sim.run(&mut handler);
        assert_eq!(handler.invoked.len(), 9);
    }

    struct Counting(Rc<RefCell<u64>>);

    impl Monitor<TestEvent> for Counting {
        fn handle(&mut self, _tc: Time, payload: &TestEvent) {
            assert!(matches!(payload, TestEvent::Tick(_)));
            *self.0.borrow_mut() += 1;
        }
    }

    #[test]
    fn monitors_see_registered_tags_only() {
        let mut sim = Simulator::with_accuracy(0.0, 10.0, 1000);
        let count = Rc::new(RefCell::new(0));
        sim.watch(TestTag::Tick, Box::new(Counting(Rc::clone(&count))));

        let mut handler = Recorder::default();
        for t in 1..=5 {
            sim.add_event(Event::new(sim.time(t as f64), TestEvent::Tick("t")));
        }
        sim.add_event(Event::new(sim.time(6.0), TestEvent::Stop));
        sim.run(&mut handler);

        assert_eq!(*count.borrow(), 5);
    }
}
