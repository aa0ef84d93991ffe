//! Wall-clock timeout for simulation runs.
//!
//! Continuous-mode simulations never drain their pool, so something external
//! must call `stop()`. [`WallClockTimeout`] starts a timer thread that stops
//! the simulator after a real-time deadline; dropping the guard cancels the
//! timer. Stopping is cooperative: the in-flight event invocation completes
//! before the loop exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::simulator::StopHandle;

/// Guard that stops a simulator after a wall-clock deadline.
pub struct WallClockTimeout {
    occurred: Arc<AtomicBool>,
    canceled: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl WallClockTimeout {
    /// Arm a timer that calls `stop` after `limit` of real time.
    #[must_use]
    pub fn start(limit: Duration, stop: StopHandle) -> Self {
        let occurred = Arc::new(AtomicBool::new(false));
        let canceled = Arc::new((Mutex::new(false), Condvar::new()));

        let thread_occurred = Arc::clone(&occurred);
        let thread_canceled = Arc::clone(&canceled);
        let thread = std::thread::spawn(move || {
            let (lock, cvar) = &*thread_canceled;
            let mut flagged = lock.lock();
            while !*flagged {
                if cvar.wait_for(&mut flagged, limit).timed_out() {
                    break;
                }
            }
            if !*flagged {
                stop.stop();
                thread_occurred.store(true, Ordering::SeqCst);
            }
        });

        Self {
            occurred,
            canceled,
            thread: Some(thread),
        }
    }

    /// Whether the deadline fired before the guard was dropped.
    #[must_use]
    pub fn occurred(&self) -> bool {
        self.occurred.load(Ordering::SeqCst)
    }
}

impl Drop for WallClockTimeout {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.canceled;
        *lock.lock() = true;
        cvar.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
