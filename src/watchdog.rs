//! Per-session read watchdog.
//!
//! Primary timeouts are deadline arithmetic in the transport and the oracle.
//! The watchdog is a safety net on top: each blocking read is bracketed by
//! [`Watchdog::arm`] / [`Watchdog::disarm`], and if a read is still armed a
//! fixed grace period after its own deadline, the watchdog pushes a
//! [`ReaderEvent::Cancelled`] into the reader's channel so the read returns
//! with a timeout instead of hanging.
//!
//! Every arm gets a new generation number. A cancellation that lands after
//! its read already finished carries a stale generation and is dropped by the
//! reader.

use std::io;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::transport::{ReaderEvent, deadline_after};

#[derive(Debug, Clone, Copy)]
struct Armed {
    generation: u64,
    fire_at: Instant,
}

#[derive(Debug, Default)]
struct WatchState {
    armed: Option<Armed>,
    next_generation: u64,
    stopping: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<WatchState>,
    wake: Condvar,
}

/// Background timer that cancels stuck reads.
pub struct Watchdog {
    shared: Arc<Shared>,
    grace: Duration,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the watchdog thread. Cancellations are delivered on `cancel`.
    pub fn spawn(grace: Duration, cancel: Sender<ReaderEvent>) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("vmharness-watchdog".to_string())
            .spawn(move || watch(&thread_shared, &cancel))?;
        debug!(grace_ms = grace.as_millis() as u64, "watchdog started");
        Ok(Self {
            shared,
            grace,
            handle: Some(handle),
        })
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Arm for a read whose own deadline is `deadline`. Returns the
    /// generation a cancellation for this read will carry.
    pub fn arm(&self, deadline: Instant) -> u64 {
        let mut state = self.shared.state.lock().unwrap();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.armed = Some(Armed {
            generation,
            fire_at: deadline_after(deadline, self.grace),
        });
        self.shared.wake.notify_one();
        generation
    }

    /// Cancel the pending arm, if any.
    pub fn disarm(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.armed = None;
        self.shared.wake.notify_one();
    }

    /// Stop and join the watchdog thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stopping = true;
            state.armed = None;
            self.shared.wake.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("watchdog thread panicked");
            }
            debug!("watchdog stopped");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watch(shared: &Shared, cancel: &Sender<ReaderEvent>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.stopping {
            return;
        }
        let Some(armed) = state.armed else {
            state = shared.wake.wait(state).unwrap();
            continue;
        };

        let now = Instant::now();
        if now < armed.fire_at {
            state = shared.wake.wait_timeout(state, armed.fire_at - now).unwrap().0;
            continue;
        }

        state.armed = None;
        warn!(
            generation = armed.generation,
            "read still blocked past its deadline; cancelling"
        );
        if cancel.send(ReaderEvent::Cancelled(armed.generation)).is_err() {
            // Reader is gone; nothing left to guard.
            return;
        }
    }
}
