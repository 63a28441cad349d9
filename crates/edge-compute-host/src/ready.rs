//! Cross-thread readiness notification for a session.
//!
//! Anything that can make a session handle ready (an origin replying, a
//! body write) bumps the generation and wakes waiters. Waiters record the
//! generation before checking their condition so no wakeup is lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub(crate) struct ReadySignal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl ReadySignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn notify(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Wait until the generation moves past `seen` or `deadline` passes.
    ///
    /// Returns `false` on timeout.
    pub(crate) fn wait_past(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut generation = self.generation.lock();
        while *generation == seen {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut generation, deadline).timed_out() {
                        return *generation != seen;
                    }
                }
                None => self.changed.wait(&mut generation),
            }
        }
        true
    }

    /// Like [`wait_past`](Self::wait_past) with a relative timeout.
    pub(crate) fn wait_past_for(&self, seen: u64, timeout: Duration) -> bool {
        self.wait_past(seen, Some(Instant::now() + timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_times_out_without_notify() {
        let signal = ReadySignal::new();
        let seen = signal.generation();
        assert!(!signal.wait_past_for(seen, Duration::from_millis(5)));
    }

    #[test]
    fn test_notify_from_other_thread_wakes_waiter() {
        let signal = ReadySignal::new();
        let seen = signal.generation();

        let notifier = Arc::clone(&signal);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            notifier.notify();
        });

        assert!(signal.wait_past(seen, None));
        thread.join().unwrap();
        assert_eq!(signal.generation(), seen + 1);
    }

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let signal = ReadySignal::new();
        let seen = signal.generation();
        signal.notify();
        assert!(signal.wait_past_for(seen, Duration::from_millis(1)));
    }
}
