//! Future results
//!
//! A `FutureResult` is the rendezvous cell between a submitting thread and
//! a pool worker: pending until the worker stores a value or an error,
//! with a condvar broadcasting completion to every waiter.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum FutureState {
    Pending,
    Done(Value),
    Failed(Error),
}

pub struct FutureResult {
    state: Mutex<FutureState>,
    cond: Condvar,
}

impl FutureResult {
    pub fn new() -> Arc<FutureResult> {
        Arc::new(FutureResult {
            state: Mutex::new(FutureState::Pending),
            cond: Condvar::new(),
        })
    }

    /// Complete with a value and wake all waiters. First completion wins;
    /// later calls are ignored.
    pub fn set_result(&self, v: Value) {
        let mut state = self.state.lock().expect("future poisoned");
        if matches!(*state, FutureState::Pending) {
            *state = FutureState::Done(v);
            self.cond.notify_all();
        }
    }

    /// Complete with an error and wake all waiters.
    pub fn set_error(&self, e: Error) {
        let mut state = self.state.lock().expect("future poisoned");
        if matches!(*state, FutureState::Pending) {
            *state = FutureState::Failed(e);
            self.cond.notify_all();
        }
    }

    /// Non-blocking completion check.
    pub fn is_done(&self) -> bool {
        !matches!(
            *self.state.lock().expect("future poisoned"),
            FutureState::Pending
        )
    }

    /// Block until completed; propagate the worker's error if it failed.
    pub fn get(&self) -> Result<Value> {
        let mut state = self.state.lock().expect("future poisoned");
        loop {
            match &*state {
                FutureState::Done(v) => return Ok(*v),
                FutureState::Failed(e) => return Err(e.clone()),
                FutureState::Pending => {
                    state = self.cond.wait(state).expect("future poisoned");
                }
            }
        }
    }

    /// Block up to `timeout`; `None` when still pending at expiry.
    pub fn get_timeout(&self, timeout: Duration) -> Option<Result<Value>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock().expect("future poisoned");
        loop {
            match &*state {
                FutureState::Done(v) => return Some(Ok(*v)),
                FutureState::Failed(e) => return Some(Err(e.clone())),
                FutureState::Pending => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (next, timed_out) = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .expect("future poisoned");
                    state = next;
                    if timed_out.timed_out()
                        && matches!(*state, FutureState::Pending)
                    {
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let fut = FutureResult::new();
        assert!(!fut.is_done());
        fut.set_result(Value::int(42));
        assert!(fut.is_done());
        assert_eq!(fut.get().unwrap().as_int(), 42);
        // get again returns the same cached value
        assert_eq!(fut.get().unwrap().as_int(), 42);
    }

    #[test]
    fn test_first_completion_wins() {
        let fut = FutureResult::new();
        fut.set_result(Value::int(1));
        fut.set_result(Value::int(2));
        fut.set_error(Error::internal("late"));
        assert_eq!(fut.get().unwrap().as_int(), 1);
    }

    #[test]
    fn test_error_propagates() {
        let fut = FutureResult::new();
        fut.set_error(Error::arithmetic("Divide by zero"));
        assert_eq!(fut.get().unwrap_err().message, "Divide by zero");
    }

    #[test]
    fn test_timeout_on_pending() {
        let fut = FutureResult::new();
        assert!(fut.get_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_get_blocks_until_set() {
        let fut = FutureResult::new();
        let setter = fut.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set_result(Value::int(7));
        });
        assert_eq!(fut.get().unwrap().as_int(), 7);
        handle.join().unwrap();
    }

    #[test]
    fn test_broadcast_to_all_waiters() {
        let fut = FutureResult::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let fut = fut.clone();
                std::thread::spawn(move || fut.get().unwrap().as_int())
            })
            .collect();
        std::thread::sleep(Duration::from_millis(10));
        fut.set_result(Value::int(5));
        for w in waiters {
            assert_eq!(w.join().unwrap(), 5);
        }
    }
}
