//! Single-threaded, settle-once promises.
//!
//! A [`Promise`] is the completion value that stream machinery and host
//! tasks hand to guest code. It can be observed two ways:
//!
//! - [`Promise::on_settled`] registers a reaction that runs synchronously
//!   when the promise settles (or immediately, if it already has)
//! - awaiting it as a [`Future`] wakes the awaiting task through the event
//!   loop's executor, so guest continuations never run inside a reaction

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use edge_compute_common::ScriptError;

type Reaction<T> = Box<dyn FnOnce(&Result<T, ScriptError>)>;

enum State<T> {
    Pending {
        reactions: Vec<Reaction<T>>,
        wakers: Vec<Waker>,
    },
    Settled(Result<T, ScriptError>),
}

/// A settle-once value shared by every clone.
pub struct Promise<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: Clone + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// A pending promise.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Pending {
                reactions: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    pub fn rejected(error: ScriptError) -> Self {
        Self::settled(Err(error))
    }

    pub fn settled(result: Result<T, ScriptError>) -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Settled(result))),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), State::Pending { .. })
    }

    /// The settled value, if any.
    pub fn result(&self) -> Option<Result<T, ScriptError>> {
        match &*self.state.borrow() {
            State::Pending { .. } => None,
            State::Settled(result) => Some(result.clone()),
        }
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: ScriptError) -> bool {
        self.settle(Err(error))
    }

    /// Settle the promise. Returns `false` if it was already settled, in
    /// which case `result` is dropped.
    pub fn settle(&self, result: Result<T, ScriptError>) -> bool {
        let (reactions, wakers) = {
            let mut state = self.state.borrow_mut();
            let State::Pending { reactions, wakers } = &mut *state else {
                return false;
            };
            let reactions = std::mem::take(reactions);
            let wakers = std::mem::take(wakers);
            *state = State::Settled(result.clone());
            (reactions, wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        for reaction in reactions {
            reaction(&result);
        }
        true
    }

    /// Run `reaction` once the promise settles.
    pub fn on_settled(&self, reaction: impl FnOnce(&Result<T, ScriptError>) + 'static) {
        let settled = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                State::Pending { reactions, .. } => {
                    reactions.push(Box::new(reaction));
                    return;
                }
                State::Settled(result) => result.clone(),
            }
        };
        reaction(&settled);
    }

    /// Chain another asynchronous step.
    pub fn then<U: Clone + 'static>(
        &self,
        step: impl FnOnce(Result<T, ScriptError>) -> Promise<U> + 'static,
    ) -> Promise<U> {
        let out = Promise::new();
        let target = out.clone();
        self.on_settled(move |result| {
            let next = step(result.clone());
            next.on_settled(move |result| {
                target.settle(result.clone());
            });
        });
        out
    }

    /// Transform the fulfilled value.
    pub fn map<U: Clone + 'static>(&self, f: impl FnOnce(T) -> U + 'static) -> Promise<U> {
        self.then(move |result| Promise::settled(result.map(f)))
    }

    /// Forward this promise's outcome into `target`.
    pub fn forward_to(&self, target: &Promise<T>) {
        let target = target.clone();
        self.on_settled(move |result| {
            target.settle(result.clone());
        });
    }
}

impl<T: Clone + 'static> Future for Promise<T> {
    type Output = Result<T, ScriptError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            State::Settled(result) => Poll::Ready(result.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.borrow() {
            State::Pending { .. } => "pending",
            State::Settled(Ok(_)) => "fulfilled",
            State::Settled(Err(_)) => "rejected",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_settles_once() {
        let promise = Promise::new();
        assert!(promise.resolve(1));
        assert!(!promise.resolve(2));
        assert!(!promise.reject(ScriptError::thrown("late")));
        assert_eq!(promise.result(), Some(Ok(1)));
    }

    #[test]
    fn test_reaction_runs_on_settle() {
        let seen = Rc::new(Cell::new(0));
        let promise = Promise::new();
        let s = Rc::clone(&seen);
        promise.on_settled(move |r| s.set(*r.as_ref().unwrap()));
        assert_eq!(seen.get(), 0);

        promise.resolve(7);
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn test_reaction_on_settled_promise_runs_immediately() {
        let seen = Rc::new(Cell::new(false));
        let s = Rc::clone(&seen);
        Promise::resolved(()).on_settled(move |_| s.set(true));
        assert!(seen.get());
    }

    #[test]
    fn test_then_chains_and_propagates_rejection() {
        let first: Promise<u32> = Promise::new();
        let second = first.then(|r| match r {
            Ok(v) => Promise::resolved(v * 2),
            Err(e) => Promise::rejected(e),
        });
        first.resolve(21);
        assert_eq!(second.result(), Some(Ok(42)));

        let failed: Promise<u32> = Promise::rejected(ScriptError::type_error("nope"));
        let mapped = failed.map(|v| v + 1);
        assert_eq!(mapped.result(), Some(Err(ScriptError::type_error("nope"))));
    }

    #[test]
    fn test_await_settled_promise() {
        let promise = Promise::resolved("done".to_string());
        let value = futures_util::FutureExt::now_or_never(promise).unwrap();
        assert_eq!(value.unwrap(), "done");
    }
}
