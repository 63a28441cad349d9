//! The exchange's event loop.
//!
//! Three kinds of work live here:
//!
//! - continuations: `'static` local futures, polled when woken
//! - [`AsyncTask`]s: one per pending host operation, run exactly once when
//!   the host reports the operation ready
//! - timers
//!
//! [`EventLoop::run`] alternates between draining continuations and
//! blocking in the host's `select` until a task or timer is due.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Context;
use std::time::{Duration, Instant};

use futures_util::future::{FutureExt, LocalBoxFuture};
use futures_util::task::{ArcWake, waker};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use edge_compute_common::{DispatchConfig, HostError, RuntimeError};
use edge_compute_host::AsyncItemHandle;

use crate::context::ExchangeContext;

/// A pending host operation and what to do once it is ready.
///
/// A task is queued once, run exactly once, and dropped afterwards.
pub trait AsyncTask {
    /// The readiness key `select` waits on.
    fn handle(&self) -> AsyncItemHandle;

    /// Complete the operation. The host has reported it ready.
    fn run(self: Box<Self>, cx: &Rc<ExchangeContext>);

    /// Short name for logs.
    fn name(&self) -> &'static str {
        "task"
    }
}

struct TaskWaker {
    id: u64,
    ready: Arc<Mutex<VecDeque<u64>>>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.lock().push_back(arc_self.id);
    }
}

enum TimerCallback {
    Once(Box<dyn FnOnce()>),
    Repeat(Box<dyn FnMut()>),
}

struct Timer {
    id: u32,
    deadline: Instant,
    period: Option<Duration>,
    callback: TimerCallback,
}

/// Continuations, host tasks and timers of one exchange.
pub struct EventLoop {
    futures: RefCell<HashMap<u64, LocalBoxFuture<'static, ()>>>,
    ready: Arc<Mutex<VecDeque<u64>>>,
    next_future: Cell<u64>,
    tasks: RefCell<Vec<Box<dyn AsyncTask>>>,
    timers: RefCell<Vec<Timer>>,
    /// Interval whose callback is running; cleared to `None` if the
    /// callback clears its own timer.
    running: Cell<Option<u32>>,
    next_timer: Cell<u32>,
    max_pending_tasks: usize,
    select_timeout: Option<Duration>,
    tasks_run: Cell<u64>,
}

impl EventLoop {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            futures: RefCell::new(HashMap::new()),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            next_future: Cell::new(0),
            tasks: RefCell::new(Vec::new()),
            timers: RefCell::new(Vec::new()),
            running: Cell::new(None),
            next_timer: Cell::new(1),
            max_pending_tasks: config.max_pending_tasks,
            select_timeout: config.select_timeout(),
            tasks_run: Cell::new(0),
        }
    }

    /// Schedule a continuation. It is first polled by the next drain.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        let id = self.next_future.get();
        self.next_future.set(id + 1);
        self.futures.borrow_mut().insert(id, future.boxed_local());
        self.ready.lock().push_back(id);
    }

    /// Poll woken continuations until none is ready. Returns how many
    /// polls were made.
    pub fn run_ready(&self) -> usize {
        let mut polls = 0;
        loop {
            let Some(id) = self.ready.lock().pop_front() else {
                return polls;
            };
            // Taken out of the map so the future may spawn while polled.
            let Some(mut future) = self.futures.borrow_mut().remove(&id) else {
                continue;
            };
            let waker = waker(Arc::new(TaskWaker {
                id,
                ready: Arc::clone(&self.ready),
            }));
            let mut context = Context::from_waker(&waker);
            polls += 1;
            if future.as_mut().poll(&mut context).is_pending() {
                self.futures.borrow_mut().insert(id, future);
            }
        }
    }

    /// Queue a task for a pending host operation.
    ///
    /// # Errors
    ///
    /// Returns `BadHandle` for a task keyed on an invalid handle, and
    /// `LimitExceeded` when too many tasks are pending.
    pub fn queue_task(&self, task: Box<dyn AsyncTask>) -> Result<(), HostError> {
        if !task.handle().is_valid() {
            return Err(HostError::bad_handle("queue_task"));
        }
        let mut tasks = self.tasks.borrow_mut();
        if tasks.len() >= self.max_pending_tasks {
            warn!(
                limit = self.max_pending_tasks,
                task = task.name(),
                "Pending task limit reached"
            );
            return Err(HostError::limit_exceeded("queue_task"));
        }
        debug!(task = task.name(), handle = task.handle().as_u32(), "Queued task");
        tasks.push(task);
        Ok(())
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Continuations that have not completed, whether or not they are ready.
    pub fn live_continuations(&self) -> usize {
        self.futures.borrow().len()
    }

    pub fn tasks_run(&self) -> u64 {
        self.tasks_run.get()
    }

    /// Whether a task or timer remains.
    pub fn has_pending_work(&self) -> bool {
        !self.tasks.borrow().is_empty() || !self.timers.borrow().is_empty()
    }

    /// Run `callback` once after `delay`. Returns a positive timer id.
    pub fn set_timeout(&self, delay: Duration, callback: impl FnOnce() + 'static) -> u32 {
        self.add_timer(delay, None, TimerCallback::Once(Box::new(callback)))
    }

    /// Run `callback` every `period` until cleared.
    pub fn set_interval(&self, period: Duration, callback: impl FnMut() + 'static) -> u32 {
        self.add_timer(period, Some(period), TimerCallback::Repeat(Box::new(callback)))
    }

    /// Cancel a timer. Unknown and already fired ids are ignored.
    pub fn clear_timer(&self, id: u32) {
        self.timers.borrow_mut().retain(|t| t.id != id);
        if self.running.get() == Some(id) {
            self.running.set(None);
        }
    }

    fn add_timer(&self, delay: Duration, period: Option<Duration>, callback: TimerCallback) -> u32 {
        let id = self.next_timer.get();
        self.next_timer.set(id.wrapping_add(1).max(1));
        self.timers.borrow_mut().push(Timer {
            id,
            deadline: Instant::now() + delay,
            period,
            callback,
        });
        trace!(timer = id, delay_ms = delay.as_millis(), "Timer armed");
        id
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().iter().map(|t| t.deadline).min()
    }

    /// Run the timer with the earliest deadline.
    fn fire_next_timer(&self) {
        let timer = {
            let mut timers = self.timers.borrow_mut();
            let Some(index) = timers
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| t.deadline)
                .map(|(i, _)| i)
            else {
                return;
            };
            timers.remove(index)
        };
        trace!(timer = timer.id, "Timer fired");
        match timer.callback {
            TimerCallback::Once(callback) => callback(),
            TimerCallback::Repeat(mut callback) => {
                self.running.set(Some(timer.id));
                callback();
                if self.running.take() != Some(timer.id) {
                    return;
                }
                if let Some(period) = timer.period {
                    self.timers.borrow_mut().push(Timer {
                        id: timer.id,
                        deadline: timer.deadline + period,
                        period: Some(period),
                        callback: TimerCallback::Repeat(callback),
                    });
                }
            }
        }
    }

    /// Run until `keep_running` turns false or no task or timer remains.
    ///
    /// # Errors
    ///
    /// Returns an error if `select` fails, or if it times out with no timer
    /// to run.
    pub fn run(
        &self,
        cx: &Rc<ExchangeContext>,
        keep_running: impl Fn() -> bool,
    ) -> Result<(), RuntimeError> {
        loop {
            self.run_ready();
            if !keep_running() {
                return Ok(());
            }

            let next_deadline = self.next_deadline();
            let has_tasks = !self.tasks.borrow().is_empty();
            if !has_tasks && next_deadline.is_none() {
                return Ok(());
            }

            let now = Instant::now();
            if next_deadline.is_some_and(|deadline| deadline <= now) {
                self.fire_next_timer();
                continue;
            }

            if !has_tasks {
                if let Some(deadline) = next_deadline {
                    std::thread::sleep(deadline - now);
                }
                self.fire_next_timer();
                continue;
            }

            let timeout = next_deadline.map_or(self.select_timeout, |d| Some(d - now));
            let items: Vec<AsyncItemHandle> =
                self.tasks.borrow().iter().map(|t| t.handle()).collect();

            match cx.host().async_select(&items, timeout)? {
                Some(index) if index < items.len() => {
                    let task = self.tasks.borrow_mut().remove(index);
                    debug!(
                        request_id = %cx.request_id(),
                        task = task.name(),
                        handle = items[index].as_u32(),
                        "Running ready task"
                    );
                    self.tasks_run.set(self.tasks_run.get() + 1);
                    task.run(cx);
                }
                Some(index) => {
                    return Err(RuntimeError::dispatch(format!(
                        "select returned index {index} for {} items",
                        items.len()
                    )));
                }
                None if next_deadline.is_some() => self.fire_next_timer(),
                None => {
                    return Err(RuntimeError::dispatch(
                        "Timed out waiting for pending host operations",
                    ));
                }
            }
        }
    }

    /// Drop every remaining continuation, task and timer.
    pub fn clear(&self) {
        let tasks = std::mem::take(&mut *self.tasks.borrow_mut());
        if !tasks.is_empty() {
            warn!(pending = tasks.len(), "Dropping tasks left pending");
        }
        let futures = std::mem::take(&mut *self.futures.borrow_mut());
        let timers = std::mem::take(&mut *self.timers.borrow_mut());
        self.ready.lock().clear();
        drop((tasks, futures, timers));
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("continuations", &self.futures.borrow().len())
            .field("tasks", &self.tasks.borrow().len())
            .field("timers", &self.timers.borrow().len())
            .field("tasks_run", &self.tasks_run.get())
            .finish_non_exhaustive()
    }
}
