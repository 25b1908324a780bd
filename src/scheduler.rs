// Copyright 2026 the strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::queue::Queue;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// A unit of work parked on the scheduler, waiting for the next drain.
pub(crate) trait Flush {
    /// Deliver this task's settled outcome to its successor, weak branches,
    /// and finalizer.
    fn flush(&self);
}

/// The host's "run soon" primitive.
///
/// The scheduler hands the hook a nullary callback and expects it to run
/// once, asynchronously, as soon as feasible after the current call stack
/// unwinds. A next-tick primitive, a message-channel port, or a minimum-delay
/// timer all qualify; there are no ordering guarantees beyond "later".
pub type RunSoon = Box<dyn Fn(Box<dyn FnOnce()>)>;

enum Queued {
    /// A settled task awaiting notification delivery. The entry keeps the
    /// task alive until its notification is out; without it, a task whose
    /// last handle was dropped right after settling would lose its pending
    /// rejection.
    Notify(Rc<dyn Flush>),
    /// A deferred closure (used by [`Task::init_deferred`][crate::Task::init_deferred]).
    Run(Box<dyn FnOnce()>),
}

/// Defers settled-task notifications so that chaining operations always
/// return before any mapper runs.
///
/// The scheduler keeps a FIFO of pending notifications. With a [`RunSoon`]
/// hook installed it arms a single deferred [`tick`][Scheduler::tick] per
/// batch; without one (a *manual* scheduler) the owner drains it by calling
/// `tick` directly. Cloning a `Scheduler` hands out another handle to the
/// same queue.
///
/// Notifications are delivered strictly in [`schedule`][Scheduler::schedule]
/// order; there are no fairness or priority guarantees beyond FIFO.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<SchedCore>,
}

struct SchedCore {
    queue: RefCell<Queue<Queued>>,
    /// Set while a host callback is pending, so a batch of `schedule` calls
    /// arms the hook exactly once.
    armed: Cell<bool>,
    run_soon: Option<RunSoon>,
}

// === impl Scheduler ===

impl Scheduler {
    /// Creates a scheduler that drains through the given host hook.
    pub fn new(run_soon: impl Fn(Box<dyn FnOnce()>) + 'static) -> Self {
        Self {
            core: Rc::new(SchedCore {
                queue: RefCell::new(Queue::new()),
                armed: Cell::new(false),
                run_soon: Some(Box::new(run_soon)),
            }),
        }
    }

    /// Creates a scheduler with no host hook; the owner is responsible for
    /// calling [`tick`][Self::tick].
    pub fn manual() -> Self {
        Self {
            core: Rc::new(SchedCore {
                queue: RefCell::new(Queue::new()),
                armed: Cell::new(false),
                run_soon: None,
            }),
        }
    }

    /// Returns the calling thread's default scheduler.
    pub fn current() -> Self {
        crate::current_scheduler()
    }

    /// Parks a settled task for notification delivery on the next drain.
    pub(crate) fn schedule(&self, task: Rc<dyn Flush>) {
        self.core.queue.borrow_mut().push(Queued::Notify(task));
        tracing::trace!(queued = self.core.queue.borrow().len(), "Scheduler::schedule");
        self.arm();
    }

    /// Parks a closure to run on the next drain, after everything already
    /// queued.
    pub(crate) fn defer(&self, f: Box<dyn FnOnce()>) {
        self.core.queue.borrow_mut().push(Queued::Run(f));
        self.arm();
    }

    fn arm(&self) {
        let Some(run_soon) = &self.core.run_soon else {
            return;
        };
        if self.core.armed.replace(true) {
            return;
        }
        tracing::trace!("Scheduler::arm");
        let weak = Rc::downgrade(&self.core);
        run_soon(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                Scheduler { core }.tick();
            }
        }));
    }

    /// Synchronously drains the queue, delivering every pending notification
    /// in FIFO order.
    ///
    /// Draining runs user code (mappers, finalizers, the rejection hook), so
    /// it may panic; a panic aborts the remaining drain and propagates, but
    /// if items remain the host callback is re-armed first so they are not
    /// stranded in a scheduled-but-never-drained queue. Ticking an empty
    /// queue is a no-op, and `tick` may be called again at any time.
    pub fn tick(&self) {
        self.core.armed.set(false);

        let mut polled = 0_usize;
        let mut guard = TickGuard {
            sched: self,
            complete: false,
        };
        loop {
            let item = self.core.queue.borrow_mut().shift();
            let Some(item) = item else { break };
            polled += 1;
            match item {
                Queued::Notify(task) => task.flush(),
                Queued::Run(f) => f(),
            }
        }
        guard.complete = true;

        if polled > 0 {
            tracing::trace!(polled, "Scheduler::tick");
        }
    }

    /// Empties the queue without delivering anything.
    pub fn clear(&self) {
        *self.core.queue.borrow_mut() = Queue::new();
    }

    /// Returns `true` if no notifications are waiting to be delivered.
    pub fn is_idle(&self) -> bool {
        self.core.queue.borrow().is_empty()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queued", &self.core.queue.borrow().len())
            .field("armed", &self.core.armed.get())
            .field("manual", &self.core.run_soon.is_none())
            .finish()
    }
}

/// Re-arms the host hook if a panicking drain left items behind.
struct TickGuard<'a> {
    sched: &'a Scheduler,
    complete: bool,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        if !self.complete && !self.sched.is_idle() {
            self.sched.arm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        id: u8,
        log: Rc<RefCell<Vec<u8>>>,
    }

    impl Flush for Recorder {
        fn flush(&self) {
            self.log.borrow_mut().push(self.id);
        }
    }

    struct Bomb;

    impl Flush for Bomb {
        fn flush(&self) {
            panic!("boom");
        }
    }

    fn recorders(ids: &[u8]) -> (Vec<Rc<Recorder>>, Rc<RefCell<Vec<u8>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let tasks = ids
            .iter()
            .map(|&id| {
                Rc::new(Recorder {
                    id,
                    log: log.clone(),
                })
            })
            .collect();
        (tasks, log)
    }

    #[test]
    fn drains_in_fifo_order() {
        let sched = Scheduler::manual();
        let (tasks, log) = recorders(&[1, 2, 3]);
        for t in &tasks {
            sched.schedule(t.clone() as Rc<dyn Flush>);
        }

        sched.tick();
        assert_eq!(*log.borrow(), [1, 2, 3]);
        assert!(sched.is_idle());

        // A second tick delivers nothing.
        sched.tick();
        assert_eq!(*log.borrow(), [1, 2, 3]);
    }

    #[test]
    fn queue_keeps_entries_alive_until_delivery() {
        let sched = Scheduler::manual();
        let (mut tasks, log) = recorders(&[1, 2]);
        sched.schedule(tasks[0].clone() as Rc<dyn Flush>);
        sched.schedule(tasks[1].clone() as Rc<dyn Flush>);

        // Dropping the caller's handle must not lose the notification.
        drop(tasks.remove(0));
        sched.tick();
        assert_eq!(*log.borrow(), [1, 2]);
    }

    #[test]
    fn arms_host_hook_once_per_batch() {
        let callbacks: Rc<RefCell<Vec<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(Vec::new()));
        let cbs = callbacks.clone();
        let sched = Scheduler::new(move |f| cbs.borrow_mut().push(f));

        let (tasks, log) = recorders(&[1, 2]);
        for t in &tasks {
            sched.schedule(t.clone() as Rc<dyn Flush>);
        }
        assert_eq!(callbacks.borrow().len(), 1);

        let cb = callbacks.borrow_mut().pop().unwrap();
        cb();
        assert_eq!(*log.borrow(), [1, 2]);

        // The next batch arms again.
        sched.schedule(tasks[0].clone() as Rc<dyn Flush>);
        assert_eq!(callbacks.borrow().len(), 1);
    }

    #[test]
    fn panicking_drain_rearms_for_the_rest() {
        let callbacks: Rc<RefCell<Vec<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(Vec::new()));
        let cbs = callbacks.clone();
        let sched = Scheduler::new(move |f| cbs.borrow_mut().push(f));

        let (tasks, log) = recorders(&[7]);
        sched.schedule(Rc::new(Bomb) as Rc<dyn Flush>);
        sched.schedule(tasks[0].clone() as Rc<dyn Flush>);

        let cb = callbacks.borrow_mut().pop().unwrap();
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb)).is_err();
        assert!(panicked);

        // The survivor was re-armed, not stranded.
        assert!(!sched.is_idle());
        let cb = callbacks.borrow_mut().pop().unwrap();
        cb();
        assert_eq!(*log.borrow(), [7]);
    }

    #[test]
    fn clear_discards_without_delivering() {
        let sched = Scheduler::manual();
        let (tasks, log) = recorders(&[1]);
        sched.schedule(tasks[0].clone() as Rc<dyn Flush>);

        sched.clear();
        sched.tick();
        assert!(log.borrow().is_empty());
        assert!(sched.is_idle());
    }
}
