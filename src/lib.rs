// Copyright 2026 the strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cancelable one-shot tasks with synchronous upstream cleanup.
//!
//! A [`Task`] is a pending unit of work with exactly one consumer. Chaining
//! ([`map`][Task::map], [`map_ok`][Task::map_ok], [`map_err`][Task::map_err],
//! [`finally`][Task::finally]) claims the consumer slot and links the tasks
//! into an ownership chain; [`cancel`][Task::cancel] walks that chain
//! upstream synchronously (producers release their timers and sockets before
//! the call returns) while consumers downstream observe a catchable
//! [`Fault::Canceled`]. [`all`] and [`race`] combine task collections,
//! [`drive`] runs a resumable procedure as a task, and settled tasks can be
//! `.await`ed through the host-future adapter.
//!
//! Notification delivery is deferred through a [`Scheduler`], so chaining
//! always returns before any mapper runs. The whole crate is cooperative and
//! single-threaded; handles are `!Send`.
//!
//! ```
//! use strand::{Scheduler, Settle, Task};
//!
//! let task = Task::<u32, String>::ok(2).map_ok(|v| Settle::Ok(v * 21));
//!
//! Scheduler::current().tick();
//! assert_eq!(task.peek(), Some(Ok(42)));
//! ```

mod combine;
mod coro;
mod error;
mod future;
mod queue;
mod scheduler;
mod task;

pub use combine::{Entry, all, race};
pub use coro::{Coro, Final, Resumed, Step, Yielded, drive};
pub use error::{Fault, Outcome};
pub use future::{Completion, TaskFuture};
pub use scheduler::{RunSoon, Scheduler};
pub use task::{Cleanup, Settle, Task};

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub(crate) type RejectionHook = Rc<dyn Fn(&dyn fmt::Debug)>;

thread_local! {
    static CURRENT_SCHEDULER: Scheduler = Scheduler::manual();

    static REJECTION_HOOK: RefCell<RejectionHook> = RefCell::new(Rc::new(|fault| {
        panic!("unhandled task rejection: {fault:?}");
    }));
}

pub(crate) fn current_scheduler() -> Scheduler {
    CURRENT_SCHEDULER.with(Clone::clone)
}

/// Replaces the calling thread's unhandled-rejection hook.
///
/// The hook runs when a task settles into the error arm and no consumer ever
/// observes the outcome. The default hook panics so programming errors do
/// not vanish; replace it to log or queue instead.
pub fn set_rejection_hook(hook: impl Fn(&dyn fmt::Debug) + 'static) {
    REJECTION_HOOK.with(|slot| *slot.borrow_mut() = Rc::new(hook));
}

pub(crate) fn rejection_hook() -> RejectionHook {
    REJECTION_HOOK.with(|slot| slot.borrow().clone())
}

// The design assumes a single-threaded cooperative executor; nothing here
// may cross threads.
static_assertions::assert_not_impl_any!(Task<(), ()>: Send, Sync);
static_assertions::assert_not_impl_any!(Scheduler: Send, Sync);
static_assertions::assert_not_impl_any!(TaskFuture<(), ()>: Send, Sync);
