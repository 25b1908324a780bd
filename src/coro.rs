// Copyright 2026 the strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Drives a resumable, stepwise procedure as a single task, treating every
//! yielded task as a suspension point.

use crate::error::{Fault, Outcome};
use crate::task::{Core, Settle, Task};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// What a procedure is resumed with.
pub enum Resumed<T, E> {
    /// Initial entry: no payload yet.
    Start,
    /// The previous suspension resolved with this value.
    Ok(T),
    /// The previous suspension faulted; the procedure may catch this and
    /// continue, or finish with an error of its own.
    Err(Fault<E>),
}

/// An intermediate value produced by a procedure.
pub enum Yielded<T, E> {
    /// A plain value, fed straight back in on the same stack.
    Value(T),
    /// A task: the procedure suspends until it settles.
    Task(Task<T, E>),
    /// A nested procedure, driven recursively and treated as a task.
    Coro(Box<dyn Coro<T, E>>),
}

/// A procedure's final value.
pub enum Final<T, E> {
    Ok(T),
    Err(E),
    /// The overall outcome is whatever this task settles with.
    Task(Task<T, E>),
    /// The overall outcome is the result of driving this nested procedure.
    Coro(Box<dyn Coro<T, E>>),
}

/// One step of a procedure: suspend on a yielded value, or finish.
pub enum Step<T, E> {
    Yield(Yielded<T, E>),
    Done(Final<T, E>),
}

/// A cooperative, resumable procedure.
///
/// Anything that can be resumed with a value, resumed with an error, and
/// asked to terminate fits: hand-written state machines, trampolined
/// continuations, adapters over generator-like types.
pub trait Coro<T, E> {
    /// Resumes the procedure. The input is [`Resumed::Start`] on initial
    /// entry, afterwards the outcome of the previous suspension point.
    fn resume(&mut self, input: Resumed<T, E>) -> Step<T, E>;

    /// Asks the procedure to run its cleanup path; called once when the
    /// driving task is canceled before the procedure finished.
    ///
    /// An error reported here has no task left to fail (the driving task
    /// already settled with the cancelation sentinel), so it is routed to
    /// the unhandled-rejection hook.
    fn shutdown(&mut self) -> Result<(), E> {
        Ok(())
    }
}

/// Runs a procedure as a task.
///
/// Plain yielded values are fed back iteratively on the same stack; yielded
/// tasks suspend the procedure until they settle, with faults injected at
/// the suspension point so the procedure can catch them. Canceling the
/// returned task terminates the procedure and cancels the task it is
/// currently suspended on.
pub fn drive<T, E>(coro: impl Coro<T, E> + 'static) -> Task<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    drive_boxed(Box::new(coro))
}

fn drive_boxed<T, E>(coro: Box<dyn Coro<T, E>>) -> Task<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    let output = Task::new();
    let driver = Rc::new(Driver {
        coro: RefCell::new(Some(coro)),
        current: RefCell::new(None),
        output: Rc::downgrade(&output.core),
    });

    let this = driver.clone();
    output.core.set_finalizer(Box::new(move |_| this.shutdown()));

    Driver::step(&driver, Resumed::Start);
    output
}

struct Driver<T, E> {
    coro: RefCell<Option<Box<dyn Coro<T, E>>>>,
    /// The task the procedure is currently suspended on.
    current: RefCell<Option<Task<T, E>>>,
    output: Weak<Core<T, E>>,
}

// === impl Driver ===

impl<T, E> Driver<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    fn step(this: &Rc<Self>, input: Resumed<T, E>) {
        let mut input = input;
        loop {
            let step = {
                let mut coro = this.coro.borrow_mut();
                // Terminated (or finished) while the resumption was in
                // flight; nothing left to drive.
                let Some(coro) = coro.as_mut() else { return };
                coro.resume(input)
            };

            let yielded = match step {
                Step::Done(done) => {
                    this.coro.borrow_mut().take();
                    this.current.borrow_mut().take();
                    let Some(output) = this.output.upgrade() else {
                        return;
                    };
                    tracing::trace!("coro done");
                    match done {
                        Final::Ok(value) => output.settle(Settle::Ok(value)),
                        Final::Err(error) => output.settle(Settle::Err(error)),
                        Final::Task(task) => output.settle(Settle::OkTask(task)),
                        Final::Coro(coro) => {
                            output.settle(Settle::OkTask(drive_boxed(coro)));
                        }
                    }
                    return;
                }
                Step::Yield(yielded) => yielded,
            };

            let task = match yielded {
                // Plain values resume iteratively; a procedure yielding them
                // in a tight loop must not grow the stack.
                Yielded::Value(value) => {
                    input = Resumed::Ok(value);
                    continue;
                }
                Yielded::Task(task) => task,
                Yielded::Coro(coro) => drive_boxed(coro),
            };

            tracing::trace!("coro suspended");
            let st = this.clone();
            let watcher = task.tap(Box::new(move |outcome: &Outcome<T, E>| {
                st.current.borrow_mut().take();
                let resumed = match outcome.clone() {
                    Ok(value) => Resumed::Ok(value),
                    Err(fault) => Resumed::Err(fault),
                };
                Driver::step(&st, resumed);
            }));
            // The suspension outcome is consumed by the procedure; it must
            // not double as an unhandled rejection of the watcher.
            watcher.core.observe(Box::new(|_| {}));
            *this.current.borrow_mut() = Some(watcher);
            return;
        }
    }

    /// Cancelation path: terminate the procedure, then cancel the
    /// suspension it was waiting on. Runs through the output task's
    /// finalizer, so completion makes it a no-op.
    fn shutdown(&self) {
        let coro = self.coro.borrow_mut().take();
        if let Some(mut coro) = coro {
            tracing::trace!("coro terminated");
            if let Err(error) = coro.shutdown() {
                (crate::rejection_hook())(&error);
            }
        }
        let current = self.current.borrow_mut().take();
        if let Some(current) = current {
            current.cancel();
        }
    }
}
