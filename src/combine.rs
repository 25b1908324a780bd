// Copyright 2026 the strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Fault, Outcome};
use crate::task::{Core, Settle, Task};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// One input to [`all`] or [`race`]: a plain value or a task to wait on.
pub enum Entry<T, E> {
    Value(T),
    Task(Task<T, E>),
}

/// Resolves once every input has, with the values in input order; fails with
/// the first fault observed, canceling every other input.
///
/// Already-settled inputs are drained during intake: a settled error
/// short-circuits immediately, settled successes are consumed in place.
/// Canceling the returned task cancels all inputs.
///
/// # Panics
///
/// Panics if an input task is already consumed.
#[track_caller]
pub fn all<T, E>(entries: impl IntoIterator<Item = Entry<T, E>>) -> Task<Vec<T>, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    let entries: Vec<Entry<T, E>> = entries.into_iter().collect();
    let output = Task::<Vec<T>, E>::new();
    tracing::trace!(len = entries.len(), "all");

    let mut slots: Vec<Option<T>> = Vec::with_capacity(entries.len());
    let mut inputs: Vec<Task<T, E>> = Vec::new();
    let mut waiters: Vec<(usize, Task<T, E>)> = Vec::new();
    let mut short_circuit: Option<Fault<E>> = None;

    for entry in entries {
        match entry {
            Entry::Value(value) => slots.push(Some(value)),
            Entry::Task(task) => {
                if short_circuit.is_some() {
                    slots.push(None);
                    inputs.push(task);
                } else if task.is_settled() {
                    match task.core.extract() {
                        Ok(value) => slots.push(Some(value)),
                        Err(fault) => {
                            tracing::trace!(?fault, "all: input already failed");
                            short_circuit = Some(fault);
                            slots.push(None);
                        }
                    }
                    inputs.push(task);
                } else {
                    slots.push(None);
                    waiters.push((slots.len() - 1, task.clone()));
                    inputs.push(task);
                }
            }
        }
    }

    if let Some(fault) = short_circuit {
        output.core.settle_outcome(Err(fault));
        for task in &inputs {
            task.cancel();
        }
        return output;
    }

    if waiters.is_empty() {
        let values = slots
            .into_iter()
            .map(|slot| slot.expect("no waiters means every slot is filled, this is a bug!"))
            .collect();
        output.settle(Settle::Ok(values));
        return output;
    }

    let state = Rc::new(AllState {
        slots: RefCell::new(slots),
        remaining: Cell::new(waiters.len()),
        output: Rc::downgrade(&output.core),
        inputs: inputs.iter().map(|t| Rc::downgrade(&t.core)).collect(),
        done: Cell::new(false),
    });

    let mut held: Vec<Task<T, E>> = Vec::new();
    for (index, task) in waiters {
        let st = state.clone();
        let callback: Box<dyn FnOnce(&Outcome<T, E>)> =
            Box::new(move |outcome| st.settled_at(index, outcome.clone()));
        attach(task, callback, &mut held);
    }

    // Canceling the output releases every input; a successful flush has
    // nothing left to release. The closure also keeps the inputs and tap
    // watchers alive until the output leaves pending.
    output.core.set_finalizer(Box::new(move |outcome| {
        if outcome.is_err() {
            for task in &inputs {
                task.cancel();
            }
        }
        drop(held);
    }));

    output
}

/// Resolves or fails with the first observed outcome, canceling the losers.
///
/// Already-settled inputs are inspected in input order during intake and the
/// first one wins; a plain value wins immediately. An empty input list
/// resolves with `T::default()`.
///
/// # Panics
///
/// Panics if an input task is already consumed.
#[track_caller]
pub fn race<T, E>(entries: impl IntoIterator<Item = Entry<T, E>>) -> Task<T, E>
where
    T: Clone + Default + 'static,
    E: Clone + fmt::Debug + 'static,
{
    let entries: Vec<Entry<T, E>> = entries.into_iter().collect();
    let output = Task::<T, E>::new();
    tracing::trace!(len = entries.len(), "race");

    if entries.is_empty() {
        output.settle(Settle::Ok(T::default()));
        return output;
    }

    let mut inputs: Vec<Task<T, E>> = Vec::new();
    let mut winner: Option<Outcome<T, E>> = None;
    let mut winner_index: Option<usize> = None;

    for entry in entries {
        match entry {
            Entry::Value(value) => {
                if winner.is_none() {
                    winner = Some(Ok(value));
                }
            }
            Entry::Task(task) => {
                if winner.is_none() && task.is_settled() {
                    winner = Some(task.core.extract());
                    winner_index = Some(inputs.len());
                }
                inputs.push(task);
            }
        }
    }

    if let Some(outcome) = winner {
        tracing::trace!("race: settled at intake");
        output.core.settle_outcome(outcome);
        for (index, task) in inputs.iter().enumerate() {
            if Some(index) != winner_index {
                task.cancel();
            }
        }
        return output;
    }

    let state = Rc::new(RaceState {
        output: Rc::downgrade(&output.core),
        inputs: inputs.iter().map(|t| Rc::downgrade(&t.core)).collect(),
        done: Cell::new(false),
    });

    let mut held: Vec<Task<T, E>> = Vec::new();
    for (index, task) in inputs.iter().enumerate() {
        let st = state.clone();
        let callback: Box<dyn FnOnce(&Outcome<T, E>)> =
            Box::new(move |outcome| st.settled_first(index, outcome.clone()));
        attach(task.clone(), callback, &mut held);
    }

    output.core.set_finalizer(Box::new(move |outcome| {
        if outcome.is_err() {
            for task in &inputs {
                task.cancel();
            }
        }
        drop(held);
    }));

    output
}

/// Hooks a per-input callback onto a pending task: through the finalizer
/// slot when it is free, otherwise through a chained tap (retained by the
/// caller so it outlives the attach).
fn attach<T, E>(
    task: Task<T, E>,
    callback: Box<dyn FnOnce(&Outcome<T, E>)>,
    held: &mut Vec<Task<T, E>>,
) where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    if task.core.has_finalizer() {
        let watcher = task.tap(callback);
        // The combinator consumed the outcome in the tap; the pass-through
        // watcher must not re-report it as unhandled.
        watcher.core.observe(Box::new(|_| {}));
        held.push(watcher);
    } else {
        task.core.observe(callback);
    }
}

struct AllState<T, E> {
    slots: RefCell<Vec<Option<T>>>,
    remaining: Cell<usize>,
    output: Weak<Core<Vec<T>, E>>,
    inputs: Vec<Weak<Core<T, E>>>,
    done: Cell<bool>,
}

// === impl AllState ===

impl<T, E> AllState<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    fn settled_at(&self, index: usize, outcome: Outcome<T, E>) {
        if self.done.get() {
            return;
        }
        match outcome {
            Err(fault) => {
                tracing::trace!(index, ?fault, "all: input failed");
                self.done.set(true);
                if let Some(output) = self.output.upgrade() {
                    output.settle_outcome(Err(fault));
                }
                for input in &self.inputs {
                    if let Some(core) = input.upgrade() {
                        core.cancel();
                    }
                }
            }
            Ok(value) => {
                self.slots.borrow_mut()[index] = Some(value);
                let left = self.remaining.get() - 1;
                self.remaining.set(left);
                tracing::trace!(index, left, "all: input resolved");
                if left == 0 {
                    self.done.set(true);
                    let values = self
                        .slots
                        .borrow_mut()
                        .drain(..)
                        .map(|slot| {
                            slot.expect("a drained combinator slot is filled, this is a bug!")
                        })
                        .collect();
                    if let Some(output) = self.output.upgrade() {
                        output.settle_outcome(Ok(values));
                    }
                }
            }
        }
    }
}

struct RaceState<T, E> {
    output: Weak<Core<T, E>>,
    inputs: Vec<Weak<Core<T, E>>>,
    done: Cell<bool>,
}

// === impl RaceState ===

impl<T, E> RaceState<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    fn settled_first(&self, index: usize, outcome: Outcome<T, E>) {
        if self.done.replace(true) {
            return;
        }
        tracing::trace!(index, "race: winner");
        if let Some(output) = self.output.upgrade() {
            output.settle_outcome(outcome);
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if i == index {
                continue;
            }
            if let Some(core) = input.upgrade() {
                core.cancel();
            }
        }
    }
}
