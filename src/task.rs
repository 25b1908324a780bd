// Copyright 2026 the strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod state;

use crate::error::{Fault, Outcome};
use crate::queue::Queue;
use crate::scheduler::{Flush, Scheduler};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use state::{CancelAction, ConsumeAction, SettleAction, State};

/// A producer-side cleanup closure, installed by [`Task::init`] and run once
/// when the task leaves pending (on notification delivery or cancelation).
pub type Cleanup = Box<dyn FnOnce()>;

/// The input to [`Task::settle`]: exactly one slot, either plain or a nested
/// task to flatten.
///
/// The two task variants replay the flattening rules: a task in the result
/// slot forwards its outcome unchanged, a task in the error slot rethrows
/// whichever payload it produces into the error channel (which is why both
/// of its type parameters are the error type).
pub enum Settle<T, E> {
    /// Settle with a success payload.
    Ok(T),
    /// Settle with a user error.
    Err(E),
    /// Wait for the nested task and adopt its outcome.
    OkTask(Task<T, E>),
    /// Wait for the nested task and rethrow its payload as an error.
    ErrTask(Task<E, E>),
}

/// A unit of cancelable, one-shot asynchronous computation.
///
/// A task starts out *pending* and settles exactly once, into a success or a
/// [`Fault`]. It has at most one consumer: chaining operations ([`map`],
/// [`map_ok`], [`map_err`], [`finally`]) claim the receiver, and claiming it
/// twice panics. Additional observers that must not take ownership hang off
/// [`branch`].
///
/// [`cancel`] aborts a pending task: producers upstream are torn down
/// synchronously (their cleanup runs before `cancel` returns), while
/// consumers downstream observe [`Fault::Canceled`] through the ordinary
/// notification path and may catch it.
///
/// `Task` is a cheap handle; clones refer to the same underlying task. The
/// whole type is single-threaded: handles are `!Send` and `!Sync`, and every
/// mapper, finalizer, and notification runs on the calling stack or inside
/// [`Scheduler::tick`].
///
/// [`map`]: Task::map
/// [`map_ok`]: Task::map_ok
/// [`map_err`]: Task::map_err
/// [`finally`]: Task::finally
/// [`branch`]: Task::branch
/// [`cancel`]: Task::cancel
pub struct Task<T, E> {
    pub(crate) core: Rc<Core<T, E>>,
}

/// The downstream edge of a task: where its outcome goes on flush.
///
/// An ordinary chain link forwards to the successor cell, whose own mapper
/// then runs; everything else (error-slot flattening, `finally` cleanup
/// coordination) is a one-shot closure.
enum Succ<T, E> {
    Chain(Weak<Core<T, E>>),
    Closure(Box<dyn FnOnce(Outcome<T, E>)>),
}

/// The mapper installed on a task, run once when the task settles.
///
/// A closed sum rather than a bare boxed closure: the convenience chaining
/// operations get their skip-the-other-arm behavior here, and internal taps
/// pass the outcome through unchanged (including the cancelation sentinel,
/// which the public [`Settle`] type cannot express).
enum Mapper<T, E> {
    Full(Box<dyn FnOnce(Outcome<T, E>) -> Settle<T, E>>),
    MapOk(Box<dyn FnOnce(T) -> Settle<T, E>>),
    MapErr(Box<dyn FnOnce(Fault<E>) -> Settle<T, E>>),
    Finally(Box<dyn FnOnce(&Outcome<T, E>) -> Result<Option<Task<T, E>>, E>>),
    Tap(Box<dyn FnOnce(&Outcome<T, E>)>),
}

/// What a mapper produced, fed back into the settle machinery.
enum Mapped<T, E> {
    Outcome(Outcome<T, E>),
    OkTask(Task<T, E>),
    ErrTask(Task<E, E>),
    /// `finally` returned a cleanup task: wait for it, then yield the
    /// original outcome (or the cleanup's own failure).
    Wait {
        cleanup: Task<T, E>,
        original: Outcome<T, E>,
    },
}

pub(crate) type Finalizer<T, E> = Box<dyn FnOnce(&Outcome<T, E>)>;

/// Type-erased owning link to a predecessor, so a `Task<T, E>` can own an
/// error-slot predecessor of type `Task<E, E>`.
pub(crate) trait Upstream {
    fn cancel(&self);
}

pub(crate) struct Core<T, E> {
    state: State,
    /// The settled outcome. Written once by `commit`, immutable afterwards.
    value: RefCell<Option<Outcome<T, E>>>,
    /// Owning link to the task this one waits on; canceling this task
    /// cancels the predecessor.
    predecessor: RefCell<Option<Rc<dyn Upstream>>>,
    /// Back-link to the unique consumer.
    successor: RefCell<Option<Succ<T, E>>>,
    /// Non-consuming observers, notified in FIFO order after the successor.
    branches: RefCell<Queue<Rc<Core<T, E>>>>,
    mapper: RefCell<Option<Mapper<T, E>>>,
    /// Internal cleanup/coordination callback, run exactly once when the
    /// task leaves pending (combinators, adapters, and `init` use this).
    finalizer: RefCell<Option<Finalizer<T, E>>>,
    scheduler: Scheduler,
    myself: Weak<Core<T, E>>,
}

// === impl Task ===

impl<T, E> Task<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    /// Creates a fresh pending task on the calling thread's default
    /// scheduler.
    pub fn new() -> Self {
        Self::new_in(&Scheduler::current())
    }

    /// Creates a fresh pending task whose notifications go through the given
    /// scheduler.
    pub fn new_in(scheduler: &Scheduler) -> Self {
        Task {
            core: Core::new(scheduler.clone(), None),
        }
    }

    /// Creates a task already settled with a success payload.
    pub fn ok(value: T) -> Self {
        Self::settled(Settle::Ok(value))
    }

    /// Creates a task already settled with a user error.
    pub fn err(error: E) -> Self {
        Self::settled(Settle::Err(error))
    }

    /// Creates a task settled with the given input (which may flatten a
    /// nested task).
    pub fn settled(input: Settle<T, E>) -> Self {
        let task = Self::new();
        task.settle(input);
        task
    }

    /// Creates a pending task and hands it to a producer.
    ///
    /// The initer runs synchronously; the cleanup closure it returns (if
    /// any) is released exactly once, when the task settles or is canceled
    /// from any point downstream. This is the place to clear timers, close
    /// sockets, and the like.
    pub fn init(initer: impl FnOnce(&Task<T, E>) -> Option<Cleanup>) -> Self {
        let task = Self::new();
        if let Some(cleanup) = initer(&task) {
            task.core.set_finalizer(Box::new(move |_| cleanup()));
        }
        task
    }

    /// Like [`init`][Self::init], but the initer runs on the scheduler's
    /// next drain instead of synchronously, for producers that must not
    /// re-enter the caller.
    ///
    /// The initer may find the task already settled (it can be canceled
    /// before the drain runs); it should check before doing work.
    pub fn init_deferred(
        initer: impl FnOnce(&Task<T, E>) -> Option<Cleanup> + 'static,
    ) -> Self {
        let task = Self::new();
        let handle = task.clone();
        task.core.scheduler.defer(Box::new(move || {
            if let Some(cleanup) = initer(&handle) {
                handle.core.set_finalizer(Box::new(move |_| cleanup()));
            }
        }));
        task
    }

    /// Settles the task with exactly one of an error or a result.
    ///
    /// At most one settle wins: calls on an already-settled task, and calls
    /// made while the task's own mapper is running, are dropped silently.
    /// Settling with a nested task flattens it (the nested task becomes this
    /// task's predecessor), and settling a task with itself panics.
    #[track_caller]
    pub fn settle(&self, input: Settle<T, E>) {
        self.core.settle(input);
    }

    /// Chains a full mapper: `f` sees the settled outcome (success, failure,
    /// or cancelation) and produces the new task's input.
    ///
    /// Consumes this task's single consumer slot; the returned task is the
    /// new end of the chain and owns this one.
    ///
    /// # Panics
    ///
    /// Panics if the task is already consumed.
    #[track_caller]
    pub fn map(self, f: impl FnOnce(Outcome<T, E>) -> Settle<T, E> + 'static) -> Task<T, E> {
        self.chain(Mapper::Full(Box::new(f)))
    }

    /// Chains a success mapper; faults pass through untouched.
    ///
    /// # Panics
    ///
    /// Panics if the task is already consumed.
    #[track_caller]
    pub fn map_ok(self, f: impl FnOnce(T) -> Settle<T, E> + 'static) -> Task<T, E> {
        self.chain(Mapper::MapOk(Box::new(f)))
    }

    /// Chains a fault handler; successes pass through untouched. Returning
    /// `Settle::Ok` recovers the chain into the success arm.
    ///
    /// # Panics
    ///
    /// Panics if the task is already consumed.
    #[track_caller]
    pub fn map_err(self, f: impl FnOnce(Fault<E>) -> Settle<T, E> + 'static) -> Task<T, E> {
        self.chain(Mapper::MapErr(Box::new(f)))
    }

    /// Chains a cleanup step that does not change the outcome.
    ///
    /// `f` observes the outcome by reference. Returning `Ok(None)` passes
    /// the outcome through; returning `Ok(Some(task))` waits for that task
    /// first and then yields the original outcome (unless the cleanup task
    /// fails, which replaces it); returning `Err` replaces the outcome.
    ///
    /// # Panics
    ///
    /// Panics if the task is already consumed.
    #[track_caller]
    pub fn finally(
        self,
        f: impl FnOnce(&Outcome<T, E>) -> Result<Option<Task<T, E>>, E> + 'static,
    ) -> Task<T, E> {
        self.chain(Mapper::Finally(Box::new(f)))
    }

    /// Internal observer chain: `f` sees the outcome by reference and the
    /// outcome passes through unchanged, including the cancelation sentinel.
    pub(crate) fn tap(self, f: Box<dyn FnOnce(&Outcome<T, E>)>) -> Task<T, E> {
        self.chain(Mapper::Tap(f))
    }

    #[track_caller]
    fn chain(self, mapper: Mapper<T, E>) -> Task<T, E> {
        self.core.consume();
        let succ = Core::new(self.core.scheduler.clone(), Some(mapper));
        *succ.predecessor.borrow_mut() = Some(self.core.clone() as Rc<dyn Upstream>);
        *self.core.successor.borrow_mut() = Some(Succ::Chain(Rc::downgrade(&succ)));
        if self.core.state.is_settled() {
            // Already settled: reschedule so the new consumer hears about it.
            self.core.schedule();
        }
        Task { core: succ }
    }

    /// Returns a non-owning observer of this task's outcome.
    ///
    /// Weak branches receive a copy of the outcome after the consumer, in
    /// the order they were created. Canceling a branch never affects the
    /// parent or its other branches, and a branch cannot stop a rejection
    /// from being reported as unhandled.
    pub fn branch(&self) -> Task<T, E> {
        let branch = Core::new(self.core.scheduler.clone(), None);
        self.core.branches.borrow_mut().push(branch.clone());
        if self.core.state.is_settled() {
            self.core.schedule();
        }
        Task { core: branch }
    }

    /// Cancels the task.
    ///
    /// Upstream propagation is synchronous: by the time `cancel` returns,
    /// every finalizer on the predecessor chain has run. Downstream, the
    /// consumer observes [`Fault::Canceled`] through the normal notification
    /// path and may catch it with any chaining operation. Canceling twice,
    /// or while the task's own mapper is running, is a no-op.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Synchronously peeks at the outcome: `None` while pending.
    pub fn peek(&self) -> Option<Outcome<T, E>> {
        self.core.value.borrow().clone()
    }

    /// Returns `true` if the task has not settled yet.
    pub fn is_pending(&self) -> bool {
        !self.core.state.is_settled()
    }

    /// Returns `true` if the task has settled (successfully or not).
    pub fn is_settled(&self) -> bool {
        self.core.state.is_settled()
    }

    /// Returns `true` if the task settled into the error arm.
    pub fn is_failed(&self) -> bool {
        self.core.state.is_failed()
    }

    /// Returns `true` if the task already has its unique consumer.
    pub fn is_consumed(&self) -> bool {
        self.core.state.is_consumed()
    }

    /// Returns `true` if the task was canceled, or settled with the
    /// cancelation sentinel propagated from upstream.
    pub fn is_canceled(&self) -> bool {
        self.core.state.is_canceled()
            || matches!(&*self.core.value.borrow(), Some(Err(fault)) if fault.is_canceled())
    }
}

impl<T, E> Clone for Task<T, E> {
    fn clone(&self) -> Self {
        Task {
            core: self.core.clone(),
        }
    }
}

impl<T, E> Default for Task<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Task<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.core.state)
            .field("addr", &Rc::as_ptr(&self.core))
            .finish()
    }
}

// === impl Core ===

impl<T, E> Core<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    fn new(scheduler: Scheduler, mapper: Option<Mapper<T, E>>) -> Rc<Self> {
        Rc::new_cyclic(|myself| Core {
            state: State::new(),
            value: RefCell::new(None),
            predecessor: RefCell::new(None),
            successor: RefCell::new(None),
            branches: RefCell::new(Queue::new()),
            mapper: RefCell::new(mapper),
            finalizer: RefCell::new(None),
            scheduler,
            myself: myself.clone(),
        })
    }

    /// Entry point for all state transitions out of pending. The rules apply
    /// in order; the first match wins:
    ///
    /// 1. settled or mid-mapper: drop the call
    /// 2. settling with this task itself: panic
    /// 3./4. a nested task in either slot: adopt it as predecessor
    /// 5. mapper present: run it, feed its output back in
    /// 6. terminal: store the value and schedule notification
    #[track_caller]
    pub(crate) fn settle(&self, input: Settle<T, E>) {
        if let SettleAction::Ignore = self.state.begin_settle() {
            tracing::trace!(state = ?self.state, "Task::settle ignored");
            return;
        }
        match input {
            Settle::OkTask(task) => {
                self.assert_not_self(Rc::as_ptr(&task.core).cast());
                self.adopt_ok(task);
            }
            Settle::ErrTask(task) => {
                self.assert_not_self(Rc::as_ptr(&task.core).cast());
                self.adopt_err(task);
            }
            Settle::Ok(value) => self.resolve(Ok(value)),
            Settle::Err(error) => self.resolve(Err(Fault::Failed(error))),
        }
    }

    /// Settle with an already-shaped outcome: the path taken by forwarded
    /// notifications and cancelation, where the sentinel must survive.
    pub(crate) fn settle_outcome(&self, outcome: Outcome<T, E>) {
        if let SettleAction::Ignore = self.state.begin_settle() {
            return;
        }
        self.resolve(outcome);
    }

    fn resolve(&self, outcome: Outcome<T, E>) {
        let mapper = self.mapper.borrow_mut().take();
        let Some(mapper) = mapper else {
            self.commit(outcome);
            return;
        };

        let mapped = {
            let _mapping = MappingGuard::new(&self.state);
            mapper.apply(outcome)
        };

        match mapped {
            Mapped::Outcome(outcome) => self.resolve(outcome),
            Mapped::OkTask(task) => {
                self.assert_not_self(Rc::as_ptr(&task.core).cast());
                self.adopt_ok(task);
            }
            Mapped::ErrTask(task) => {
                self.assert_not_self(Rc::as_ptr(&task.core).cast());
                self.adopt_err(task);
            }
            Mapped::Wait { cleanup, original } => self.adopt_wait(cleanup, original),
        }
    }

    fn commit(&self, outcome: Outcome<T, E>) {
        let failed = outcome.is_err();
        tracing::trace!(failed, "Task::commit");
        *self.value.borrow_mut() = Some(outcome);
        self.state.commit(failed);
        self.schedule();
    }

    /// Result-slot flattening: wait for `pred` and adopt its outcome as-is.
    #[track_caller]
    fn adopt_ok(&self, pred: Task<T, E>) {
        let target = self.myself.clone();
        self.adopt(
            pred.core,
            Succ::Chain(target),
        );
    }

    /// Error-slot flattening: whichever payload `pred` produces is rethrown
    /// into this task's error slot. An upstream cancelation stays a
    /// cancelation.
    #[track_caller]
    fn adopt_err(&self, pred: Task<E, E>) {
        let target = self.myself.clone();
        let edge = Succ::Closure(Box::new(move |outcome: Outcome<E, E>| {
            let Some(core) = target.upgrade() else { return };
            match outcome {
                Ok(value) => core.settle_outcome(Err(Fault::Failed(value))),
                Err(fault) => core.settle_outcome(Err(fault)),
            }
        }));
        self.adopt(pred.core, edge);
    }

    /// `finally` coordination: wait for the cleanup task, then yield the
    /// saved outcome; a failing cleanup replaces it.
    #[track_caller]
    fn adopt_wait(&self, cleanup: Task<T, E>, original: Outcome<T, E>) {
        let target = self.myself.clone();
        let edge = Succ::Closure(Box::new(move |outcome: Outcome<T, E>| {
            let Some(core) = target.upgrade() else { return };
            match outcome {
                Ok(_) => core.settle_outcome(original),
                Err(fault) => core.settle_outcome(Err(fault)),
            }
        }));
        self.adopt(cleanup.core, edge);
    }

    /// Installs `pred` as this task's owned predecessor with the given
    /// downstream edge. The predecessor must be unconsumed: we become its
    /// unique consumer.
    #[track_caller]
    fn adopt<U, F>(&self, pred: Rc<Core<U, F>>, edge: Succ<U, F>)
    where
        U: Clone + 'static,
        F: Clone + fmt::Debug + 'static,
    {
        pred.consume();
        *pred.successor.borrow_mut() = Some(edge);
        *self.predecessor.borrow_mut() = Some(pred.clone() as Rc<dyn Upstream>);
        if pred.state.is_settled() {
            pred.schedule();
        }
    }

    /// Cancelation. Mid-mapper calls return silently (the mapper finishes
    /// first), repeats are no-ops. The pending case settles with the
    /// sentinel; afterwards the finalizer, the saved predecessor, and any
    /// predecessor freshly attached by the settle itself are each torn down,
    /// with drop guards so a panic in one cannot skip the others.
    pub(crate) fn cancel(&self) {
        if let CancelAction::Ignore = self.state.begin_cancel() {
            tracing::trace!(state = ?self.state, "Task::cancel ignored");
            return;
        }
        tracing::trace!(settled = self.state.is_settled(), "Task::cancel");

        let saved = self.predecessor.borrow_mut().take();
        let _cleanup = CancelGuard { core: self, saved };

        if !self.state.is_settled() {
            self.settle_outcome(Err(Fault::Canceled));
        }
        // A cancelation is not an unhandled rejection.
        self.state.clear_pending_rejection();
    }

    /// Delivers the settled outcome: successor first, then each weak branch
    /// in FIFO order, then the finalizer. A rejection nobody observed goes
    /// to the unhandled-rejection hook.
    fn finish(&self) {
        if !self.state.is_settled() {
            return;
        }
        let outcome = self
            .value
            .borrow()
            .clone()
            .expect("settled task must have a value, this is a bug!");

        let succ = self.successor.borrow_mut().take();
        if let Some(succ) = succ {
            self.state.clear_pending_rejection();
            match succ {
                Succ::Chain(target) => {
                    if let Some(core) = target.upgrade() {
                        core.settle_outcome(outcome.clone());
                    }
                }
                Succ::Closure(forward) => forward(outcome.clone()),
            }
        }

        loop {
            let branch = self.branches.borrow_mut().shift();
            let Some(branch) = branch else { break };
            branch.settle_outcome(outcome.clone());
        }

        let finalizer = self.finalizer.borrow_mut().take();
        if let Some(finalizer) = finalizer {
            finalizer(&outcome);
        }

        if self.state.pending_rejection() {
            self.state.clear_pending_rejection();
            if let Err(fault) = &outcome {
                tracing::trace!(?fault, "unhandled rejection");
                (crate::rejection_hook())(fault);
            }
        }
    }

    fn schedule(&self) {
        let this = self
            .myself
            .upgrade()
            .expect("task cell is gone while in use, this is a bug!");
        self.scheduler.schedule(this as Rc<dyn Flush>);
    }

    /// Claims this task for its unique consumer.
    #[track_caller]
    fn consume(&self) {
        match self.state.try_consume() {
            ConsumeAction::Consume => {}
            ConsumeAction::Refuse => {
                panic!("task is already consumed; a task has exactly one consumer")
            }
        }
    }

    #[track_caller]
    fn assert_not_self(&self, other: *const ()) {
        assert!(
            !std::ptr::eq(other, std::ptr::from_ref(self).cast()),
            "cannot settle a task with itself"
        );
    }

    pub(crate) fn set_finalizer(&self, finalizer: Finalizer<T, E>) {
        let prev = self.finalizer.borrow_mut().replace(finalizer);
        debug_assert!(prev.is_none(), "finalizer slot is already occupied");
    }

    /// Installs an *observing* finalizer: unlike a plain cleanup finalizer,
    /// it counts as a consumer of the outcome, so a rejection it sees is not
    /// also reported as unhandled. Combinators and adapters attach through
    /// this.
    pub(crate) fn observe(&self, callback: Finalizer<T, E>) {
        let target = self.myself.clone();
        self.set_finalizer(Box::new(move |outcome| {
            if let Some(core) = target.upgrade() {
                core.state.clear_pending_rejection();
            }
            callback(outcome);
        }));
    }

    pub(crate) fn has_finalizer(&self) -> bool {
        self.finalizer.borrow().is_some()
    }

    /// Consumes a settled task and clones its outcome out, for combinator
    /// intake of inputs that settled before the combinator ran.
    #[track_caller]
    pub(crate) fn extract(&self) -> Outcome<T, E> {
        self.consume();
        self.value
            .borrow()
            .clone()
            .expect("extract requires a settled task, this is a bug!")
    }
}

impl<T, E> Upstream for Core<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    fn cancel(&self) {
        Core::cancel(self);
    }
}

impl<T, E> Flush for Core<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    fn flush(&self) {
        self.finish();
    }
}

/// Clears the mapping flag even if the mapper panics, so the task is not
/// wedged into ignoring every future settle.
struct MappingGuard<'a> {
    state: &'a State,
}

impl<'a> MappingGuard<'a> {
    fn new(state: &'a State) -> Self {
        state.begin_mapping();
        Self { state }
    }
}

impl Drop for MappingGuard<'_> {
    fn drop(&mut self) {
        self.state.end_mapping();
    }
}

/// Runs cancelation steps 2-4 (finalizer, saved predecessor, fresh
/// predecessor) as nested drop guards: each step runs even if an earlier one
/// panics.
struct CancelGuard<'a, T: Clone, E: Clone> {
    core: &'a Core<T, E>,
    saved: Option<Rc<dyn Upstream>>,
}

impl<T: Clone, E: Clone> Drop for CancelGuard<'_, T, E> {
    fn drop(&mut self) {
        let _preds = PredGuard {
            core: self.core,
            saved: self.saved.take(),
        };
        let finalizer = self.core.finalizer.borrow_mut().take();
        if let Some(finalizer) = finalizer {
            // The settle above normally leaves an outcome; a mapper that
            // re-suspended the task (flattening) leaves it pending, in which
            // case the finalizer observes the sentinel.
            let outcome = self
                .core
                .value
                .borrow()
                .clone()
                .unwrap_or(Err(Fault::Canceled));
            finalizer(&outcome);
        }
    }
}

struct PredGuard<'a, T, E> {
    core: &'a Core<T, E>,
    saved: Option<Rc<dyn Upstream>>,
}

impl<T, E> Drop for PredGuard<'_, T, E> {
    fn drop(&mut self) {
        let _fresh = FreshGuard(self.core.predecessor.borrow_mut().take());
        if let Some(saved) = self.saved.take() {
            saved.cancel();
        }
    }
}

struct FreshGuard(Option<Rc<dyn Upstream>>);

impl Drop for FreshGuard {
    fn drop(&mut self) {
        if let Some(pred) = self.0.take() {
            pred.cancel();
        }
    }
}

// === impl Mapper ===

impl<T, E> Mapper<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    fn apply(self, outcome: Outcome<T, E>) -> Mapped<T, E> {
        match self {
            Mapper::Full(f) => f(outcome).into_mapped(),
            Mapper::MapOk(f) => match outcome {
                Ok(value) => f(value).into_mapped(),
                Err(fault) => Mapped::Outcome(Err(fault)),
            },
            Mapper::MapErr(f) => match outcome {
                Ok(value) => Mapped::Outcome(Ok(value)),
                Err(fault) => f(fault).into_mapped(),
            },
            Mapper::Finally(f) => match f(&outcome) {
                Ok(None) => Mapped::Outcome(outcome),
                Ok(Some(cleanup)) => Mapped::Wait {
                    cleanup,
                    original: outcome,
                },
                Err(error) => Mapped::Outcome(Err(Fault::Failed(error))),
            },
            Mapper::Tap(f) => {
                f(&outcome);
                Mapped::Outcome(outcome)
            }
        }
    }
}

impl<T, E> Settle<T, E> {
    fn into_mapped(self) -> Mapped<T, E> {
        match self {
            Settle::Ok(value) => Mapped::Outcome(Ok(value)),
            Settle::Err(error) => Mapped::Outcome(Err(Fault::Failed(error))),
            Settle::OkTask(task) => Mapped::OkTask(task),
            Settle::ErrTask(task) => Mapped::ErrTask(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tracing_subscriber::util::SubscriberInitExt;

    fn tick() {
        Scheduler::current().tick();
    }

    /// Replaces the rejection hook with one that records instead of
    /// panicking, returning the record.
    fn quiet_rejections() -> Rc<RefCell<Vec<String>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        crate::set_rejection_hook(move |fault| sink.borrow_mut().push(format!("{fault:?}")));
        log
    }

    #[test]
    fn basic_chain() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .set_default();

        let task = Task::<String, String>::ok("one".to_string())
            .map_ok(|r| Settle::Ok(r + " two"))
            .map_ok(|r| Settle::Err(r + " three"))
            .map_err(|e| match e {
                Fault::Failed(e) => Settle::Ok(e + " four"),
                Fault::Canceled => Settle::Err("canceled".to_string()),
            });

        assert!(task.is_pending());
        tick();
        assert_eq!(task.peek(), Some(Ok("one two three four".to_string())));
    }

    #[test]
    fn map_returns_before_mapper_runs() {
        let ran = Rc::new(Cell::new(false));
        let witness = ran.clone();
        let task = Task::<u32, String>::ok(1).map_ok(move |v| {
            witness.set(true);
            Settle::Ok(v + 1)
        });

        // The mapper only runs on the scheduler drain, never inside `map`.
        assert!(!ran.get());
        tick();
        assert!(ran.get());
        assert_eq!(task.peek(), Some(Ok(2)));
    }

    #[test]
    fn settle_is_at_most_once() {
        let task = Task::<u32, String>::new();
        task.settle(Settle::Ok(1));
        task.settle(Settle::Ok(2));
        task.settle(Settle::Err("late".to_string()));

        tick();
        assert_eq!(task.peek(), Some(Ok(1)));
        assert!(!task.is_failed());
    }

    #[test]
    fn recovered_error_lands_in_the_success_slot() {
        let task = Task::<String, String>::err("boom".to_string()).map_err(|fault| {
            Settle::Ok(fault.failed().unwrap_or_else(|| "canceled".to_string()))
        });

        tick();
        assert_eq!(task.peek(), Some(Ok("boom".to_string())));
    }

    #[test]
    #[should_panic(expected = "cannot settle a task with itself")]
    fn settling_with_itself_panics() {
        let task = Task::<u32, String>::new();
        task.settle(Settle::OkTask(task.clone()));
    }

    #[test]
    #[should_panic(expected = "already consumed")]
    fn mapping_twice_panics() {
        let task = Task::<u32, String>::new();
        assert!(!task.is_consumed());
        let _first = task.clone().map_ok(|v| Settle::Ok(v));
        assert!(task.is_consumed());
        let _second = task.map_ok(|v| Settle::Ok(v));
    }

    #[test]
    fn flattening_result_slot() {
        let task = Task::<u32, String>::settled(Settle::OkTask(Task::ok(7)));
        tick();
        assert_eq!(task.peek(), Some(Ok(7)));
    }

    #[test]
    fn flattening_error_slot_rethrows_success() {
        let _quiet = quiet_rejections();
        let task =
            Task::<u32, String>::settled(Settle::ErrTask(Task::ok("oops".to_string())));
        tick();
        assert_eq!(task.peek(), Some(Err(Fault::Failed("oops".to_string()))));
    }

    #[test]
    fn flattening_error_slot_rethrows_error() {
        let _quiet = quiet_rejections();
        let task =
            Task::<u32, String>::settled(Settle::ErrTask(Task::err("bad".to_string())));
        tick();
        assert_eq!(task.peek(), Some(Err(Fault::Failed("bad".to_string()))));
    }

    #[test]
    fn flattening_pending_task_settles_later() {
        let inner = Task::<u32, String>::new();
        let outer = Task::<u32, String>::settled(Settle::OkTask(inner.clone()));

        tick();
        assert!(outer.is_pending());

        inner.settle(Settle::Ok(42));
        tick();
        assert_eq!(outer.peek(), Some(Ok(42)));
    }

    #[test]
    fn mapper_returning_task_flattens() {
        let task = Task::<u32, String>::ok(1).map_ok(|v| Settle::OkTask(Task::ok(v + 10)));
        tick();
        assert_eq!(task.peek(), Some(Ok(11)));
    }

    #[test]
    fn reentrant_settle_inside_mapper_is_dropped() {
        let slot: Rc<RefCell<Option<Task<u32, String>>>> = Rc::new(RefCell::new(None));
        let captured = slot.clone();

        let mapped = Task::<u32, String>::ok(1).map(move |outcome| {
            // Settling our own task mid-mapper must be ignored.
            let this = captured.borrow().clone().unwrap();
            this.settle(Settle::Ok(999));
            match outcome {
                Ok(v) => Settle::Ok(v + 1),
                Err(_) => Settle::Err("fault".to_string()),
            }
        });
        *slot.borrow_mut() = Some(mapped.clone());

        tick();
        assert_eq!(mapped.peek(), Some(Ok(2)));
    }

    #[test]
    fn upstream_cancel_runs_cleanup_synchronously() {
        let timer_cleared = Rc::new(Cell::new(false));
        let cleared = timer_cleared.clone();

        let producer = Task::<String, String>::init(move |_task| {
            Some(Box::new(move || cleared.set(true)) as Cleanup)
        });
        let observed = Rc::new(Cell::new(0_u32));
        let seen = observed.clone();
        let descendant = producer
            .map_ok(|v| Settle::Ok(v + "!"))
            .map_ok(|v| Settle::Ok(v + "!"))
            .map_err(move |fault| {
                seen.set(seen.get() + 1);
                match fault {
                    Fault::Canceled => Settle::Err("canceled".to_string()),
                    Fault::Failed(e) => Settle::Err(e),
                }
            });

        descendant.cancel();
        // Upstream teardown happened before `cancel` returned.
        assert!(timer_cleared.get());

        tick();
        // The descendant observed the cancelation exactly once, as a
        // catchable fault.
        assert_eq!(observed.get(), 1);
        assert_eq!(
            descendant.peek(),
            Some(Err(Fault::Failed("canceled".to_string())))
        );
    }

    #[test]
    fn cancel_is_idempotent() {
        let count = Rc::new(Cell::new(0_u32));
        let n = count.clone();
        let task = Task::<u32, String>::init(move |_| {
            Some(Box::new(move || n.set(n.get() + 1)) as Cleanup)
        });

        task.cancel();
        task.cancel();
        tick();
        task.cancel();

        assert_eq!(count.get(), 1);
        assert!(task.is_canceled());
        assert_eq!(task.peek(), Some(Err(Fault::Canceled)));
    }

    #[test]
    fn cancel_of_settled_task_keeps_value() {
        let task = Task::<u32, String>::ok(5);
        tick();
        task.cancel();
        assert_eq!(task.peek(), Some(Ok(5)));
        assert!(task.is_canceled());
    }

    #[test]
    fn weak_branches_observe_without_owning() {
        let parent = Task::<u32, String>::new();
        let b1 = parent.branch();
        let b2 = parent.branch();

        parent.settle(Settle::Ok(42));
        tick();
        assert_eq!(b1.peek(), Some(Ok(42)));
        assert_eq!(b2.peek(), Some(Ok(42)));

        // Canceling a branch is local to it.
        b1.cancel();
        assert_eq!(parent.peek(), Some(Ok(42)));
        assert_eq!(b2.peek(), Some(Ok(42)));
    }

    #[test]
    fn late_branch_on_settled_parent() {
        let parent = Task::<u32, String>::ok(9);
        tick();

        let branch = parent.branch();
        assert!(branch.is_pending());
        tick();
        assert_eq!(branch.peek(), Some(Ok(9)));
    }

    #[test]
    fn branch_cannot_prevent_unhandled_rejection() {
        let log = quiet_rejections();
        let parent = Task::<u32, String>::err("boom".to_string());
        let branch = parent.branch();

        tick();
        assert_eq!(branch.peek(), Some(Err(Fault::Failed("boom".to_string()))));
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn unhandled_rejection_fires_once() {
        let log = quiet_rejections();
        let task = Task::<u32, String>::err("boom".to_string());
        assert!(task.is_failed());

        tick();
        tick();
        drop(task);
        assert_eq!(*log.borrow(), ["Failed(\"boom\")"]);
    }

    #[test]
    fn mapped_rejection_is_handled() {
        let log = quiet_rejections();
        let task = Task::<u32, String>::err("boom".to_string()).map_err(|_| Settle::Ok(0));

        tick();
        assert_eq!(task.peek(), Some(Ok(0)));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn finally_passes_outcome_through() {
        let ran = Rc::new(Cell::new(false));
        let witness = ran.clone();
        let task = Task::<u32, String>::ok(3).finally(move |_| {
            witness.set(true);
            Ok(None)
        });

        tick();
        assert!(ran.get());
        assert_eq!(task.peek(), Some(Ok(3)));
    }

    #[test]
    fn finally_waits_for_cleanup_task() {
        let cleanup = Task::<u32, String>::new();
        let inner = cleanup.clone();
        let task = Task::<u32, String>::ok(3).finally(move |_| Ok(Some(inner.clone())));

        tick();
        assert!(task.is_pending());

        cleanup.settle(Settle::Ok(0));
        tick();
        // The cleanup value is discarded; the original outcome stands.
        assert_eq!(task.peek(), Some(Ok(3)));
    }

    #[test]
    fn finally_error_replaces_outcome() {
        let _quiet = quiet_rejections();
        let task =
            Task::<u32, String>::ok(3).finally(|_| Err("cleanup failed".to_string()));

        tick();
        assert_eq!(
            task.peek(),
            Some(Err(Fault::Failed("cleanup failed".to_string())))
        );
    }

    #[test]
    fn init_deferred_runs_on_drain() {
        let ran = Rc::new(Cell::new(false));
        let witness = ran.clone();
        let task = Task::<u32, String>::init_deferred(move |task| {
            witness.set(true);
            task.settle(Settle::Ok(1));
            None
        });

        assert!(!ran.get());
        tick();
        assert!(ran.get());
        tick();
        assert_eq!(task.peek(), Some(Ok(1)));
    }

    #[test]
    fn chains_on_distinct_schedulers() {
        let sched = Scheduler::manual();
        let task = Task::<u32, String>::new_in(&sched);
        let mapped = task.clone().map_ok(|v| Settle::Ok(v * 2));

        task.settle(Settle::Ok(21));
        // The default scheduler knows nothing about this chain.
        tick();
        assert!(mapped.is_pending());

        sched.tick();
        assert_eq!(mapped.peek(), Some(Ok(42)));
    }
}
