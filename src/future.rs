// Copyright 2026 the strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Adapters between tasks and host futures, thin layers over the task
//! contracts: `.await` a task, or complete one from a future.

use crate::error::Outcome;
use crate::task::{Settle, Task};
use pin_project::pin_project;
use std::cell::RefCell;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// A [`Task`] viewed as a [`Future`]; created by awaiting the task.
///
/// Dropping the future before it resolves cancels the task, so abandoning
/// an `.await` (a select arm losing, a scope unwinding) releases the
/// producers upstream.
pub struct TaskFuture<T: Clone + 'static, E: Clone + fmt::Debug + 'static> {
    inner: Task<T, E>,
    waker: Rc<RefCell<Option<Waker>>>,
}

impl<T, E> IntoFuture for Task<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    type Output = Outcome<T, E>;
    type IntoFuture = TaskFuture<T, E>;

    /// Consumes the task; the future is its unique consumer.
    fn into_future(self) -> TaskFuture<T, E> {
        let waker: Rc<RefCell<Option<Waker>>> = Rc::new(RefCell::new(None));
        let inner = self.tap(Box::new(|_| {}));
        let slot = waker.clone();
        inner.core.observe(Box::new(move |_| {
            if let Some(waker) = slot.borrow_mut().take() {
                waker.wake();
            }
        }));
        TaskFuture { inner, waker }
    }
}

// === impl TaskFuture ===

impl<T, E> Future for TaskFuture<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    type Output = Outcome<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.inner.peek() {
            return Poll::Ready(outcome);
        }
        *this.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T: Clone + 'static, E: Clone + fmt::Debug + 'static> Drop for TaskFuture<T, E> {
    fn drop(&mut self) {
        self.inner.core.cancel();
    }
}

/// Drives a host future to completion and settles a task with its output.
/// Returned by [`Task::from_future`]; the host executor runs it.
#[pin_project]
pub struct Completion<F, T, E> {
    #[pin]
    future: F,
    task: Task<T, E>,
}

// === impl Completion ===

impl<F, T, E> Future for Completion<F, T, E>
where
    F: Future<Output = Result<T, E>>,
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if this.task.is_settled() {
            // Usually cancelation. The inner future stops being polled, but
            // work it already started elsewhere keeps running; futures have
            // no cancelation channel of their own.
            return Poll::Ready(());
        }
        match this.future.poll(cx) {
            Poll::Ready(Ok(value)) => {
                this.task.settle(Settle::Ok(value));
                Poll::Ready(())
            }
            Poll::Ready(Err(error)) => {
                this.task.settle(Settle::Err(error));
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> Task<T, E>
where
    T: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    /// Adapts a host future into a task.
    ///
    /// Returns the task and the [`Completion`] that feeds it; spawn the
    /// completion on the host executor. Canceling the task stops the
    /// completion from polling further but cannot abort work the future
    /// already delegated; drop the completion to release the future itself.
    pub fn from_future<F>(future: F) -> (Task<T, E>, Completion<F, T, E>)
    where
        F: Future<Output = Result<T, E>>,
    {
        let task = Task::new();
        let completion = Completion {
            future,
            task: task.clone(),
        };
        (task, completion)
    }
}
