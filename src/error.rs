// Copyright 2026 the strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;

/// The error channel of a task.
///
/// A settled task is either a success carrying its payload, or a `Fault`:
/// a user error put there by [`settle`][crate::Task::settle] or a throwing
/// mapper, or the synthetic cancelation sentinel written when a still-pending
/// task is [canceled][crate::Task::cancel].
///
/// The sentinel is a distinct variant rather than a magic error value so
/// downstream consumers can reliably tell cancelation apart from failure,
/// catch it with [`map_err`][crate::Task::map_err], or let it propagate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Fault<E> {
    /// A user error, propagated downstream unchanged.
    Failed(E),
    /// The task was canceled while still pending.
    Canceled,
}

impl<E> Fault<E> {
    /// Returns `true` if this fault is the cancelation sentinel.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Fault::Canceled)
    }

    /// Returns the user error, if this fault is one.
    pub fn failed(self) -> Option<E> {
        match self {
            Fault::Failed(e) => Some(e),
            Fault::Canceled => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for Fault<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Failed(e) => write!(f, "task failed: {e}"),
            Fault::Canceled => f.write_str("task canceled"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Fault<E> {}

/// The outcome of a settled task: the success payload or a [`Fault`].
pub type Outcome<T, E> = Result<T, Fault<E>>;
