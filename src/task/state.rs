// Copyright 2026 the strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::Cell;
use std::fmt;

bitflags::bitflags! {
    /// A snapshot of a task's current state.
    ///
    /// The lifecycle is `SETTLED` (with `FAILED` selecting the error arm);
    /// a task without `SETTLED` is pending. The remaining bits are
    /// independent bookkeeping flags:
    ///
    /// - `PENDING_REJECTION`: the task entered the error arm and no consumer
    ///   has observed the outcome yet. Cleared when the successor or the
    ///   finalizer is notified, when the task is consumed, or when it is
    ///   canceled. If still set once the notification flush (or the task's
    ///   drop) runs, the unhandled-rejection hook fires.
    /// - `CONSUMED`: the task has its unique downstream consumer and may not
    ///   be mapped again.
    /// - `MAPPING`: the task's mapper is on the call stack right now. While
    ///   set, nested `settle` calls are dropped and `cancel` returns
    ///   silently; without this guard a mapper that settles its own task
    ///   would recurse forever.
    /// - `CANCELED`: `cancel` ran to completion once; repeats are no-ops.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Snapshot: u8 {
        const SETTLED           = 1 << 0;
        const FAILED            = 1 << 1;
        const PENDING_REJECTION = 1 << 2;
        const CONSUMED          = 1 << 3;
        const MAPPING           = 1 << 4;
        const CANCELED          = 1 << 5;
    }
}

/// Task state, stored in a single interior-mutable byte.
///
/// All transitions go through the methods below; the returned action enums
/// tell the caller what to do with the task, keeping the decision logic in
/// one place.
pub(crate) struct State {
    val: Cell<Snapshot>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub(crate) enum SettleAction {
    /// The task is pending and not mid-mapper; proceed with settling.
    Proceed,
    /// The task is already settled or its mapper is running; drop the call.
    Ignore,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub(crate) enum CancelAction {
    /// First cancelation of a task that is not mid-mapper; run the full
    /// cancelation protocol.
    Proceed,
    /// Already canceled, or a mapper is running; return silently.
    Ignore,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub(crate) enum ConsumeAction {
    /// The caller is now the task's unique consumer.
    Consume,
    /// The task already has a consumer.
    Refuse,
}

// === impl State ===

impl State {
    pub(crate) const fn new() -> Self {
        Self {
            val: Cell::new(Snapshot::empty()),
        }
    }

    pub(crate) fn load(&self) -> Snapshot {
        self.val.get()
    }

    fn set(&self, flag: Snapshot, on: bool) {
        let mut s = self.val.get();
        s.set(flag, on);
        self.val.set(s);
    }

    /// Gate for `settle`: refuses settled and mid-mapper tasks.
    pub(crate) fn begin_settle(&self) -> SettleAction {
        let s = self.load();
        if s.intersects(Snapshot::SETTLED | Snapshot::MAPPING) {
            SettleAction::Ignore
        } else {
            SettleAction::Proceed
        }
    }

    /// Gate for `cancel`: refuses repeat cancelations and mid-mapper tasks,
    /// marking the task canceled when it proceeds.
    pub(crate) fn begin_cancel(&self) -> CancelAction {
        let s = self.load();
        if s.intersects(Snapshot::CANCELED | Snapshot::MAPPING) {
            CancelAction::Ignore
        } else {
            self.set(Snapshot::CANCELED, true);
            CancelAction::Proceed
        }
    }

    /// Claims the task for its unique consumer, clearing any pending
    /// rejection (the consumer will observe the outcome).
    pub(crate) fn try_consume(&self) -> ConsumeAction {
        let s = self.load();
        if s.contains(Snapshot::CONSUMED) {
            ConsumeAction::Refuse
        } else {
            self.val.set(
                (s | Snapshot::CONSUMED) - Snapshot::PENDING_REJECTION,
            );
            ConsumeAction::Consume
        }
    }

    /// Transitions out of pending. A failed commit raises the pending
    /// rejection, to be lowered by whichever consumer observes it first.
    pub(crate) fn commit(&self, failed: bool) {
        debug_assert!(
            !self.load().contains(Snapshot::SETTLED),
            "a task may only be settled once"
        );
        let mut s = self.load() | Snapshot::SETTLED;
        if failed {
            s |= Snapshot::FAILED | Snapshot::PENDING_REJECTION;
        }
        self.val.set(s);
    }

    pub(crate) fn begin_mapping(&self) {
        debug_assert!(!self.load().contains(Snapshot::MAPPING));
        self.set(Snapshot::MAPPING, true);
    }

    pub(crate) fn end_mapping(&self) {
        debug_assert!(self.load().contains(Snapshot::MAPPING));
        self.set(Snapshot::MAPPING, false);
    }

    pub(crate) fn clear_pending_rejection(&self) {
        self.set(Snapshot::PENDING_REJECTION, false);
    }

    pub(crate) fn pending_rejection(&self) -> bool {
        self.load().contains(Snapshot::PENDING_REJECTION)
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.load().contains(Snapshot::SETTLED)
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.load().contains(Snapshot::FAILED)
    }

    pub(crate) fn is_consumed(&self) -> bool {
        self.load().contains(Snapshot::CONSUMED)
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.load().contains(Snapshot::CANCELED)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}
