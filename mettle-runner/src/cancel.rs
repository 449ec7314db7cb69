// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run-state tracking and the cross-thread cancellation primitive.

use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;

/// Lifecycle state of a [`TestRunner`](crate::runner::TestRunner)'s run slot.
///
/// Exactly one non-idle run may exist per runner at a time. The state moves
/// Idle → Running → CancelRequested → Terminating → Idle; a run that is
/// never cancelled goes straight from Running back to Idle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RunState {
    /// No run is in progress.
    Idle,
    /// A run is executing.
    Running,
    /// Cancellation has been requested but forced termination has not begun.
    CancelRequested,
    /// The in-flight test process is being forcibly stopped.
    Terminating,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const CANCEL_REQUESTED: u8 = 2;
const TERMINATING: u8 = 3;

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            IDLE => RunState::Idle,
            RUNNING => RunState::Running,
            CANCEL_REQUESTED => RunState::CancelRequested,
            TERMINATING => RunState::Terminating,
            _ => unreachable!("invalid run state {value}"),
        }
    }
}

/// The cancellation controller: an atomic [`RunState`] plus a wakeup for the
/// worker.
///
/// This is the only mutable state shared across threads. `request_cancel` is
/// callable from any thread at any time; the worker observes it either by
/// polling [`is_cancel_requested`](Self::is_cancel_requested) between cases
/// or by awaiting [`cancel_requested`](Self::cancel_requested) while a case
/// is in flight.
#[derive(Debug)]
pub(crate) struct CancellationController {
    state: AtomicU8,
    cancel_notify: Notify,
}

impl CancellationController {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            cancel_notify: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Idle → Running. Returns false if a run is already active.
    pub(crate) fn try_begin_run(&self) -> bool {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Running → CancelRequested, waking the worker. A no-op in every other
    /// state, which makes repeated calls (and calls with nothing to cancel)
    /// idempotent.
    pub(crate) fn request_cancel(&self) -> bool {
        let requested = self
            .state
            .compare_exchange(
                RUNNING,
                CANCEL_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if requested {
            // notify_one stores a permit if the worker isn't waiting yet, so
            // the wakeup cannot be lost.
            self.cancel_notify.notify_one();
        }
        requested
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        matches!(
            self.state(),
            RunState::CancelRequested | RunState::Terminating
        )
    }

    /// Resolves once cancellation has been requested; pends forever
    /// otherwise. Stale permits from a previous run are absorbed by the
    /// state check.
    pub(crate) async fn cancel_requested(&self) {
        loop {
            let notified = self.cancel_notify.notified();
            if self.is_cancel_requested() {
                return;
            }
            notified.await;
        }
    }

    /// CancelRequested → Terminating. Called by the worker as forced
    /// termination of the in-flight test process begins.
    pub(crate) fn begin_terminating(&self) {
        let _ = self.state.compare_exchange(
            CANCEL_REQUESTED,
            TERMINATING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Back to Idle, whatever came before. The run is over.
    pub(crate) fn finish_run(&self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn only_one_run_can_begin() {
        let controller = CancellationController::new();
        assert!(controller.try_begin_run());
        assert!(!controller.try_begin_run());
        controller.finish_run();
        assert!(controller.try_begin_run());
    }

    #[test]
    fn cancel_is_a_noop_when_idle() {
        let controller = CancellationController::new();
        assert!(!controller.request_cancel());
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[test]
    fn cancel_transitions_exactly_once() {
        let controller = CancellationController::new();
        controller.try_begin_run();
        assert!(controller.request_cancel());
        assert!(!controller.request_cancel());
        assert_eq!(controller.state(), RunState::CancelRequested);

        controller.begin_terminating();
        assert_eq!(controller.state(), RunState::Terminating);
        assert!(!controller.request_cancel());

        controller.finish_run();
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn cancel_wakes_a_waiting_worker() {
        let controller = Arc::new(CancellationController::new());
        controller.try_begin_run();

        let waiter = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.cancel_requested().await }
        });

        // Give the waiter a chance to park first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.request_cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke within the timeout")
            .expect("waiter task did not panic");
    }

    #[tokio::test]
    async fn cancel_before_wait_resolves_immediately() {
        let controller = CancellationController::new();
        controller.try_begin_run();
        controller.request_cancel();

        tokio::time::timeout(Duration::from_secs(1), controller.cancel_requested())
            .await
            .expect("request observed without waiting");
    }
}
