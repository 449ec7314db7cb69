// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The event dispatcher for the test runner.
//!
//! This module sits between the executor and the listeners: it stamps each
//! event with a timestamp and the elapsed run time, fans it out to every
//! listener in registration order on the worker thread, and keeps the run's
//! statistics.

use crate::catalog::{Test, TestPlan};
use crate::errors::DispatchError;
use crate::reporter::events::{
    CaseId, CaseResult, EventListener, RunFinish, RunId, RunOutcome, RunStart, RunStats, SuiteId,
    SuiteResult, TestEvent, TestEventKind, TestStatus,
};
use crate::stopwatch::StopwatchStart;
use crate::test_output::OutputChunk;
use chrono::Local;
use debug_ignore::DebugIgnore;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub(crate) struct EventDispatcher<'a> {
    listeners: DebugIgnore<Vec<&'a mut dyn EventListener>>,
    run_id: RunId,
    stopwatch: StopwatchStart,
    stats: RunStats,
    finished: bool,
}

impl<'a> EventDispatcher<'a> {
    pub(crate) fn new(listeners: Vec<&'a mut dyn EventListener>, run_id: RunId) -> Self {
        Self {
            listeners: DebugIgnore(listeners),
            run_id,
            stopwatch: crate::stopwatch::stopwatch(),
            stats: RunStats::default(),
            finished: false,
        }
    }

    fn dispatch(&mut self, kind: TestEventKind) -> Result<(), DispatchError> {
        let event = TestEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: self.stopwatch.snapshot().duration,
            kind,
        };
        for listener in self.listeners.iter_mut() {
            listener
                .handle_event(&event)
                .map_err(|source| DispatchError {
                    event: event.kind.name(),
                    source,
                })?;
        }
        Ok(())
    }

    pub(crate) fn run_started(&mut self, plan: &TestPlan) -> Result<(), DispatchError> {
        self.stats.initial_run_count = plan.case_count();
        self.dispatch(TestEventKind::RunStarted(RunStart {
            run_id: self.run_id,
            test_count: plan.case_count(),
        }))
    }

    pub(crate) fn suite_started(&mut self, suite: &Test) -> Result<(), DispatchError> {
        self.dispatch(TestEventKind::SuiteStarted(suite_id(suite)))
    }

    pub(crate) fn test_started(&mut self, case: &Test) -> Result<(), DispatchError> {
        self.dispatch(TestEventKind::TestStarted(case_id(case)))
    }

    pub(crate) fn test_output(&mut self, case: &Test, chunk: OutputChunk) -> Result<(), DispatchError> {
        self.dispatch(TestEventKind::TestOutput {
            case: case_id(case),
            chunk,
        })
    }

    pub(crate) fn test_finished(
        &mut self,
        case: &Test,
        status: TestStatus,
        duration: Duration,
        message: Option<String>,
    ) -> Result<(), DispatchError> {
        let result = CaseResult {
            case: case_id(case),
            status,
            duration,
            message,
        };
        self.stats.on_case_finished(&result);
        self.dispatch(TestEventKind::TestFinished(result))
    }

    pub(crate) fn suite_finished(
        &mut self,
        suite: &Test,
        status: TestStatus,
        duration: Duration,
    ) -> Result<(), DispatchError> {
        self.dispatch(TestEventKind::SuiteFinished(SuiteResult {
            suite: suite_id(suite),
            status,
            duration,
        }))
    }

    /// Counts cases that were cancelled before they started. They get no
    /// individual events.
    pub(crate) fn mark_cancelled(&mut self, count: usize) {
        if count > 0 {
            debug!(count, "marking unstarted tests as cancelled");
            self.stats.on_cases_cancelled(count);
        }
    }

    /// Emits the terminal event, exactly once; later calls are no-ops.
    ///
    /// Listener errors are only logged here: the run is over, and the
    /// outcome may itself be reporting a listener failure.
    pub(crate) fn run_finished(&mut self, outcome: RunOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        let snapshot = self.stopwatch.snapshot();
        let finish = RunFinish {
            run_id: self.run_id,
            start_time: snapshot.start_time.fixed_offset(),
            elapsed: snapshot.duration,
            outcome,
            stats: self.stats,
        };
        if let Err(error) = self.dispatch(TestEventKind::RunFinished(finish)) {
            debug!(%error, "listener failed while handling the terminal event");
        }
    }

    pub(crate) fn run_stats(&self) -> RunStats {
        self.stats
    }
}

fn suite_id(node: &Test) -> SuiteId {
    SuiteId {
        full_name: node.full_name().to_owned(),
        kind: node.kind(),
    }
}

fn case_id(node: &Test) -> CaseId {
    CaseId {
        full_name: node.full_name().to_owned(),
    }
}
