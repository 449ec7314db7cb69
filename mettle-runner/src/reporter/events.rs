// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events emitted by the test runner, and the listener interface that
//! consumes them.
//!
//! Events are produced by a [`TestRunner`](crate::runner::TestRunner) and
//! delivered synchronously, in order, on the worker thread. The ordering
//! guarantees: `RunStarted` precedes everything; for each case,
//! `TestStarted` strictly precedes its `TestOutput` chunks, which strictly
//! precede its `TestFinished`; suite events bracket their descendants like
//! matched delimiters; `RunFinished` is last and occurs exactly once.

use crate::catalog::TestKind;
use crate::errors::ListenerError;
use crate::test_output::OutputChunk;
use chrono::{DateTime, FixedOffset};
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use std::fmt;
use std::time::Duration;

/// The typed-UUID kind for run identifiers.
pub enum RunKind {}

impl TypedUuidKind for RunKind {
    #[inline]
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("mettle-run");
        TAG
    }
}

/// A unique identifier for one test run.
pub type RunId = TypedUuid<RunKind>;

/// Identifies a test case in the event stream.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CaseId {
    /// The case's `::`-separated full name.
    pub full_name: String,
}

/// Identifies a suite or fixture node in the event stream.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SuiteId {
    /// The node's full name.
    pub full_name: String,
    /// Whether the node is a suite or a fixture.
    pub kind: TestKind,
}

/// The status of one executed test case, or the aggregate status of a suite.
///
/// Variants are ordered by severity, so the aggregate of a set of statuses
/// is their maximum.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TestStatus {
    /// The case ran to completion and passed.
    Success,
    /// The case was cancelled before or while running.
    Cancelled,
    /// The case signalled an assertion-style rejection (non-zero exit).
    Failure,
    /// The case could not be executed properly: spawn failure, death by an
    /// unexpected signal, or a broken pipe.
    Error,
}

impl TestStatus {
    /// True for [`TestStatus::Success`].
    pub fn is_success(self) -> bool {
        self == TestStatus::Success
    }

    pub(crate) fn combine(self, other: TestStatus) -> TestStatus {
        self.max(other)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TestStatus::Success => "passed",
            TestStatus::Cancelled => "cancelled",
            TestStatus::Failure => "failed",
            TestStatus::Error => "errored",
        };
        f.write_str(text)
    }
}

/// The result of executing one test case.
#[derive(Clone, Debug)]
pub struct CaseResult {
    /// The case this result belongs to.
    pub case: CaseId,
    /// How the case ended.
    pub status: TestStatus,
    /// How long the case took.
    pub duration: Duration,
    /// Failure or error detail, when there is any.
    pub message: Option<String>,
}

/// The aggregated result of a suite or fixture: the worst of its children.
#[derive(Clone, Debug)]
pub struct SuiteResult {
    /// The suite this result belongs to.
    pub suite: SuiteId,
    /// The aggregate status.
    pub status: TestStatus,
    /// Wall-clock time spent under this node.
    pub duration: Duration,
}

/// Payload of [`TestEventKind::RunStarted`].
#[derive(Clone, Debug)]
pub struct RunStart {
    /// The unique ID for this run.
    pub run_id: RunId,
    /// The number of cases the run will execute.
    pub test_count: usize,
}

/// How a run ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// Every selected case ran to completion. Individual cases may still
    /// have failed; see [`RunStats`].
    Completed,
    /// The run was cancelled before every case completed.
    Cancelled,
    /// An infrastructure failure (listener or capture) aborted the run.
    Error {
        /// The rendered failure, source chain included.
        message: String,
    },
}

impl RunOutcome {
    /// True for [`RunOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Payload of [`TestEventKind::RunFinished`].
#[derive(Clone, Debug)]
pub struct RunFinish {
    /// The unique ID for this run.
    pub run_id: RunId,
    /// The time at which the run started.
    pub start_time: DateTime<FixedOffset>,
    /// The amount of time the run took.
    pub elapsed: Duration,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Statistics for the run.
    pub stats: RunStats,
}

/// Statistics for a test run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The total number of cases that were expected to run at the beginning.
    ///
    /// If the run is cancelled, this will be more than `finished_count` at
    /// the end.
    pub initial_run_count: usize,

    /// The number of cases that finished, including the in-flight case of a
    /// cancelled run.
    pub finished_count: usize,

    /// The number of cases that passed.
    pub passed: usize,

    /// The number of cases that failed.
    pub failed: usize,

    /// The number of cases that encountered an execution error.
    pub errored: usize,

    /// The number of cases that were cancelled, started or not.
    pub cancelled: usize,
}

impl RunStats {
    /// True if every expected case ran and passed.
    pub fn is_success(&self) -> bool {
        if self.initial_run_count > self.finished_count {
            return false;
        }
        !self.any_failed() && self.cancelled == 0
    }

    /// True if any case failed or errored.
    pub fn any_failed(&self) -> bool {
        self.failed > 0 || self.errored > 0
    }

    pub(crate) fn on_case_finished(&mut self, result: &CaseResult) {
        self.finished_count += 1;
        match result.status {
            TestStatus::Success => self.passed += 1,
            TestStatus::Failure => self.failed += 1,
            TestStatus::Error => self.errored += 1,
            TestStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub(crate) fn on_cases_cancelled(&mut self, count: usize) {
        self.cancelled += count;
    }
}

/// A test event.
///
/// Events carry the wall-clock timestamp at which they were generated and
/// the elapsed time since the start of the run, along with the kind-specific
/// payload.
#[derive(Clone, Debug)]
pub struct TestEvent {
    /// The time at which the event was generated, including the offset from
    /// UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The amount of time elapsed since the start of the test run.
    pub elapsed: Duration,

    /// The kind of test event this is.
    pub kind: TestEventKind,
}

/// The kind of test event this is.
///
/// Forms part of [`TestEvent`]. This is the complete set: listeners never
/// see anything else.
#[derive(Clone, Debug)]
pub enum TestEventKind {
    /// The test run started.
    RunStarted(RunStart),
    /// A suite or fixture was entered.
    SuiteStarted(SuiteId),
    /// A case started running.
    TestStarted(CaseId),
    /// A case produced a chunk of output.
    TestOutput {
        /// The case the chunk belongs to.
        case: CaseId,
        /// The captured chunk.
        chunk: OutputChunk,
    },
    /// A case finished running.
    TestFinished(CaseResult),
    /// A suite or fixture was left, all of its children finished.
    SuiteFinished(SuiteResult),
    /// The test run finished. Always the last event, always exactly once.
    RunFinished(RunFinish),
}

impl TestEventKind {
    /// The event's name, as used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            TestEventKind::RunStarted(_) => "RunStarted",
            TestEventKind::SuiteStarted(_) => "SuiteStarted",
            TestEventKind::TestStarted(_) => "TestStarted",
            TestEventKind::TestOutput { .. } => "TestOutput",
            TestEventKind::TestFinished(_) => "TestFinished",
            TestEventKind::SuiteFinished(_) => "SuiteFinished",
            TestEventKind::RunFinished(_) => "RunFinished",
        }
    }
}

/// An external consumer of the engine's ordered event stream.
///
/// All callbacks run synchronously on the worker thread, in listener
/// registration order, and default to no-ops. Returning an error from any
/// callback is an infrastructure failure: the run aborts and the error
/// surfaces in the `RunFinished` outcome.
pub trait EventListener {
    /// The run started; `run.test_count` cases are about to execute.
    fn run_started(&mut self, run: &RunStart) -> Result<(), ListenerError> {
        let _ = run;
        Ok(())
    }

    /// A suite or fixture was entered.
    fn suite_started(&mut self, suite: &SuiteId) -> Result<(), ListenerError> {
        let _ = suite;
        Ok(())
    }

    /// A case started running.
    fn test_started(&mut self, case: &CaseId) -> Result<(), ListenerError> {
        let _ = case;
        Ok(())
    }

    /// A case produced a chunk of captured output.
    fn test_output(&mut self, case: &CaseId, chunk: &OutputChunk) -> Result<(), ListenerError> {
        let _ = (case, chunk);
        Ok(())
    }

    /// A case finished running.
    fn test_finished(&mut self, result: &CaseResult) -> Result<(), ListenerError> {
        let _ = result;
        Ok(())
    }

    /// A suite or fixture was left.
    fn suite_finished(&mut self, result: &SuiteResult) -> Result<(), ListenerError> {
        let _ = result;
        Ok(())
    }

    /// The run finished.
    fn run_finished(&mut self, run: &RunFinish) -> Result<(), ListenerError> {
        let _ = run;
        Ok(())
    }

    /// Routes a full event record to the matching callback.
    ///
    /// Listeners that want the timestamp and elapsed-time stamps, or that
    /// record events wholesale, can override this instead of the individual
    /// callbacks.
    fn handle_event(&mut self, event: &TestEvent) -> Result<(), ListenerError> {
        match &event.kind {
            TestEventKind::RunStarted(run) => self.run_started(run),
            TestEventKind::SuiteStarted(suite) => self.suite_started(suite),
            TestEventKind::TestStarted(case) => self.test_started(case),
            TestEventKind::TestOutput { case, chunk } => self.test_output(case, chunk),
            TestEventKind::TestFinished(result) => self.test_finished(result),
            TestEventKind::SuiteFinished(result) => self.suite_finished(result),
            TestEventKind::RunFinished(run) => self.run_finished(run),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(TestStatus::Success, TestStatus::Success, TestStatus::Success)]
    #[test_case(TestStatus::Success, TestStatus::Cancelled, TestStatus::Cancelled)]
    #[test_case(TestStatus::Cancelled, TestStatus::Failure, TestStatus::Failure)]
    #[test_case(TestStatus::Failure, TestStatus::Error, TestStatus::Error)]
    #[test_case(TestStatus::Error, TestStatus::Success, TestStatus::Error)]
    fn status_aggregation_is_worst_of(a: TestStatus, b: TestStatus, expected: TestStatus) {
        assert_eq!(a.combine(b), expected);
        assert_eq!(b.combine(a), expected);
    }

    fn result_with(status: TestStatus) -> CaseResult {
        CaseResult {
            case: CaseId {
                full_name: "case".to_owned(),
            },
            status,
            duration: Duration::from_millis(1),
            message: None,
        }
    }

    #[test]
    fn stats_track_every_status() {
        let mut stats = RunStats {
            initial_run_count: 4,
            ..RunStats::default()
        };
        stats.on_case_finished(&result_with(TestStatus::Success));
        stats.on_case_finished(&result_with(TestStatus::Failure));
        stats.on_case_finished(&result_with(TestStatus::Error));
        stats.on_case_finished(&result_with(TestStatus::Cancelled));

        assert_eq!(stats.finished_count, 4);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.cancelled, 1);
        assert!(!stats.is_success());
    }

    #[test]
    fn stats_success_requires_everything_finished_and_passed() {
        let mut stats = RunStats {
            initial_run_count: 2,
            ..RunStats::default()
        };
        stats.on_case_finished(&result_with(TestStatus::Success));
        assert!(!stats.is_success(), "one case never ran");

        stats.on_case_finished(&result_with(TestStatus::Success));
        assert!(stats.is_success());
    }

    #[test]
    fn unstarted_cancellations_fail_the_run() {
        let mut stats = RunStats {
            initial_run_count: 3,
            ..RunStats::default()
        };
        stats.on_case_finished(&result_with(TestStatus::Success));
        stats.on_cases_cancelled(2);
        assert_eq!(stats.cancelled, 2);
        assert!(!stats.is_success());
    }
}
