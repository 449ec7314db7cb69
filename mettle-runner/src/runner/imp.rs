// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::dispatcher::EventDispatcher;
use super::os::{self, TerminateChildResult};
use crate::cancel::CancellationController;
use crate::catalog::{LibtestCatalog, Selection, Test, TestCatalog, TestKind, TestPlan, TestTree};
use crate::errors::{LoadError, RunAbortError, RunError, error_chain};
use crate::reporter::events::{EventListener, RunId, RunOutcome, RunStats, TestStatus};
use crate::stopwatch;
use crate::test_command::TestCommand;
use crate::test_output::{CaseCapture, OutputChunk};
use camino::Utf8Path;
use debug_ignore::DebugIgnore;
use futures::future::LocalBoxFuture;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::debug;

pub use crate::cancel::RunState;

/// The default grace period between the cancellation request and the
/// in-flight test process being SIGKILLed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// How long to keep draining output pipes after a test process has exited,
/// in case grandchildren still hold the write ends.
const LEAK_TIMEOUT: Duration = Duration::from_millis(100);

/// Test runner options.
///
/// ```
/// use mettle_runner::runner::TestRunnerBuilder;
/// use std::time::Duration;
///
/// let mut builder = TestRunnerBuilder::default();
/// builder.set_grace_period(Duration::from_millis(500));
/// let runner = builder.build();
/// assert!(runner.tree().is_none());
/// ```
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    grace_period: Option<Duration>,
    catalog: DebugIgnore<Option<Box<dyn TestCatalog + Send + Sync>>>,
}

impl TestRunnerBuilder {
    /// Sets the forced-termination grace period for this runner.
    ///
    /// After `cancel_run`, the in-flight test process receives SIGTERM
    /// immediately and SIGKILL once this period elapses. A zero grace period
    /// means SIGKILL right away.
    pub fn set_grace_period(&mut self, grace_period: Duration) -> &mut Self {
        self.grace_period = Some(grace_period);
        self
    }

    /// Replaces the default [`LibtestCatalog`] with a custom catalog.
    pub fn set_catalog(&mut self, catalog: impl TestCatalog + Send + Sync + 'static) -> &mut Self {
        self.catalog = DebugIgnore(Some(Box::new(catalog)));
        self
    }

    /// Creates a new test runner.
    pub fn build(self) -> TestRunner {
        TestRunner {
            catalog: DebugIgnore(
                self.catalog
                    .0
                    .unwrap_or_else(|| Box::new(LibtestCatalog)),
            ),
            tree: None,
            controller: CancellationController::new(),
            grace_period: self.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD),
        }
    }
}

/// The test execution engine.
///
/// A runner loads one test tree at a time and executes selections of it,
/// one run at a time: a second [`run`](Self::run) while one is in flight
/// fails with [`RunError::AlreadyRunning`]. `run` blocks the calling thread
/// until the run completes; [`cancel_run`](Self::cancel_run) may be called
/// from any other thread to terminate it within the grace period.
#[derive(Debug)]
pub struct TestRunner {
    catalog: DebugIgnore<Box<dyn TestCatalog + Send + Sync>>,
    tree: Option<TestTree>,
    controller: CancellationController,
    grace_period: Duration,
}

impl Default for TestRunner {
    fn default() -> Self {
        TestRunnerBuilder::default().build()
    }
}

impl TestRunner {
    /// Creates a runner with the default catalog and grace period.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a builder for configuring a runner.
    pub fn builder() -> TestRunnerBuilder {
        TestRunnerBuilder::default()
    }

    /// Loads the test module at `path` through the catalog, retaining its
    /// tree for subsequent runs.
    pub fn load(&mut self, path: &Utf8Path) -> Result<(), LoadError> {
        debug!(%path, "loading test catalog");
        self.tree = Some(self.catalog.load(path)?);
        Ok(())
    }

    /// Hands the runner an already-built tree, for embedders that run their
    /// own discovery.
    pub fn load_tree(&mut self, tree: TestTree) {
        self.tree = Some(tree);
    }

    /// The currently loaded tree, if any.
    pub fn tree(&self) -> Option<&TestTree> {
        self.tree.as_ref()
    }

    /// The current run state.
    pub fn run_state(&self) -> RunState {
        self.controller.state()
    }

    /// Requests cancellation of the in-flight run, if there is one.
    ///
    /// Callable from any thread at any time; a no-op when nothing is
    /// running, and idempotent while cancellation is already in progress.
    /// The in-flight run is guaranteed to finish — with a `RunFinished`
    /// cancellation outcome — within the grace period.
    pub fn cancel_run(&self) {
        if self.controller.request_cancel() {
            debug!("cancellation requested");
        }
    }

    /// Runs the selected tests, delivering events to `listener`, and blocks
    /// until the run completes.
    ///
    /// Fails synchronously if no tree is loaded, if another run is in
    /// flight, if the selection doesn't resolve, or if the worker runtime
    /// can't be built — all before any events are emitted. Everything else,
    /// including per-case failures, cancellation, and infrastructure
    /// errors, is reported through the event stream; the returned
    /// [`RunStats`] summarize it.
    pub fn run(
        &self,
        listener: &mut dyn EventListener,
        selection: &Selection,
    ) -> Result<RunStats, RunError> {
        let tree = self.tree.as_ref().ok_or(RunError::NoTestsLoaded)?;
        if !self.controller.try_begin_run() {
            return Err(RunError::AlreadyRunning);
        }
        // Restores Idle on every exit path from here on, panics included.
        let _active = ActiveRun(&self.controller);

        let plan = self
            .catalog
            .resolve(tree, selection)
            .map_err(RunError::Resolve)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("mettle-runner-worker")
            .build()
            .map_err(RunError::RuntimeCreate)?;

        let mut dispatcher = EventDispatcher::new(vec![listener], RunId::new_v4());
        let stats = runtime.block_on(execute_plan(
            &mut dispatcher,
            &plan,
            &self.controller,
            self.grace_period,
        ));

        // Leaked pipe readers could keep the runtime alive past the run; shut
        // it down without waiting for them.
        runtime.shutdown_background();

        Ok(stats)
    }
}

struct ActiveRun<'a>(&'a CancellationController);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.finish_run();
    }
}

async fn execute_plan(
    dispatcher: &mut EventDispatcher<'_>,
    plan: &TestPlan,
    controller: &CancellationController,
    grace_period: Duration,
) -> RunStats {
    debug!(test_count = plan.case_count(), "starting test run");

    let outcome = if let Err(error) = dispatcher.run_started(plan) {
        RunOutcome::Error {
            message: error_chain(&error),
        }
    } else {
        match run_roots(dispatcher, plan, controller, grace_period).await {
            Ok(()) => {
                if controller.is_cancel_requested() {
                    RunOutcome::Cancelled
                } else {
                    RunOutcome::Completed
                }
            }
            Err(error) => RunOutcome::Error {
                message: error_chain(&error),
            },
        }
    };

    dispatcher.run_finished(outcome);
    dispatcher.run_stats()
}

async fn run_roots(
    dispatcher: &mut EventDispatcher<'_>,
    plan: &TestPlan,
    controller: &CancellationController,
    grace_period: Duration,
) -> Result<(), RunAbortError> {
    for (index, root) in plan.roots().iter().enumerate() {
        if controller.is_cancel_requested() {
            let remaining = plan.roots()[index..].iter().map(Test::case_count).sum();
            dispatcher.mark_cancelled(remaining);
            break;
        }
        run_node(dispatcher, root, controller, grace_period).await?;
    }
    Ok(())
}

/// Depth-first traversal step. Boxed because suites recurse.
fn run_node<'a>(
    dispatcher: &'a mut EventDispatcher<'_>,
    node: &'a Test,
    controller: &'a CancellationController,
    grace_period: Duration,
) -> LocalBoxFuture<'a, Result<TestStatus, RunAbortError>> {
    Box::pin(async move {
        match node.kind() {
            TestKind::Case => run_case(dispatcher, node, controller, grace_period).await,
            TestKind::Suite | TestKind::Fixture => {
                run_suite(dispatcher, node, controller, grace_period).await
            }
        }
    })
}

async fn run_suite(
    dispatcher: &mut EventDispatcher<'_>,
    node: &Test,
    controller: &CancellationController,
    grace_period: Duration,
) -> Result<TestStatus, RunAbortError> {
    dispatcher.suite_started(node)?;
    let suite_stopwatch = stopwatch::stopwatch();
    let mut status = TestStatus::Success;

    for (index, child) in node.children().iter().enumerate() {
        if controller.is_cancel_requested() {
            let remaining = node.children()[index..].iter().map(Test::case_count).sum();
            dispatcher.mark_cancelled(remaining);
            status = status.combine(TestStatus::Cancelled);
            break;
        }
        status = status.combine(run_node(dispatcher, child, controller, grace_period).await?);
    }

    dispatcher.suite_finished(node, status, suite_stopwatch.snapshot().duration)?;
    Ok(status)
}

async fn run_case(
    dispatcher: &mut EventDispatcher<'_>,
    case: &Test,
    controller: &CancellationController,
    grace_period: Duration,
) -> Result<TestStatus, RunAbortError> {
    debug!(test_name = case.full_name(), "running test");
    dispatcher.test_started(case)?;
    let case_stopwatch = stopwatch::stopwatch();

    let outcome = execute_case(dispatcher, case, controller, grace_period).await?;

    dispatcher.test_finished(
        case,
        outcome.status,
        case_stopwatch.snapshot().duration,
        outcome.message,
    )?;
    Ok(outcome.status)
}

struct CaseOutcome {
    status: TestStatus,
    message: Option<String>,
}

/// Runs one case in its own child process.
///
/// Drives output capture, child exit and cancellation concurrently. On an
/// infrastructure error the child is killed (no grace — the run is
/// aborting) before the error is propagated; forced termination and normal
/// completion otherwise converge on the same cleanup below.
async fn execute_case(
    dispatcher: &mut EventDispatcher<'_>,
    case: &Test,
    controller: &CancellationController,
    grace_period: Duration,
) -> Result<CaseOutcome, RunAbortError> {
    let command = case
        .command()
        .expect("cases always carry an execution command");

    let mut cmd = TestCommand::new(command);
    os::set_process_group(cmd.command_mut());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(error) => {
            debug!(test_name = case.full_name(), "failed to start test process");
            return Ok(CaseOutcome {
                status: TestStatus::Error,
                message: Some(error_chain(&error)),
            });
        }
    };

    // Used to signal the process group. The child has never been polled, so
    // it must still have a PID.
    let child_pid = child.id().expect("child has never been polled") as i32;
    let stdout = child.stdout.take().expect("stdout was piped at spawn");
    let stderr = child.stderr.take().expect("stderr was piped at spawn");
    let mut capture = CaseCapture::new(stdout, stderr);
    let mut chunks = Vec::new();
    let mut cancelled = false;

    let res = loop {
        tokio::select! {
            res = capture.fill_buf(&mut chunks), if !capture.is_done() => {
                if let Err(error) = res {
                    kill_and_reap(&mut child, child_pid).await;
                    return Err(error.into());
                }
                if let Err(error) = drain_chunks(dispatcher, case, &mut chunks) {
                    kill_and_reap(&mut child, child_pid).await;
                    return Err(error.into());
                }
            }
            res = child.wait() => {
                // The test finished executing.
                break res;
            }
            () = controller.cancel_requested(), if !cancelled => {
                cancelled = true;
                controller.begin_terminating();
                match os::terminate_child(&mut child, &mut capture, child_pid, grace_period).await {
                    TerminateChildResult::Exited => {
                        debug!(test_name = case.full_name(), "test process exited within the grace period");
                    }
                    TerminateChildResult::Killed => {
                        debug!(test_name = case.full_name(), "test process killed");
                    }
                }
                break child.wait().await;
            }
        }
    };

    if cancelled {
        // A terminated test's partial output is not part of the result.
        capture.discard_partial();
        return Ok(CaseOutcome {
            status: TestStatus::Cancelled,
            message: None,
        });
    }

    // The child has exited; drain what's left in the pipes, but not forever.
    let mut leak_sleep = std::pin::pin!(tokio::time::sleep(LEAK_TIMEOUT));
    while !capture.is_done() {
        tokio::select! {
            res = capture.fill_buf(&mut chunks) => {
                res?;
                drain_chunks(dispatcher, case, &mut chunks)?;
            }
            _ = &mut leak_sleep => {
                debug!(
                    test_name = case.full_name(),
                    "output handles still open past the test process exit"
                );
                break;
            }
        }
    }

    capture.flush_partial(&mut chunks);
    drain_chunks(dispatcher, case, &mut chunks)?;

    let exit_status = match res {
        Ok(exit_status) => exit_status,
        Err(error) => {
            return Ok(CaseOutcome {
                status: TestStatus::Error,
                message: Some(format!("failed to wait on test process: {error}")),
            });
        }
    };
    Ok(case_outcome(exit_status))
}

fn drain_chunks(
    dispatcher: &mut EventDispatcher<'_>,
    case: &Test,
    chunks: &mut Vec<OutputChunk>,
) -> Result<(), crate::errors::DispatchError> {
    for chunk in chunks.drain(..) {
        dispatcher.test_output(case, chunk)?;
    }
    Ok(())
}

async fn kill_and_reap(child: &mut Child, child_pid: i32) {
    os::kill_now(child_pid);
    let _ = child.wait().await;
}

fn case_outcome(exit_status: ExitStatus) -> CaseOutcome {
    if exit_status.success() {
        return CaseOutcome {
            status: TestStatus::Success,
            message: None,
        };
    }
    match exit_status.code() {
        Some(code) => CaseOutcome {
            status: TestStatus::Failure,
            message: Some(format!("test process exited with code {code}")),
        },
        None => {
            // Killed by a signal the engine did not send.
            let message = match exit_status.signal() {
                Some(signal) => format!("test process terminated by signal {signal}"),
                None => format!("test process ended abnormally: {exit_status}"),
            };
            CaseOutcome {
                status: TestStatus::Error,
                message: Some(message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_statuses_map_to_results() {
        let success = ExitStatus::from_raw(0);
        assert!(case_outcome(success).status.is_success());

        // Raw wait status 0x0300: exited with code 3.
        let failed = ExitStatus::from_raw(3 << 8);
        let outcome = case_outcome(failed);
        assert_eq!(outcome.status, TestStatus::Failure);
        assert_eq!(
            outcome.message.as_deref(),
            Some("test process exited with code 3")
        );

        // Raw wait status 9: killed by SIGKILL.
        let signalled = ExitStatus::from_raw(9);
        let outcome = case_outcome(signalled);
        assert_eq!(outcome.status, TestStatus::Error);
        assert_eq!(
            outcome.message.as_deref(),
            Some("test process terminated by signal 9")
        );
    }

    #[test]
    fn builder_defaults() {
        let runner = TestRunner::new();
        assert_eq!(runner.grace_period, DEFAULT_GRACE_PERIOD);
        assert_eq!(runner.run_state(), RunState::Idle);
        assert!(runner.tree().is_none());
    }
}
