// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by mettle.

use camino::Utf8PathBuf;
use std::{io, process::ExitStatus};
use thiserror::Error;

/// An error that occurred while loading a test catalog from a path.
///
/// Returned by [`TestRunner::load`](crate::runner::TestRunner::load); no run
/// takes place when loading fails.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    /// The test binary could not be executed at all.
    #[error("failed to execute `{path} --list`")]
    Spawn {
        /// The path that was being loaded.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The test binary ran but its list command failed.
    #[error("`{path} --list` failed with {status}: {stderr}")]
    ListCommand {
        /// The path that was being loaded.
        path: Utf8PathBuf,
        /// The exit status of the list command.
        status: ExitStatus,
        /// Captured standard error of the list command.
        stderr: String,
    },

    /// The list command produced output that isn't valid UTF-8.
    #[error("`{path} --list` produced invalid UTF-8")]
    InvalidUtf8 {
        /// The path that was being loaded.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::string::FromUtf8Error,
    },

    /// A line of the listing did not match the `<name>: test` convention.
    #[error("unrecognized line in `{path} --list` output: `{line}`")]
    UnrecognizedListLine {
        /// The path that was being loaded.
        path: Utf8PathBuf,
        /// The offending line.
        line: String,
    },
}

/// One or more selection names did not resolve to any test.
///
/// Resolution is all-or-nothing: a selection containing an unknown name
/// fails before any events are emitted.
#[derive(Clone, Debug, Error)]
#[error("no tests found matching: {}", .names.join(", "))]
pub struct ResolveError {
    names: Vec<String>,
}

impl ResolveError {
    pub(crate) fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// The selection names that matched nothing, in selection order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A synchronous error returned by [`TestRunner::run`](crate::runner::TestRunner::run).
///
/// Once a run has started, failures travel through the event stream instead
/// (as per-case results or as the `RunFinished` outcome), never through this
/// type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// No test tree has been loaded into the runner.
    #[error("no tests have been loaded")]
    NoTestsLoaded,

    /// Another run is in progress on this runner. The in-flight run is
    /// unaffected.
    #[error("a test run is already in progress")]
    AlreadyRunning,

    /// The selection did not resolve against the loaded tree.
    #[error("failed to resolve the test selection")]
    Resolve(#[source] ResolveError),

    /// The per-run worker runtime could not be built.
    #[error("failed to build the worker runtime")]
    RuntimeCreate(#[source] io::Error),
}

/// A test case's child process could not be started.
///
/// This is recovered into the case's result (status Error); it does not
/// abort the run.
#[derive(Debug, Error)]
#[error("failed to start test process `{program}`")]
pub struct ChildStartError {
    pub(crate) program: Utf8PathBuf,
    #[source]
    pub(crate) error: io::Error,
}

/// Reading a test process's output pipes failed.
///
/// This is an infrastructure failure: the run aborts and the error is
/// surfaced through the `RunFinished` outcome.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CaptureError {
    /// Reading the child's standard output failed.
    #[error("failed to read standard output of the test process")]
    ReadStdout(#[source] io::Error),

    /// Reading the child's standard error failed.
    #[error("failed to read standard error of the test process")]
    ReadStderr(#[source] io::Error),
}

/// The boxed error type returned by [`EventListener`](crate::reporter::events::EventListener)
/// callbacks.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A listener callback failed while an event was being fanned out.
///
/// Like [`CaptureError`], this aborts the run and is surfaced through the
/// `RunFinished` outcome.
#[derive(Debug, Error)]
#[error("listener failed while handling the {event} event")]
pub struct DispatchError {
    pub(crate) event: &'static str,
    #[source]
    pub(crate) source: ListenerError,
}

impl DispatchError {
    /// The name of the event that was being delivered.
    pub fn event(&self) -> &'static str {
        self.event
    }
}

/// Infrastructure failures that abort an in-flight run.
#[derive(Debug, Error)]
pub(crate) enum RunAbortError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Renders an error with its full source chain on one line.
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    use std::fmt::Write;

    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(error) = source {
        let _ = write!(message, ": {error}");
        source = error.source();
    }
    message
}
