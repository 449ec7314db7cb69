// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core test execution engine for mettle.
//!
//! The engine loads a catalog of discovered tests from an executable test
//! binary, runs a selected subtree of them — each case in its own child
//! process — and emits an ordered stream of lifecycle events to listeners.
//! Cancelling an in-flight run is guaranteed to terminate it within a
//! bounded grace period, even if the running test is blocked in an
//! operation that never polls a cooperative flag.
//!
//! ```no_run
//! use camino::Utf8Path;
//! use mettle_runner::{catalog::Selection, reporter::LineReporter, runner::TestRunner};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut runner = TestRunner::new();
//! runner.load(Utf8Path::new("target/debug/my-tests"))?;
//!
//! let mut reporter = LineReporter::new(std::io::stdout());
//! let stats = runner.run(&mut reporter, &Selection::all())?;
//! println!("success: {}", stats.is_success());
//! # Ok(())
//! # }
//! ```

mod cancel;
pub mod catalog;
pub mod errors;
pub mod reporter;
pub mod runner;
mod stopwatch;
mod test_command;
pub mod test_output;
