// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::catalog::CaseCommand;
use crate::errors::ChildStartError;
use camino::Utf8PathBuf;
use std::process::Stdio;

/// Represents a to-be-run command for one test case.
///
/// Stdin is null and both output streams are piped: the capture owns them
/// for the case's lifetime.
pub(crate) struct TestCommand {
    program: Utf8PathBuf,
    command: std::process::Command,
}

impl TestCommand {
    pub(crate) fn new(case: &CaseCommand) -> Self {
        let mut command = std::process::Command::new(case.program());
        command
            .args(case.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // This environment variable is set to indicate that tests are being run under mettle.
            .env("METTLE", "1")
            // This environment variable is set to indicate that each test is being run in its own process.
            .env("METTLE_EXECUTION_MODE", "process-per-test");

        Self {
            program: case.program().to_owned(),
            command,
        }
    }

    #[inline]
    pub(crate) fn command_mut(&mut self) -> &mut std::process::Command {
        &mut self.command
    }

    pub(crate) fn spawn(self) -> Result<tokio::process::Child, ChildStartError> {
        let mut command = tokio::process::Command::from(self.command);
        command.spawn().map_err(|error| ChildStartError {
            program: self.program,
            error,
        })
    }
}
