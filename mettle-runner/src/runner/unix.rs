// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::test_output::CaseCapture;
use libc::{SIGKILL, SIGTERM};
use std::os::unix::process::CommandExt;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout};

/// Pre-execution configuration on Unix.
///
/// Each test gets its own process group, so termination signals reach
/// grandchildren too.
pub(super) fn set_process_group(cmd: &mut std::process::Command) {
    cmd.process_group(0);
}

/// Signals the child's whole process group.
pub(super) fn kill_group(child_pid: i32, signal: libc::c_int) {
    unsafe {
        // Negative PID: the process group.
        libc::kill(-child_pid, signal);
    }
}

/// Immediate SIGKILL, no grace. Used when the run itself is aborting.
pub(super) fn kill_now(child_pid: i32) {
    kill_group(child_pid, SIGKILL);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum TerminateChildResult {
    /// The child exited on its own within the grace period.
    Exited,
    /// The child was SIGKILLed.
    Killed,
}

/// Stops the child: SIGTERM first, SIGKILL once the grace period runs out.
///
/// There is a race between shutting down the child and its own completion,
/// so signal errors are silently ignored. Output read while terminating is
/// dropped — it is past the cancellation point and not part of the result.
pub(super) async fn terminate_child(
    child: &mut Child,
    capture: &mut CaseCapture<ChildStdout, ChildStderr>,
    child_pid: i32,
    grace_period: Duration,
) -> TerminateChildResult {
    if child.id().is_none() {
        return TerminateChildResult::Exited;
    }
    if grace_period.is_zero() {
        // SIGKILL guarantees the process group is dead.
        kill_group(child_pid, SIGKILL);
        return TerminateChildResult::Killed;
    }

    kill_group(child_pid, SIGTERM);

    let mut scratch = Vec::new();
    let mut sleep = std::pin::pin!(tokio::time::sleep(grace_period));
    loop {
        tokio::select! {
            res = capture.fill_buf(&mut scratch), if !capture.is_done() => {
                let _ = res;
                scratch.clear();
            }
            _ = child.wait() => {
                break TerminateChildResult::Exited;
            }
            _ = &mut sleep => {
                kill_group(child_pid, SIGKILL);
                break TerminateChildResult::Killed;
            }
        }
    }
}
