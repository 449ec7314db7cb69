// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ListenerError;
use crate::reporter::events::{
    CaseId, CaseResult, EventListener, RunFinish, RunStart, TestStatus,
};
use crate::test_output::OutputChunk;
use owo_colors::{OwoColorize, Style};
use std::io::Write;

/// A minimal listener that prints one line per finished test, passes
/// captured output through, and ends with a summary line.
///
/// Colors are off by default; call [`colorize`](Self::colorize) when the
/// destination is a terminal.
pub struct LineReporter<W> {
    writer: W,
    styles: Styles,
}

impl<W: Write> LineReporter<W> {
    /// Creates a reporter writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            styles: Styles::default(),
        }
    }

    /// Enables ANSI color output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    fn status_style(&self, status: TestStatus) -> Style {
        match status {
            TestStatus::Success => self.styles.pass,
            TestStatus::Failure | TestStatus::Error => self.styles.fail,
            TestStatus::Cancelled => self.styles.cancel,
        }
    }
}

#[derive(Clone, Debug)]
struct Styles {
    pass: Style,
    fail: Style,
    cancel: Style,
    count: Style,
}

impl Default for Styles {
    fn default() -> Self {
        Self {
            pass: Style::new(),
            fail: Style::new(),
            cancel: Style::new(),
            count: Style::new(),
        }
    }
}

impl Styles {
    fn colorize(&mut self) {
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.cancel = Style::new().yellow().bold();
        self.count = Style::new().bold();
    }
}

fn status_label(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Success => "PASS",
        TestStatus::Failure => "FAIL",
        TestStatus::Error => "ERROR",
        TestStatus::Cancelled => "CANCEL",
    }
}

impl<W: Write> EventListener for LineReporter<W> {
    fn run_started(&mut self, run: &RunStart) -> Result<(), ListenerError> {
        let noun = if run.test_count == 1 { "test" } else { "tests" };
        writeln!(
            self.writer,
            "running {} {noun}",
            run.test_count.style(self.styles.count)
        )?;
        Ok(())
    }

    fn test_output(&mut self, _case: &CaseId, chunk: &OutputChunk) -> Result<(), ListenerError> {
        self.writer.write_all(&chunk.buf)?;
        Ok(())
    }

    fn test_finished(&mut self, result: &CaseResult) -> Result<(), ListenerError> {
        let style = self.status_style(result.status);
        writeln!(
            self.writer,
            "{:>8} [{:>9.3}s] {}",
            status_label(result.status).style(style),
            result.duration.as_secs_f64(),
            result.case.full_name,
        )?;
        if let Some(message) = &result.message {
            writeln!(self.writer, "         {message}")?;
        }
        Ok(())
    }

    fn run_finished(&mut self, run: &RunFinish) -> Result<(), ListenerError> {
        let stats = run.stats;
        let verdict = if stats.is_success() { "ok" } else { "failed" };
        writeln!(
            self.writer,
            "run result: {}. {} passed; {} failed; {} errored; {} cancelled; finished in {:.3}s",
            verdict.style(if stats.is_success() {
                self.styles.pass
            } else {
                self.styles.fail
            }),
            stats.passed,
            stats.failed,
            stats.errored,
            stats.cancelled,
            run.elapsed.as_secs_f64(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::events::{RunId, RunOutcome, RunStats};
    use std::time::Duration;

    fn case_result(status: TestStatus, message: Option<&str>) -> CaseResult {
        CaseResult {
            case: CaseId {
                full_name: "alpha::one".to_owned(),
            },
            status,
            duration: Duration::from_millis(1500),
            message: message.map(str::to_owned),
        }
    }

    #[test]
    fn prints_status_lines_and_summary() {
        let mut out = Vec::new();
        let mut reporter = LineReporter::new(&mut out);

        reporter
            .run_started(&RunStart {
                run_id: RunId::new_v4(),
                test_count: 2,
            })
            .unwrap();
        reporter
            .test_finished(&case_result(TestStatus::Success, None))
            .unwrap();
        reporter
            .test_finished(&case_result(
                TestStatus::Failure,
                Some("test process exited with code 3"),
            ))
            .unwrap();
        reporter
            .run_finished(&RunFinish {
                run_id: RunId::new_v4(),
                start_time: chrono::Local::now().fixed_offset(),
                elapsed: Duration::from_secs(3),
                outcome: RunOutcome::Completed,
                stats: RunStats {
                    initial_run_count: 2,
                    finished_count: 2,
                    passed: 1,
                    failed: 1,
                    ..RunStats::default()
                },
            })
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("running 2 tests"), "{text}");
        assert!(text.contains("PASS"), "{text}");
        assert!(text.contains("FAIL"), "{text}");
        assert!(text.contains("test process exited with code 3"), "{text}");
        assert!(text.contains("run result: failed. 1 passed; 1 failed"), "{text}");
    }

    #[test]
    fn passes_captured_output_through_verbatim() {
        let mut out = Vec::new();
        let mut reporter = LineReporter::new(&mut out);
        let chunk = OutputChunk {
            stream: crate::test_output::StreamKind::StandardOut,
            buf: bytes::Bytes::from_static(b"hello\n"),
        };
        reporter
            .test_output(
                &CaseId {
                    full_name: "alpha::one".to_owned(),
                },
                &chunk,
            )
            .unwrap();
        assert_eq!(out, b"hello\n");
    }
}
