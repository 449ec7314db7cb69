// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Output capture for tests run in a child process.
//!
//! For the duration of one case, the capture owns the child's stdout and
//! stderr pipe ends. Writes that complete a line are flushed immediately as
//! one [`OutputChunk`] per line, separator included; a trailing write with
//! no separator is held until the test completes and then flushed verbatim
//! (or discarded if the test was forcibly terminated).

use crate::errors::CaptureError;
use bytes::{Bytes, BytesMut};
use std::borrow::Cow;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Which standard stream a captured chunk came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StreamKind {
    /// The test process's standard output.
    StandardOut,
    /// The test process's standard error.
    StandardError,
}

/// One captured chunk of test output.
///
/// The bytes are exactly what the test wrote — no encoding transform is
/// applied. A chunk is either one complete line (separator included) or the
/// trailing unterminated text of a finished test (no separator appended).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputChunk {
    /// The stream the chunk was captured from.
    pub stream: StreamKind,
    /// The raw captured bytes.
    pub buf: Bytes,
}

impl OutputChunk {
    /// The chunk as a lossy UTF-8 string.
    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.buf)
    }
}

/// The size of each buffered reader's buffer. The (normal) page size on most
/// linux and macos systems.
const CHUNK_SIZE: usize = 4 * 1024;

/// Per-stream line buffer implementing the flush policy.
#[derive(Debug)]
struct LineBuffer {
    stream: StreamKind,
    buf: BytesMut,
}

impl LineBuffer {
    fn new(stream: StreamKind) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    /// Appends freshly read bytes, moving any newly completed lines into
    /// `chunks`.
    fn push(&mut self, data: &[u8], chunks: &mut Vec<OutputChunk>) {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&byte| byte == b'\n') {
            let line = self.buf.split_to(pos + 1).freeze();
            chunks.push(OutputChunk {
                stream: self.stream,
                buf: line,
            });
        }
    }

    /// Flushes whatever never saw a separator, verbatim.
    fn take_partial(&mut self, chunks: &mut Vec<OutputChunk>) {
        if !self.buf.is_empty() {
            chunks.push(OutputChunk {
                stream: self.stream,
                buf: self.buf.split().freeze(),
            });
        }
    }

    fn discard(&mut self) {
        self.buf.clear();
    }
}

/// Captures one case's stdout and stderr, independently line-buffered.
///
/// Driven by the executor's select loop: each [`fill_buf`](Self::fill_buf)
/// call pulls whatever is ready from either pipe and hands back the lines it
/// completed, preserving read-arrival order between the two streams.
pub(crate) struct CaseCapture<O, E> {
    stdout: BufReader<O>,
    stderr: BufReader<E>,
    out_buf: LineBuffer,
    err_buf: LineBuffer,
    out_done: bool,
    err_done: bool,
}

impl<O: AsyncRead + Unpin, E: AsyncRead + Unpin> CaseCapture<O, E> {
    pub(crate) fn new(stdout: O, stderr: E) -> Self {
        Self {
            stdout: BufReader::with_capacity(CHUNK_SIZE, stdout),
            stderr: BufReader::with_capacity(CHUNK_SIZE, stderr),
            out_buf: LineBuffer::new(StreamKind::StandardOut),
            err_buf: LineBuffer::new(StreamKind::StandardError),
            out_done: false,
            err_done: false,
        }
    }

    /// True once both pipes have reached EOF.
    pub(crate) fn is_done(&self) -> bool {
        self.out_done && self.err_done
    }

    /// One read round: pulls whatever is ready from either stream, appending
    /// any newly completed lines to `chunks`.
    pub(crate) async fn fill_buf(
        &mut self,
        chunks: &mut Vec<OutputChunk>,
    ) -> Result<(), CaptureError> {
        let Self {
            stdout,
            stderr,
            out_buf,
            err_buf,
            out_done,
            err_done,
        } = self;

        tokio::select! {
            res = stdout.fill_buf(), if !*out_done => {
                let read = {
                    let data = res.map_err(CaptureError::ReadStdout)?;
                    out_buf.push(data, chunks);
                    data.len()
                };
                stdout.consume(read);
                *out_done = read == 0;
            }
            res = stderr.fill_buf(), if !*err_done => {
                let read = {
                    let data = res.map_err(CaptureError::ReadStderr)?;
                    err_buf.push(data, chunks);
                    data.len()
                };
                stderr.consume(read);
                *err_done = read == 0;
            }
            else => {}
        }

        Ok(())
    }

    /// Flushes buffered text that never saw a separator. Normal-completion
    /// path only.
    pub(crate) fn flush_partial(&mut self, chunks: &mut Vec<OutputChunk>) {
        self.out_buf.take_partial(chunks);
        self.err_buf.take_partial(chunks);
    }

    /// Drops buffered partial text. Forced-termination path: a terminated
    /// test's partial output is not part of the result.
    pub(crate) fn discard_partial(&mut self) {
        self.out_buf.discard();
        self.err_buf.discard();
    }
}
