use std::time::Duration;

use bootkeeper_process::SlotId;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    sync::watch,
    task::JoinHandle,
};

use crate::{
    broadcaster::{Broadcaster, SharedOutput},
    error::SupervisorError,
    process_handle::{ExitInfo, ProcessOutput},
};

/// Reads the merged output of one process into the slot's output buffer and
/// the broadcaster.
pub(crate) struct OutputPump {
    slot: SlotId,
    output: SharedOutput,
    broadcaster: Broadcaster,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    poll_interval: Duration,
}

/// Decodes one raw line. Invalid UTF-8 is replaced, trailing whitespace is
/// dropped, blank lines yield `None`.
fn decode_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end();
    if line.trim_start().is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

/// Splits a byte stream into lines ended by `\n`, `\r` or `\r\n`.
///
/// `next_line` is cancel safe: bytes are moved into `pending` and consumed
/// from the reader in the same step, so a dropped call loses nothing.
struct LineSplitter<R> {
    inner: R,
    pending: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineSplitter<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    /// Next raw line without its terminator; `None` at EOF with nothing
    /// pending. The empty segment between `\r` and `\n` comes back as an
    /// empty line.
    async fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
            match available.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(pos) => {
                    self.pending.extend_from_slice(&available[..pos]);
                    self.inner.consume(pos + 1);
                    return Ok(Some(std::mem::take(&mut self.pending)));
                }
                None => {
                    let n = available.len();
                    self.pending.extend_from_slice(available);
                    self.inner.consume(n);
                }
            }
        }
    }

    fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

impl OutputPump {
    pub(crate) fn new(
        slot: SlotId,
        output: SharedOutput,
        broadcaster: Broadcaster,
        exit_rx: watch::Receiver<Option<ExitInfo>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            slot,
            output,
            broadcaster,
            exit_rx,
            poll_interval,
        }
    }

    pub(crate) fn spawn(self, streams: ProcessOutput) -> JoinHandle<()> {
        let slot = self.slot;
        tokio::spawn(async move {
            match self.run(streams).await {
                Ok(lines) => tracing::debug!(slot = %slot, lines, "output pump finished"),
                Err(e) => tracing::error!(slot = %slot, error = %e, "output pump stopped"),
            }
        })
    }

    async fn emit(&self, raw: &[u8]) -> bool {
        let Some(line) = decode_line(raw) else {
            return false;
        };
        let event = self.output.lock().await.push_line(line);
        self.broadcaster.publish(event).await;
        true
    }

    /// Runs until EOF, or until the process has exited and no output arrived
    /// for one poll interval. Returns the number of lines captured.
    async fn run(self, streams: ProcessOutput) -> Result<u64, SupervisorError> {
        let mut reader = LineSplitter::new(BufReader::new(streams.reader));
        let mut exit_rx = self.exit_rx.clone();
        let mut exited = exit_rx.borrow().is_some();
        let mut lines: u64 = 0;

        loop {
            tokio::select! {
                res = reader.next_line() => {
                    let raw = res.map_err(|source| SupervisorError::ReadFailure { slot: self.slot, source })?;
                    let Some(raw) = raw else { break };
                    if self.emit(&raw).await {
                        lines += 1;
                    }
                }
                changed = exit_rx.changed(), if !exited => {
                    // A closed channel means the watcher is gone with the child.
                    exited = changed.is_err() || exit_rx.borrow().is_some();
                }
                _ = tokio::time::sleep(self.poll_interval), if exited => {
                    // Exited, and whatever still holds the pipe is silent.
                    break;
                }
            }
        }

        // Partial line left behind by an idle break.
        let rest = reader.take_pending();
        if !rest.is_empty() && self.emit(&rest).await {
            lines += 1;
        }

        Ok(lines)
    }
}
