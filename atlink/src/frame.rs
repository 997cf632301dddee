//! Line and binary-segment extraction from the receive buffer.
//!
//! AT responses are CR LF terminated text, but some of them announce a
//! binary segment that follows the control line. All reads here poll the
//! [`RingBuffer`] and honour the session's [`CancelToken`].

use {
    crate::{
        cancel::CancelToken,
        error::{Error, Result},
        event::{Event, Observer},
        ring::RingBuffer,
    },
    log::trace,
    std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    },
};

/// Default upper bound for one text line, terminator included.
pub const DEFAULT_MAX_LINE: usize = 256;

/// Poll intervals used while waiting on the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Sleep between attempts while waiting for a line or segment bytes.
    pub byte_interval: Duration,
    /// Sleep between scans while waiting for a pattern.
    pub scan_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            byte_interval: Duration::from_millis(1),
            scan_interval: Duration::from_millis(10),
        }
    }
}

/// Result of [`FrameReader::wait_for_pattern_or_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The pattern was found; holds every byte up to and including it.
    Matched(Vec<u8>),
    /// A full line arrived before any match.
    Line(Vec<u8>),
    /// Neither happened in time. Nothing was consumed.
    Timeout,
}

/// Outcome of [`FrameReader::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The expected pattern arrived; holds the consumed bytes.
    Matched(Vec<u8>),
    /// A line containing the rejection marker arrived first.
    Rejected(Vec<u8>),
}

/// Consumer side of the receive buffer.
#[derive(Debug, Clone)]
pub struct FrameReader {
    ring: Arc<RingBuffer>,
    poll: PollConfig,
    cancel: CancelToken,
}

impl FrameReader {
    /// Create a reader over `ring`.
    pub fn new(ring: Arc<RingBuffer>, poll: PollConfig, cancel: CancelToken) -> Self {
        Self { ring, poll, cancel }
    }

    /// The buffer this reader consumes.
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Consume one complete line if the buffer holds one.
    ///
    /// A line longer than `max_len - 1` bytes is split: the first
    /// `max_len - 1` bytes are returned and the rest stays buffered. Returns
    /// `None` without consuming anything when no `\n` is buffered yet.
    pub fn read_line(&self, max_len: usize) -> Option<Vec<u8>> {
        let newline = self
            .ring
            .find_byte(b'\n')?;
        let take = (newline + 1).min(max_len.saturating_sub(1));
        if take == 0 {
            return None;
        }
        Some(
            self.ring
                .read_bulk(take),
        )
    }

    /// Poll for the next line until `timeout`.
    pub fn next_line(&self, max_len: usize, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let start = Instant::now();
        loop {
            self.cancel
                .check()?;
            if let Some(line) = self.read_line(max_len) {
                return Ok(Some(line));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(
                self.poll
                    .byte_interval,
            );
        }
    }

    /// Wait for `pattern` or a complete line, whichever the buffer shows first.
    ///
    /// A pattern found anywhere in the buffered bytes wins over a line ending
    /// before it; the match consumes everything up to the end of the
    /// pattern. An empty pattern never matches.
    pub fn wait_for_pattern_or_line(&self, pattern: &[u8], timeout: Duration) -> Result<WaitOutcome> {
        let start = Instant::now();
        loop {
            self.cancel
                .check()?;

            let snapshot = self
                .ring
                .snapshot();
            if !snapshot.is_empty() {
                if let Some(pos) = find_subslice(&snapshot, pattern) {
                    let consumed = self
                        .ring
                        .read_bulk(pos + pattern.len());
                    return Ok(WaitOutcome::Matched(consumed));
                }
                if let Some(newline) = snapshot
                    .iter()
                    .position(|&b| b == b'\n')
                {
                    let consumed = self
                        .ring
                        .read_bulk(newline + 1);
                    return Ok(WaitOutcome::Line(consumed));
                }
            }

            if start.elapsed() >= timeout {
                return Ok(WaitOutcome::Timeout);
            }
            thread::sleep(
                self.poll
                    .scan_interval,
            );
        }
    }

    /// Consume exactly `length` bytes of binary payload.
    ///
    /// Bytes are taken verbatim, newlines included. If no byte arrives for
    /// `watchdog` the stream is considered desynchronised.
    pub fn read_binary_segment(&self, length: usize, watchdog: Duration) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        let mut last_progress = Instant::now();

        while out.len() < length {
            self.cancel
                .check()?;
            let chunk = self
                .ring
                .read_bulk(length - out.len());
            if chunk.is_empty() {
                if last_progress.elapsed() >= watchdog {
                    return Err(Error::desync(format!(
                        "segment stalled: {} of {length} announced bytes received",
                        out.len()
                    )));
                }
                thread::sleep(
                    self.poll
                        .byte_interval,
                );
            } else {
                out.extend_from_slice(&chunk);
                last_progress = Instant::now();
            }
        }
        trace!("Read binary segment of {length} bytes");
        Ok(out)
    }

    /// Wait for `pattern`, failing early on a line containing `reject`.
    ///
    /// Lines that match neither are reported to `observer` and skipped.
    pub fn expect(
        &self,
        pattern: &str,
        reject: Option<&str>,
        timeout: Duration,
        observer: &mut dyn Observer,
    ) -> Result<Response> {
        let start = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            match self.wait_for_pattern_or_line(pattern.as_bytes(), remaining)? {
                WaitOutcome::Matched(bytes) => {
                    observer.on_event(&Event::LineReceived { line: &bytes });
                    return Ok(Response::Matched(bytes));
                },
                WaitOutcome::Line(line) => {
                    observer.on_event(&Event::LineReceived { line: &line });
                    let text = String::from_utf8_lossy(&line);
                    if reject.is_some_and(|marker| !marker.is_empty() && text.contains(marker)) {
                        return Ok(Response::Rejected(line));
                    }
                },
                WaitOutcome::Timeout => {
                    return Err(Error::PatternTimeout {
                        pattern: pattern.to_string(),
                        timeout,
                    });
                },
            }
        }
    }

    /// Skip lines until one contains `expected`, and return it.
    pub fn wait_for_line_containing(
        &self,
        expected: &str,
        timeout: Duration,
        observer: &mut dyn Observer,
    ) -> Result<Vec<u8>> {
        let start = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            let Some(line) = self.next_line(DEFAULT_MAX_LINE, remaining)? else {
                return Err(Error::PatternTimeout {
                    pattern: expected.to_string(),
                    timeout,
                });
            };
            observer.on_event(&Event::LineReceived { line: &line });
            if String::from_utf8_lossy(&line).contains(expected) {
                return Ok(line);
            }
        }
    }

    /// Skip lines until one contains `prefix`, and parse the number after it.
    ///
    /// Characters between the prefix and the first digit are ignored, so
    /// both `Content-Length: 42` and `+HTTPHEAD: 42` parse.
    pub fn wait_for_number(&self, prefix: &str, timeout: Duration, observer: &mut dyn Observer) -> Result<u64> {
        let line = self.wait_for_line_containing(prefix, timeout, observer)?;
        let text = String::from_utf8_lossy(&line);
        number_after(&text, prefix)
            .ok_or_else(|| Error::desync(format!("no number after {prefix:?} in {:?}", text.trim_end())))
    }
}

/// Parse the first digit run after `prefix` in `line`.
pub(crate) fn number_after(line: &str, prefix: &str) -> Option<u64> {
    let start = line.find(prefix)? + prefix.len();
    let rest = &line[start..];
    let digits_at = rest.find(|c: char| c.is_ascii_digit())?;
    let digits: &str = &rest[digits_at..];
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end]
        .parse()
        .ok()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}
