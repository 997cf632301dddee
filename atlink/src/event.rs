//! Session events and the observer seam used by front-ends.
//!
//! The engine reports everything it does through [`Observer::on_event`]. The
//! CLI renders progress bars from these; [`LogObserver`] routes them to the
//! `log` facade.

use std::{fmt, time::Duration};

/// Something that happened during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<'a> {
    /// An AT command was written.
    CommandSent {
        /// Command text without the line terminator.
        command: &'a str,
    },
    /// A raw payload was written.
    PayloadSent {
        /// Payload size.
        bytes: usize,
    },
    /// A complete text line was consumed.
    LineReceived {
        /// Raw line, terminator included.
        line: &'a [u8],
    },
    /// A binary segment of a download arrived.
    SegmentReceived {
        /// File offset of the first byte.
        offset: u64,
        /// Segment bytes.
        data: &'a [u8],
    },
    /// Download progress after a segment was written to the sink.
    ChunkProgress {
        /// Bytes received so far.
        received: u64,
        /// Total expected.
        total: u64,
    },
    /// A chunk failed and is being requested again.
    Retry {
        /// Offset being retried.
        offset: u64,
        /// Retry number at this offset, starting at 1.
        attempt: u32,
        /// Retries allowed.
        max: u32,
        /// Failure that caused the retry.
        reason: &'a str,
    },
    /// The module reported update progress.
    UpdateProgress {
        /// Reported value.
        percent: i32,
    },
    /// A state machine moved.
    StateTransition {
        /// Previous state.
        from: &'static str,
        /// New state.
        to: &'static str,
    },
    /// A script step began.
    StepStarted {
        /// Position in the script.
        index: usize,
        /// Step name.
        name: &'a str,
    },
    /// A script step completed.
    StepFinished {
        /// Position in the script.
        index: usize,
        /// Step name.
        name: &'a str,
        /// Time taken.
        elapsed: Duration,
    },
    /// A step failed; the session is about to tear down.
    Error {
        /// Rendered error.
        message: &'a str,
    },
}

impl fmt::Display for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandSent { command } => write!(f, ">> {command}"),
            Self::PayloadSent { bytes } => write!(f, ">> <{bytes} bytes>"),
            Self::LineReceived { line } => {
                write!(f, "<< {}", String::from_utf8_lossy(line).trim_end())
            },
            Self::SegmentReceived { offset, data } => {
                write!(f, "<< <{} bytes at offset {offset}>", data.len())
            },
            Self::ChunkProgress { received, total } => write!(f, "{received}/{total} bytes"),
            Self::Retry {
                offset,
                attempt,
                max,
                reason,
            } => write!(f, "retry {attempt}/{max} at offset {offset}: {reason}"),
            Self::UpdateProgress { percent } => write!(f, "update progress {percent}"),
            Self::StateTransition { from, to } => write!(f, "{from} -> {to}"),
            Self::StepStarted { index, name } => write!(f, "step {} [{name}] started", index + 1),
            Self::StepFinished {
                index,
                name,
                elapsed,
            } => write!(f, "step {} [{name}] done in {elapsed:.2?}", index + 1),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

/// Receives session events.
pub trait Observer {
    /// Called synchronously on the session thread.
    fn on_event(&mut self, event: &Event<'_>);
}

impl<F> Observer for F
where
    F: FnMut(&Event<'_>),
{
    fn on_event(&mut self, event: &Event<'_>) {
        self(event);
    }
}

/// Routes events to the `log` facade at a level matching their weight.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_event(&mut self, event: &Event<'_>) {
        match event {
            Event::Error { .. } => log::error!("{event}"),
            Event::Retry { .. } => log::warn!("{event}"),
            Event::StepStarted { .. } | Event::StepFinished { .. } | Event::UpdateProgress { .. } => {
                log::info!("{event}");
            },
            Event::CommandSent { .. } | Event::StateTransition { .. } => log::debug!("{event}"),
            Event::LineReceived { .. }
            | Event::SegmentReceived { .. }
            | Event::PayloadSent { .. }
            | Event::ChunkProgress { .. } => log::trace!("{event}"),
        }
    }
}
