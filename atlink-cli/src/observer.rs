//! Console rendering of session events.

use atlink::{Event, LogObserver, Observer};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{Level, log_enabled, trace};

use crate::use_fancy_output;

/// Bytes per row in segment dumps.
const DUMP_WIDTH: usize = 16;

/// Prints step headers and drives progress bars on stderr.
///
/// Everything not rendered here goes to the log.
pub(crate) struct ConsoleObserver {
    quiet: bool,
    total_steps: usize,
    bar: Option<ProgressBar>,
    log: LogObserver,
}

impl ConsoleObserver {
    pub(crate) fn new(total_steps: usize, quiet: bool) -> Self {
        Self {
            quiet,
            total_steps,
            bar: None,
            log: LogObserver,
        }
    }

    fn new_bar(&self, len: u64, template: &str) -> ProgressBar {
        if self.quiet || !use_fancy_output() {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template(template)
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    }

    fn bytes_bar(&mut self, total: u64) -> &ProgressBar {
        if self.bar.is_none() {
            let pb = self.new_bar(
                total,
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
            );
            self.bar = Some(pb);
        }
        self.bar
            .get_or_insert_with(ProgressBar::hidden)
    }

    fn percent_bar(&mut self) -> &ProgressBar {
        if self.bar.is_none() {
            let pb = self.new_bar(
                100,
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}",
            );
            self.bar = Some(pb);
        }
        self.bar
            .get_or_insert_with(ProgressBar::hidden)
    }

    fn finish_bar(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_and_clear();
        }
    }

    /// Print a line without tearing an active bar.
    fn println(&self, message: String) {
        if self.quiet {
            return;
        }
        match &self.bar {
            Some(pb) if !pb.is_hidden() => pb.println(message),
            _ => eprintln!("{message}"),
        }
    }
}

impl Observer for ConsoleObserver {
    fn on_event(&mut self, event: &Event<'_>) {
        match event {
            Event::StepStarted { index, name } => {
                self.println(format!(
                    "{} {name}",
                    style(format!("[{}/{}]", index + 1, self.total_steps))
                        .bold()
                        .dim()
                ));
            },
            Event::StepFinished { .. } => {
                self.finish_bar();
                log::debug!("{event}");
            },
            Event::ChunkProgress { received, total } => {
                let pb = self.bytes_bar(*total);
                pb.set_position(*received);
            },
            Event::PayloadSent { bytes } => {
                self.println(format!(
                    "{} Sent {bytes} bytes, waiting for acknowledgement",
                    style("→").cyan()
                ));
            },
            Event::Retry { .. } => {
                self.println(format!("{} {event}", style("⚠").yellow()));
                log::debug!("{event}");
            },
            Event::UpdateProgress { percent } => {
                let pb = self.percent_bar();
                pb.set_message("updating");
                pb.set_position(u64::try_from((*percent).clamp(0, 100)).unwrap_or(0));
            },
            Event::StateTransition { to, .. } => {
                self.log.on_event(event);
                if *to == "awaiting-ready" {
                    if let Some(pb) = &self.bar {
                        pb.set_message("waiting for module");
                    }
                } else if *to == "done" {
                    self.finish_bar();
                    self.println(format!("{} Update applied", style("✓").green()));
                }
            },
            Event::SegmentReceived { offset, data } => {
                if log_enabled!(Level::Trace) {
                    for (row, chunk) in data
                        .chunks(DUMP_WIDTH)
                        .enumerate()
                    {
                        trace!(
                            "{:08X}  {}",
                            *offset + (row * DUMP_WIDTH) as u64,
                            hex_row(chunk)
                        );
                    }
                }
            },
            Event::Error { .. } => {
                if let Some(pb) = self.bar.take() {
                    pb.abandon();
                }
                log::debug!("{event}");
            },
            Event::CommandSent { .. } | Event::LineReceived { .. } => self.log.on_event(event),
        }
    }
}

/// Hex and printable-ASCII columns for one dump row.
fn hex_row(chunk: &[u8]) -> String {
    let hex: Vec<String> = chunk
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect();
    let ascii: String = chunk
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect();
    format!("{:<width$}  |{ascii}|", hex.join(" "), width = DUMP_WIDTH * 3 - 1)
}
