//! Firmware update monitoring after a module reset.
//!
//! Once the module restarts into its updater it reports progress lines, then
//! a success marker, then (after another restart) a ready marker. The monitor
//! is a small state machine over those lines:
//!
//! ```text
//! AwaitingSuccess --success--> AwaitingReady --ready--> Done
//! ```
//!
//! A ready marker seen before success is ignored: the module restarts once
//! before the update is applied.

use {
    crate::{
        error::{Error, Result, UpdatePhase},
        event::{Event, Observer},
        frame::{DEFAULT_MAX_LINE, FrameReader, number_after},
    },
    log::{debug, info},
    std::time::{Duration, Instant},
};

/// Markers and limits for an update.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Prefix of progress lines, followed by a number.
    pub progress_prefix: String,
    /// Line marking a successful update.
    pub success_marker: String,
    /// Line marking the module ready for commands again.
    pub ready_marker: String,
    /// Ceiling for the whole update.
    pub overall_timeout: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            progress_prefix: "+CFOTA: UPDATE:".to_string(),
            success_marker: "+CFOTA: UPDATE SUCCESS".to_string(),
            ready_marker: "QCRDY".to_string(),
            overall_timeout: Duration::from_secs(600),
        }
    }
}

/// Monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Waiting for the success marker.
    AwaitingSuccess,
    /// Success seen, waiting for the ready marker.
    AwaitingReady,
    /// Update finished.
    Done,
}

impl UpdateState {
    fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingSuccess => "awaiting-success",
            Self::AwaitingReady => "awaiting-ready",
            Self::Done => "done",
        }
    }
}

/// What a single line means to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Progress report with its value.
    Progress(i32),
    /// Update succeeded.
    Success,
    /// Module ready.
    Ready,
    /// Anything else.
    Other,
}

/// Summary of a completed update.
#[derive(Debug, Clone, Copy)]
pub struct UpdateReport {
    /// Time from start until ready.
    pub elapsed: Duration,
    /// Last progress value reported, -1 if none.
    pub last_progress: i32,
}

/// Tracks an update from progress lines to the ready marker.
#[derive(Debug)]
pub struct UpdateMonitor {
    config: UpdateConfig,
    state: UpdateState,
    last_progress: i32,
}

impl UpdateMonitor {
    /// Create a monitor in [`UpdateState::AwaitingSuccess`].
    pub fn new(config: UpdateConfig) -> Self {
        Self {
            config,
            state: UpdateState::AwaitingSuccess,
            last_progress: -1,
        }
    }

    /// Current state.
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Last progress value, -1 until one was seen.
    pub fn last_progress(&self) -> i32 {
        self.last_progress
    }

    /// Classify one line without changing state.
    pub fn classify(&self, line: &str) -> LineKind {
        if line.contains(&self.config.progress_prefix) {
            return number_after(line, &self.config.progress_prefix)
                .and_then(|n| i32::try_from(n).ok())
                .map_or(LineKind::Other, LineKind::Progress);
        }
        if line.contains(&self.config.success_marker) {
            return LineKind::Success;
        }
        if line.contains(&self.config.ready_marker) {
            return LineKind::Ready;
        }
        LineKind::Other
    }

    /// Feed one line and report events for it.
    ///
    /// Progress is reported only when the value changes. Returns whether the
    /// line changed anything.
    pub fn observe(&mut self, line: &str, observer: &mut dyn Observer) -> bool {
        match self.classify(line) {
            LineKind::Progress(percent) => {
                if percent == self.last_progress {
                    return false;
                }
                self.last_progress = percent;
                debug!("Update progress: {percent}");
                observer.on_event(&Event::UpdateProgress { percent });
                true
            },
            LineKind::Success if self.state == UpdateState::AwaitingSuccess => {
                info!("Firmware update succeeded, waiting for module");
                self.transition(UpdateState::AwaitingReady, observer);
                true
            },
            LineKind::Ready if self.state == UpdateState::AwaitingReady => {
                info!("Module ready");
                self.transition(UpdateState::Done, observer);
                true
            },
            LineKind::Ready => {
                debug!("Ignoring ready marker before update success");
                false
            },
            LineKind::Success | LineKind::Other => false,
        }
    }

    fn transition(&mut self, to: UpdateState, observer: &mut dyn Observer) {
        observer.on_event(&Event::StateTransition {
            from: self.state.as_str(),
            to: to.as_str(),
        });
        self.state = to;
    }

    /// Consume lines until the module is ready or the ceiling is reached.
    pub fn run(&mut self, reader: &FrameReader, observer: &mut dyn Observer) -> Result<UpdateReport> {
        let start = Instant::now();
        let ceiling = self.config.overall_timeout;
        info!("Monitoring firmware update (up to {ceiling:?})");

        while self.state != UpdateState::Done {
            let remaining = ceiling.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(self.timeout_error());
            }
            let Some(line) = reader.next_line(DEFAULT_MAX_LINE, remaining)? else {
                continue;
            };
            observer.on_event(&Event::LineReceived { line: &line });
            self.observe(&String::from_utf8_lossy(&line), observer);
        }

        Ok(UpdateReport {
            elapsed: start.elapsed(),
            last_progress: self.last_progress,
        })
    }

    fn timeout_error(&self) -> Error {
        let phase = match self.state {
            UpdateState::AwaitingSuccess => UpdatePhase::NoSuccess,
            UpdateState::AwaitingReady | UpdateState::Done => UpdatePhase::NotReady,
        };
        Error::UpdateTimeout {
            phase,
            timeout: self.config.overall_timeout,
            last_progress: self.last_progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{cancel::CancelToken, frame::PollConfig, ring::RingBuffer},
        std::sync::Arc,
    };

    fn status_config(timeout: Duration) -> UpdateConfig {
        UpdateConfig {
            progress_prefix: "+STATUS: UPDATE:".to_string(),
            success_marker: "+STATUS: UPDATE SUCCESS".to_string(),
            ready_marker: "READY".to_string(),
            overall_timeout: timeout,
        }
    }

    fn reader_with(bytes: &[u8]) -> FrameReader {
        let ring = Arc::new(RingBuffer::new(1024));
        ring.put_bulk(bytes);
        FrameReader::new(ring, PollConfig::default(), CancelToken::new())
    }

    #[test]
    fn test_classify() {
        let monitor = UpdateMonitor::new(UpdateConfig::default());
        assert_eq!(monitor.classify("+CFOTA: UPDATE:42\r\n"), LineKind::Progress(42));
        assert_eq!(monitor.classify("+CFOTA: UPDATE SUCCESS\r\n"), LineKind::Success);
        assert_eq!(monitor.classify("QCRDY\r\n"), LineKind::Ready);
        assert_eq!(monitor.classify("+CPIN: READY\r\n"), LineKind::Other);
        assert_eq!(monitor.classify("+CFOTA: UPDATE:\r\n"), LineKind::Other);
    }

    #[test]
    fn test_full_sequence_completes() {
        let reader = reader_with(
            b"+STATUS: UPDATE:10\r\n+STATUS: UPDATE:55\r\n+STATUS: UPDATE:100\r\n\
              +STATUS: UPDATE SUCCESS\r\nREADY\r\n",
        );
        let mut progress = Vec::new();
        let mut transitions = Vec::new();
        let mut observer = |event: &Event<'_>| match event {
            Event::UpdateProgress { percent } => progress.push(*percent),
            Event::StateTransition { to, .. } => transitions.push(*to),
            _ => {},
        };

        let mut monitor = UpdateMonitor::new(status_config(Duration::from_secs(2)));
        let report = monitor
            .run(&reader, &mut observer)
            .unwrap();

        assert_eq!(report.last_progress, 100);
        assert_eq!(monitor.state(), UpdateState::Done);
        assert_eq!(progress, vec![10, 55, 100]);
        assert_eq!(transitions, vec!["awaiting-ready", "done"]);
    }

    #[test]
    fn test_duplicate_progress_reported_once() {
        let mut monitor = UpdateMonitor::new(UpdateConfig::default());
        let mut count = 0;
        let mut observer = |event: &Event<'_>| {
            if matches!(event, Event::UpdateProgress { .. }) {
                count += 1;
            }
        };
        assert!(monitor.observe("+CFOTA: UPDATE:30", &mut observer));
        assert!(!monitor.observe("+CFOTA: UPDATE:30", &mut observer));
        assert!(monitor.observe("+CFOTA: UPDATE:31", &mut observer));
        assert_eq!(count, 2);
    }

    #[test]
    fn test_ready_before_success_is_ignored() {
        let mut monitor = UpdateMonitor::new(UpdateConfig::default());
        let mut observer = |_: &Event<'_>| {};
        assert!(!monitor.observe("QCRDY", &mut observer));
        assert_eq!(monitor.state(), UpdateState::AwaitingSuccess);
        assert!(monitor.observe("+CFOTA: UPDATE SUCCESS", &mut observer));
        assert!(monitor.observe("QCRDY", &mut observer));
        assert_eq!(monitor.state(), UpdateState::Done);
    }

    #[test]
    fn test_timeout_without_ready_reports_not_ready() {
        let reader = reader_with(b"+STATUS: UPDATE:100\r\n+STATUS: UPDATE SUCCESS\r\n");
        let mut observer = |_: &Event<'_>| {};
        let mut monitor = UpdateMonitor::new(status_config(Duration::from_millis(50)));

        match monitor.run(&reader, &mut observer) {
            Err(Error::UpdateTimeout {
                phase,
                last_progress,
                ..
            }) => {
                assert_eq!(phase, UpdatePhase::NotReady);
                assert_eq!(last_progress, 100);
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_without_success_reports_no_success() {
        let reader = reader_with(b"READY\r\n");
        let mut observer = |_: &Event<'_>| {};
        let mut monitor = UpdateMonitor::new(status_config(Duration::from_millis(50)));

        match monitor.run(&reader, &mut observer) {
            Err(Error::UpdateTimeout { phase, .. }) => assert_eq!(phase, UpdatePhase::NoSuccess),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
