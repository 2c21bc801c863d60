//! Failure Detector
//!
//! Decides, per session instance, when cleaned terminal output is evaluated
//! against the [`PatternBank`]. The detector is a plain state machine: every
//! method takes `now` explicitly, so callers own the clock.
//!
//! ## Gating
//!
//! Output is only scanned when all of the following hold:
//!
//! 1. detection has been enabled, either by the post-spawn delay expiring or
//!    by the user typing a real command after a resume;
//! 2. nothing has been reported yet for this instance;
//! 3. the buffered text is old enough (settle window) and was produced after
//!    detection was last enabled;
//! 4. the evaluation window holds at least `min_scan_chars` characters;
//! 5. at least `enable_delay` has passed since the process started, even if
//!    a resume flow re-enabled detection earlier.
//!
//! ## Resume suppression
//!
//! A resume command, seen either in output (history selection echoes it) or
//! typed as input, replays old conversation text that may contain failure
//! wording. Detection is switched off until the next non-control input.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::patterns::PatternBank;

/// Tunables for the detector
#[derive(Clone, Debug)]
pub struct DetectionSettings {
    /// Delay after spawn before detection switches on
    pub enable_delay: Duration,
    /// Minimum age of buffered text before it is scanned
    pub settle: Duration,
    /// How long buffered text is retained
    pub retention: Duration,
    /// Minimum evaluation window length, in characters
    pub min_scan_chars: usize,
    /// Session-control command that starts a resume flow
    pub resume_marker: String,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            enable_delay: Duration::from_secs(5),
            settle: Duration::from_secs(3),
            retention: Duration::from_secs(10),
            min_scan_chars: 50,
            resume_marker: "/resume".to_string(),
        }
    }
}

/// A detected credential/quota failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub pattern: String,
    pub reason: String,
}

#[derive(Clone, Debug)]
struct TimedChunk {
    at: Instant,
    text: String,
}

pub struct FailureDetector {
    bank: Arc<PatternBank>,
    settings: DetectionSettings,
    started_at: Instant,
    timed_output: VecDeque<TimedChunk>,
    enabled: bool,
    enabled_at: Option<Instant>,
    detected: bool,
    /// Never cleared: one report per instance, even across re-enables
    reported: bool,
    waiting_for_next_input: bool,
}

impl FailureDetector {
    pub fn new(bank: Arc<PatternBank>, settings: DetectionSettings, started_at: Instant) -> Self {
        Self {
            bank,
            settings,
            started_at,
            timed_output: VecDeque::new(),
            enabled: false,
            enabled_at: None,
            detected: false,
            reported: false,
            waiting_for_next_input: false,
        }
    }

    /// Switch detection on once the post-spawn delay has elapsed.
    ///
    /// Ignored while a resume flow is waiting for the next input. Returns
    /// whether detection is now enabled.
    pub fn enable(&mut self, now: Instant) -> bool {
        if self.waiting_for_next_input {
            debug!("Detection enable skipped: waiting for next input");
            return false;
        }
        if !self.enabled {
            self.enabled = true;
            self.enabled_at = Some(now);
        }
        true
    }

    /// Feed one chunk of clean (escape-free) output.
    pub fn observe_output(&mut self, now: Instant, clean: &str) -> Option<Failure> {
        if self.contains_resume_marker(clean) {
            debug!("Resume marker in output, suppressing detection");
            self.suppress();
        }

        self.timed_output.push_back(TimedChunk {
            at: now,
            text: clean.to_string(),
        });
        let retention = self.settings.retention;
        while let Some(front) = self.timed_output.front() {
            if now.saturating_duration_since(front.at) > retention {
                self.timed_output.pop_front();
            } else {
                break;
            }
        }

        if !self.enabled || self.detected || self.reported {
            return None;
        }
        if now.saturating_duration_since(self.started_at) < self.settings.enable_delay {
            return None;
        }

        let window = self.evaluation_window(now);
        if window.chars().count() < self.settings.min_scan_chars {
            return None;
        }

        let found = self.bank.find(&window)?;
        debug!(
            "Failure pattern '{}' matched: {:?}",
            found.name, found.matched
        );
        self.detected = true;
        self.reported = true;
        self.timed_output.clear();
        Some(Failure {
            pattern: found.name,
            reason: found.reason,
        })
    }

    /// Feed one chunk of user input (as written to the PTY).
    pub fn observe_input(&mut self, now: Instant, input: &str) {
        let marker = self.settings.resume_marker.to_lowercase();
        let typed = input.trim().to_lowercase();
        if !marker.is_empty()
            && typed.starts_with(&marker)
            && is_command_token(&typed, 0, marker.len())
        {
            debug!("Resume command typed, suppressing detection");
            self.suppress();
            return;
        }

        if self.waiting_for_next_input && !is_control_input(input) {
            debug!("Real input after resume, re-enabling detection");
            self.timed_output.clear();
            self.detected = false;
            self.enabled = true;
            self.enabled_at = Some(now);
            self.waiting_for_next_input = false;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_detected(&self) -> bool {
        self.detected
    }

    pub fn is_waiting_for_next_input(&self) -> bool {
        self.waiting_for_next_input
    }

    pub fn buffered_chunks(&self) -> usize {
        self.timed_output.len()
    }

    fn suppress(&mut self) {
        self.enabled = false;
        self.waiting_for_next_input = true;
        self.timed_output.clear();
    }

    /// The marker counts only as a standalone command (after a prompt glyph
    /// or whitespace), never as part of a path like `~/src/resume-parser`
    fn contains_resume_marker(&self, clean: &str) -> bool {
        let marker = self.settings.resume_marker.to_lowercase();
        if marker.is_empty() {
            return false;
        }
        let text = clean.to_lowercase();
        text.match_indices(&marker)
            .any(|(at, _)| is_command_token(&text, at, marker.len()))
    }

    fn evaluation_window(&self, now: Instant) -> String {
        self.timed_output
            .iter()
            .filter(|chunk| self.enabled_at.is_none_or(|at| chunk.at >= at))
            .filter(|chunk| now.saturating_duration_since(chunk.at) >= self.settings.settle)
            .map(|chunk| chunk.text.as_str())
            .collect()
    }
}

/// Whether `text[at..at + len]` stands alone: not glued to a path or word
/// on the left, and followed by whitespace or the end of the text
fn is_command_token(text: &str, at: usize, len: usize) -> bool {
    let before = text[..at].chars().next_back();
    let after = text[at + len..].chars().next();
    before.is_none_or(|c| !is_path_char(c)) && after.is_none_or(char::is_whitespace)
}

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '/' | '\\' | '~' | '.' | '_' | '-')
}

/// Whether an input chunk is a bare control key rather than a typed command.
///
/// Classification looks at the first character (not byte), so multi-byte
/// UTF-8 text is never mistaken for a control sequence.
pub fn is_control_input(input: &str) -> bool {
    match input.chars().next() {
        None => true,
        Some(c) => c == '\x1b' || (c as u32) < 0x20 || c == '\x7f',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAILING: &str =
        "API Error: 402 {\"error\":\"insufficient credits for this request, please top up\"}";

    fn detector(started_at: Instant) -> FailureDetector {
        FailureDetector::new(
            Arc::new(PatternBank::default()),
            DetectionSettings::default(),
            started_at,
        )
    }

    fn secs(n: f64) -> Duration {
        Duration::from_secs_f64(n)
    }

    #[test]
    fn test_disabled_detector_never_reports() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        assert!(d.observe_output(t0, FAILING).is_none());
        assert!(d.observe_output(t0 + secs(8.0), FAILING).is_none());
        assert!(!d.is_detected());
    }

    #[test]
    fn test_reports_once_after_settle_window() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.enable(t0 + secs(5.0));
        assert!(d.observe_output(t0 + secs(6.0), FAILING).is_none());
        // First chunk is now 3.5s old
        let failure = d.observe_output(t0 + secs(9.5), "tick").unwrap();
        assert_eq!(failure.pattern, "insufficient_credits");
        assert_eq!(failure.reason, "Insufficient credits");
        assert!(d.is_detected());
        assert_eq!(d.buffered_chunks(), 0);

        // Latched
        d.observe_output(t0 + secs(10.0), FAILING);
        assert!(d.observe_output(t0 + secs(14.0), FAILING).is_none());
    }

    #[test]
    fn test_unsettled_text_is_not_scanned() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.enable(t0 + secs(5.0));
        d.observe_output(t0 + secs(6.0), FAILING);
        assert!(d.observe_output(t0 + secs(8.9), "tick").is_none());
    }

    #[test]
    fn test_short_windows_are_ignored() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.enable(t0 + secs(5.0));
        d.observe_output(t0 + secs(5.0), "insufficient credits");
        assert!(d.observe_output(t0 + secs(8.5), "x").is_none());
    }

    #[test]
    fn test_text_before_enable_is_excluded() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.observe_output(t0 + secs(1.0), FAILING);
        d.enable(t0 + secs(5.0));
        assert!(d.observe_output(t0 + secs(6.0), "still booting").is_none());
        assert!(d.observe_output(t0 + secs(9.5), "more output").is_none());
    }

    #[test]
    fn test_retention_drops_old_chunks() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.observe_output(t0, "old");
        d.observe_output(t0 + secs(5.0), "mid");
        d.observe_output(t0 + secs(10.5), "new");
        assert_eq!(d.buffered_chunks(), 2);
    }

    #[test]
    fn test_resume_in_output_suppresses_until_real_input() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.enable(t0 + secs(5.0));

        d.observe_output(t0 + secs(6.0), "> /resume");
        assert!(d.is_waiting_for_next_input());
        assert!(!d.is_enabled());
        d.observe_output(t0 + secs(6.5), FAILING);
        assert!(d.observe_output(t0 + secs(12.0), FAILING).is_none());

        // Navigation keys do not count
        d.observe_input(t0 + secs(13.0), "\x1b[A");
        d.observe_input(t0 + secs(13.0), "\r");
        assert!(d.is_waiting_for_next_input());

        d.observe_input(t0 + secs(14.0), "ls");
        assert!(d.is_enabled());
        assert!(!d.is_waiting_for_next_input());
        assert_eq!(d.buffered_chunks(), 0);

        d.observe_output(t0 + secs(15.0), FAILING);
        assert!(d.observe_output(t0 + secs(18.5), "tick").is_some());
    }

    #[test]
    fn test_typed_resume_command_suppresses() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.enable(t0 + secs(5.0));
        d.observe_input(t0 + secs(6.0), "  /RESUME\r");
        assert!(d.is_waiting_for_next_input());
        assert!(!d.is_enabled());
    }

    #[test]
    fn test_enable_timer_ignored_while_waiting() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.observe_output(t0 + secs(1.0), "\u{276f} /resume");
        assert!(!d.enable(t0 + secs(5.0)));
        assert!(!d.is_enabled());
    }

    #[test]
    fn test_paths_containing_the_marker_do_not_suppress() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.enable(t0 + secs(5.0));
        d.observe_output(t0 + secs(6.0), "~/src/resume-parser $ ls");
        d.observe_output(t0 + secs(6.1), "cd /home/me/resume\r\n");
        d.observe_output(t0 + secs(6.2), "drwxr-xr-x  docs/resume_backup\r\n");
        assert!(d.is_enabled());
        assert!(!d.is_waiting_for_next_input());

        d.observe_input(t0 + secs(7.0), "/resume-parser --help\r");
        assert!(d.is_enabled());

        d.observe_output(t0 + secs(8.0), "\u{2502} /resume   continue a past session");
        assert!(d.is_waiting_for_next_input());
    }

    #[test]
    fn test_early_reenable_still_waits_out_startup_delay() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.observe_input(t0 + secs(1.0), "/resume");
        d.observe_input(t0 + secs(1.5), "ls");
        assert!(d.is_enabled());

        d.observe_output(t0 + secs(1.5), FAILING);
        assert!(d.observe_output(t0 + secs(4.6), "tick").is_none());
        assert!(d.observe_output(t0 + secs(5.1), "tick").is_some());
    }

    #[test]
    fn test_at_most_one_report_per_instance() {
        let t0 = Instant::now();
        let mut d = detector(t0);
        d.enable(t0 + secs(5.0));
        d.observe_output(t0 + secs(5.0), FAILING);
        assert!(d.observe_output(t0 + secs(8.5), "tick").is_some());

        d.observe_input(t0 + secs(9.0), "/resume");
        d.observe_input(t0 + secs(10.0), "hello");
        assert!(!d.is_detected());
        d.observe_output(t0 + secs(11.0), FAILING);
        assert!(d.observe_output(t0 + secs(14.5), "tick").is_none());
    }

    #[test]
    fn test_control_input_classification() {
        assert!(is_control_input(""));
        assert!(is_control_input("\r"));
        assert!(is_control_input("\x7f"));
        assert!(is_control_input("\x1b[B"));
        assert!(is_control_input("\x03"));
        assert!(!is_control_input("ls"));
        assert!(!is_control_input(" "));
        assert!(!is_control_input("é"));
        assert!(!is_control_input("日本"));
    }
}
