//! Capability surface shared between the host and dispatched script calls.
//!
//! A capability object exposes one coherent area of host functionality
//! (a motor, a sensor, a feedback channel) to a script session. Capability
//! objects are registered per session and torn down with it; the dispatcher
//! resolves receivers against the registry by declared type plus name.
//!
//! # Thread Safety
//!
//! Capability objects are shared between the script context (which calls
//! them through dispatched thunks) and the control context (which shuts them
//! down at teardown), so every implementation must be `Send + Sync`.

use std::any::Any;
use std::sync::Mutex;

/// One coherent area of host functionality exposed to a script session.
pub trait Capability: Send + Sync {
    /// Declared type name used for receiver resolution (e.g. `"Motor"`).
    fn type_name(&self) -> &'static str;

    /// Upcast for concrete access from invocation thunks.
    fn as_any(&self) -> &dyn Any;

    /// Release hook invoked exactly once at session teardown.
    fn shutdown(&self) {}
}

/// User-feedback channel: ordered status lines surfaced to whoever is
/// watching the run.
///
/// Lines are retained for the session report in addition to being logged, so
/// a headless host can still show the user what the script said.
pub struct FeedbackChannel {
    lines: Mutex<Vec<String>>,
}

impl FeedbackChannel {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
        }
    }

    /// Append one status line.
    pub fn say(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(target: "rig_script::feedback", "{line}");
        self.lines.lock().unwrap().push(line);
    }

    /// Snapshot of every line said so far, in order.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Default for FeedbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Instantaneous state of one operator control pad.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PadSnapshot {
    pub button_a: bool,
    pub button_b: bool,
    pub left_x: f64,
    pub left_y: f64,
    pub right_x: f64,
    pub right_y: f64,
    pub trigger: f64,
}

/// Host-updated view of one control pad, readable from dispatched calls.
///
/// The host overwrites the snapshot whenever new pad input arrives; script
/// calls observe whichever snapshot is current at dispatch time.
pub struct PadView {
    snapshot: Mutex<PadSnapshot>,
}

impl PadView {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(PadSnapshot::default()),
        }
    }

    /// Replace the current snapshot with fresh input.
    pub fn update(&self, snapshot: PadSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    /// The snapshot current at this instant.
    pub fn snapshot(&self) -> PadSnapshot {
        self.snapshot.lock().unwrap().clone()
    }
}

impl Default for PadView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_retains_lines_in_order() {
        let feedback = FeedbackChannel::new();
        feedback.say("first");
        feedback.say("second");
        assert_eq!(feedback.lines(), vec!["first", "second"]);
    }

    #[test]
    fn test_pad_view_update_and_snapshot() {
        let pad = PadView::new();
        assert_eq!(pad.snapshot(), PadSnapshot::default());

        pad.update(PadSnapshot {
            button_a: true,
            left_x: 0.5,
            ..PadSnapshot::default()
        });
        let snap = pad.snapshot();
        assert!(snap.button_a);
        assert_eq!(snap.left_x, 0.5);
    }
}
