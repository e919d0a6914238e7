//! Execution context tracking for error attribution and stuck-script
//! detection.
//!
//! Each session keeps exactly one live [`OperationRecord`] describing the
//! script operation currently executing. Capability call sites overwrite it
//! when an operation starts and mark it finished when the operation ends, so
//! that when something goes wrong the session controller can say *which*
//! operation was (or had just been) running.
//!
//! Pairing of start/end is guaranteed structurally: starting an operation
//! returns an [`OperationScope`] whose `Drop` performs the end, covering
//! every exit path including early returns and panics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// What kind of script operation is executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// An engine-driven callback into a script-defined handler.
    EventCallback,
    /// Construction of a host object handed back to the script.
    Creation,
    /// Reading a property of a capability.
    PropertyGet,
    /// Writing a property of a capability.
    PropertySet,
    /// An ordinary method call.
    Call,
    /// Anything that does not fit the other kinds.
    Special,
}

/// The single live operation record of a session.
#[derive(Clone, Debug)]
pub struct OperationRecord {
    pub kind: OperationKind,
    /// First label part: the receiver or owning type.
    pub subject: String,
    /// Second label part: the member name, empty where the kind has none.
    pub suffix: String,
    /// Set once the operation's end has been observed.
    pub finished: bool,
}

impl OperationRecord {
    /// Renders the fixed, kind-specific label phrase.
    ///
    /// These phrases appear verbatim in user-facing fatal messages and are a
    /// stable contract: `call X.Y`, `get X.Y`, `set X.Y to`, `new X`,
    /// `to X`.
    pub fn label(&self) -> String {
        match self.kind {
            OperationKind::Call => format!("call {}.{}", self.subject, self.suffix),
            OperationKind::PropertyGet => format!("get {}.{}", self.subject, self.suffix),
            OperationKind::PropertySet => format!("set {}.{} to", self.subject, self.suffix),
            OperationKind::Creation => format!("new {}", self.subject),
            OperationKind::EventCallback => format!("to {}", self.subject),
            OperationKind::Special => {
                if self.suffix.is_empty() {
                    self.subject.clone()
                } else {
                    format!("{}{}", self.subject, self.suffix)
                }
            }
        }
    }
}

/// Per-session tracker holding the single live operation record.
///
/// Start/end strictly alternate on the script context; nothing else writes
/// the record. Once a fatal outcome is latched the tracker is frozen and
/// `end_operation` becomes a no-op, preserving the record that was live when
/// the failure happened.
pub struct ExecutionContextTracker {
    record: Mutex<Option<OperationRecord>>,
    frozen: AtomicBool,
}

impl ExecutionContextTracker {
    pub fn new() -> Self {
        Self {
            record: Mutex::new(None),
            frozen: AtomicBool::new(false),
        }
    }

    /// Overwrite the live record and return the scope that ends it on drop.
    pub fn begin(&self, kind: OperationKind, subject: &str, suffix: &str) -> OperationScope<'_> {
        let record = OperationRecord {
            kind,
            subject: subject.to_string(),
            suffix: suffix.to_string(),
            finished: false,
        };
        tracing::trace!(label = %record.label(), "operation start");
        *self.record.lock().unwrap() = Some(record);
        OperationScope { tracker: self }
    }

    fn end_operation(&self) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        if let Some(record) = self.record.lock().unwrap().as_mut() {
            record.finished = true;
        }
    }

    /// Stop mutating the record; called when a fatal outcome latches.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Clone of the live record, if any operation has started.
    pub fn current(&self) -> Option<OperationRecord> {
        self.record.lock().unwrap().clone()
    }

    /// Label of the live record, if any.
    pub fn current_label(&self) -> Option<String> {
        self.current().map(|record| record.label())
    }
}

impl Default for ExecutionContextTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Ends the operation it was created for when dropped.
pub struct OperationScope<'a> {
    tracker: &'a ExecutionContextTracker,
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        self.tracker.end_operation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: OperationKind, subject: &str, suffix: &str) -> OperationRecord {
        OperationRecord {
            kind,
            subject: subject.to_string(),
            suffix: suffix.to_string(),
            finished: false,
        }
    }

    #[test]
    fn test_label_phrases() {
        assert_eq!(
            record(OperationKind::Call, "left_motor", "run").label(),
            "call left_motor.run"
        );
        assert_eq!(
            record(OperationKind::PropertyGet, "range", "distance_mm").label(),
            "get range.distance_mm"
        );
        assert_eq!(
            record(OperationKind::PropertySet, "left_motor", "power").label(),
            "set left_motor.power to"
        );
        assert_eq!(record(OperationKind::Creation, "Timer", "").label(), "new Timer");
        assert_eq!(
            record(OperationKind::EventCallback, "run_started", "").label(),
            "to run_started"
        );
        assert_eq!(record(OperationKind::Special, "stop", "").label(), "stop");
    }

    #[test]
    fn test_scope_marks_finished_on_drop() {
        let tracker = ExecutionContextTracker::new();
        {
            let _scope = tracker.begin(OperationKind::Call, "a", "b");
            assert!(!tracker.current().unwrap().finished);
        }
        assert!(tracker.current().unwrap().finished);
    }

    #[test]
    fn test_scope_pairs_on_early_exit() {
        let tracker = ExecutionContextTracker::new();
        let failing = |tracker: &ExecutionContextTracker| -> Result<(), ()> {
            let _scope = tracker.begin(OperationKind::PropertySet, "m", "power");
            Err(())
        };
        assert!(failing(&tracker).is_err());
        assert!(tracker.current().unwrap().finished);
    }

    #[test]
    fn test_frozen_tracker_keeps_unfinished_record() {
        let tracker = ExecutionContextTracker::new();
        let scope = tracker.begin(OperationKind::Call, "a", "b");
        tracker.freeze();
        drop(scope);
        // The record that was live at the failure stays unfinished.
        assert!(!tracker.current().unwrap().finished);
    }

    #[test]
    fn test_new_start_overwrites_previous_record() {
        let tracker = ExecutionContextTracker::new();
        drop(tracker.begin(OperationKind::Call, "a", "b"));
        let _scope = tracker.begin(OperationKind::Creation, "Timer", "");
        assert_eq!(tracker.current_label().unwrap(), "new Timer");
    }
}
