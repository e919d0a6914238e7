//! Session lifecycle: orchestration, cancellation escalation, and outcome
//! latching.
//!
//! One session is one end-to-end run of a user script. Two execution contexts
//! cooperate per session: the *control context* (the task inside [`begin`],
//! which owns the blocking wait and observes stop requests) and the *script
//! context* (a blocking thread driving the embedded engine and, transitively,
//! every dispatched call). The engine is cooperatively scheduled and cannot
//! be preempted mid-instruction, so cancellation is advisory until the grace
//! period elapses; after that the next operation start on the script context
//! raises, and the engine's progress hook catches scripts that never call in.
//!
//! All cross-context state lives in one [`SessionShared`] and is mutated only
//! through its guarded entry points. The terminal outcome is a latch: the
//! first writer wins, and later failures (including secondary errors during
//! teardown) do not replace it.
//!
//! [`begin`]: SessionController::begin

use crate::capability::{Capability, FeedbackChannel, PadView};
use crate::config::Settings;
use crate::context::{ExecutionContextTracker, OperationKind, OperationScope};
use crate::dispatch::{CallDispatcher, DispatchEnv, DispatchRequest, NativeValue};
use crate::error::{AppResult, BridgeError};
use crate::registry::CapabilityRegistry;
use crate::scripting::ScriptRuntime;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

// =============================================================================
// Outcome and report
// =============================================================================

/// Terminal outcome of one session. Exactly one is latched per run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The script ran to completion.
    Normal,
    /// A capability wrapper or the dispatcher raised. The message follows the
    /// fatal template and names the operation that was executing.
    FatalException { message: String },
    /// The engine reported an uncaught script error; there is no native error
    /// object, only the classified message.
    FatalMessage { message: String },
    /// The session was forcibly terminated after a stop request went
    /// unhonored for the grace period.
    Stopped,
}

impl Outcome {
    /// Everything except normal completion freezes the context tracker.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Outcome::Normal)
    }
}

/// What [`SessionController::begin`] returns once teardown has completed.
#[derive(Clone, Debug)]
pub struct SessionReport {
    pub name: String,
    pub outcome: Outcome,
    /// Deduplicated non-fatal warnings, in first-occurrence order.
    pub warnings: Vec<String>,
    /// Status lines the script sent through the feedback channel.
    pub feedback: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

// =============================================================================
// Error text contract
// =============================================================================

fn fatal_during(label: &str, cause: impl std::fmt::Display) -> String {
    format!("Fatal error occurred while executing the block labeled \"{label}\". {cause}")
}

fn fatal_after(label: &str, cause: impl std::fmt::Display) -> String {
    format!("Fatal error occurred after the block labeled \"{label}\" finished. {cause}")
}

fn missing_capability(identifier: &str) -> String {
    format!(
        "Could not find \"{identifier}\". The active configuration does not contain a capability named \"{identifier}\"."
    )
}

static MISSING_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    // Rhai reports unresolved names with these prefixes; other engines can be
    // added here without touching the classification logic.
    Regex::new(r"^(?:Function not found: ([A-Za-z_][A-Za-z0-9_]*)|Variable not found: ([A-Za-z_][A-Za-z0-9_]*))")
        .unwrap()
});

fn missing_identifier(message: &str) -> Option<String> {
    let captures = MISSING_IDENTIFIER.captures(message)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_string())
}

// =============================================================================
// Shared session state
// =============================================================================

struct SessionState {
    outcome: Option<Outcome>,
    stop_requested_at: Option<Instant>,
    force_stop: bool,
    warnings: Vec<String>,
    warned: HashSet<String>,
}

/// State shared between the control context and the script context for one
/// run. Owned by the session controller; capability wrappers and the engine
/// binding reach it only through [`SessionHandle`] and [`SessionLink`].
pub struct SessionShared {
    name: String,
    id: Uuid,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    settings: Settings,
    state: Mutex<SessionState>,
    tracker: ExecutionContextTracker,
}

impl SessionShared {
    pub(crate) fn new(name: &str, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            started_instant: Instant::now(),
            settings,
            state: Mutex::new(SessionState {
                outcome: None,
                stop_requested_at: None,
                force_stop: false,
                warnings: Vec::new(),
                warned: HashSet::new(),
            }),
            tracker: ExecutionContextTracker::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall-clock time since the session started.
    pub fn elapsed(&self) -> Duration {
        self.started_instant.elapsed()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// True once `request_stop` has been observed (cooperative phase
    /// included), so scripts can poll it and wind down gracefully.
    pub fn stop_requested(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.stop_requested_at.is_some() || state.force_stop
    }

    /// True once the grace period has elapsed and termination is being
    /// forced. Blocking capability calls poll this at bounded intervals.
    pub fn force_stop_pending(&self) -> bool {
        self.state.lock().unwrap().force_stop
    }

    /// Idempotent: only the first call records the cancellation timestamp.
    pub fn request_stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.stop_requested_at.is_none() {
            state.stop_requested_at = Some(Instant::now());
            tracing::info!(session = %self.name, "stop requested");
        }
    }

    /// First-writer-wins outcome latch. Returns whether this call latched.
    fn latch(&self, outcome: Outcome) -> bool {
        let fatal = outcome.is_fatal();
        let latched = {
            let mut state = self.state.lock().unwrap();
            if state.outcome.is_some() {
                false
            } else {
                state.outcome = Some(outcome);
                true
            }
        };
        if latched && fatal {
            self.tracker.freeze();
        }
        latched
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.state.lock().unwrap().outcome.clone()
    }

    /// Record a non-fatal warning, deduplicated by message text.
    pub fn warn_once(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state.lock().unwrap();
        if state.warned.insert(message.clone()) {
            tracing::warn!(session = %self.name, "{message}");
            state.warnings.push(message);
        }
    }

    fn warnings(&self) -> Vec<String> {
        self.state.lock().unwrap().warnings.clone()
    }

    /// Start an operation on the script context.
    ///
    /// Once a forced stop is pending this raises instead, which is how a
    /// session that ignored `request_stop` is terminated without engine-level
    /// preemption.
    pub fn begin_operation(
        &self,
        kind: OperationKind,
        subject: &str,
        suffix: &str,
    ) -> Result<OperationScope<'_>, BridgeError> {
        if self.force_stop_pending() {
            return Err(BridgeError::StopEnforced);
        }
        Ok(self.tracker.begin(kind, subject, suffix))
    }

    /// Label of the operation currently (or most recently) executing.
    pub fn current_label(&self) -> Option<String> {
        self.tracker.current_label()
    }

    /// Called once by the script context when evaluation finishes cleanly.
    pub fn on_script_completed(&self) {
        self.latch(Outcome::Normal);
    }

    /// Called by the engine's own error path for uncaught script errors.
    pub fn on_script_uncaught_error(&self, message: &str, label: Option<&str>) {
        if self.force_stop_pending() {
            tracing::debug!(session = %self.name, "engine error after forced stop suppressed");
            return;
        }
        let text = if let Some(identifier) = missing_identifier(message) {
            missing_capability(&identifier)
        } else if let Some(label) = label {
            fatal_during(label, message)
        } else if let Some(record) = self.tracker.current() {
            if record.finished {
                fatal_after(&record.label(), message)
            } else {
                fatal_during(&record.label(), message)
            }
        } else {
            message.to_string()
        };
        self.latch(Outcome::FatalMessage { message: text });
    }

    /// The only failure path for capability wrappers and the dispatcher.
    ///
    /// Wraps the cause with the current operation label, latches it as the
    /// fatal outcome, and hands back an error the caller must propagate so
    /// its control flow aborts immediately. Wrappers never self-recover.
    pub fn on_fatal_exception(&self, cause: anyhow::Error) -> anyhow::Error {
        let message = match self.current_label() {
            Some(label) => fatal_during(&label, format!("{cause:#}")),
            None => format!("{cause:#}"),
        };
        self.latch(Outcome::FatalException {
            message: message.clone(),
        });
        anyhow::anyhow!(message)
    }

    /// Promote an ignored stop request to forced termination once the grace
    /// period has elapsed. Returns whether this call did the promotion.
    fn escalate_if_overdue(&self) -> bool {
        let escalated = {
            let mut state = self.state.lock().unwrap();
            if state.force_stop {
                false
            } else {
                match state.stop_requested_at {
                    Some(at) if at.elapsed() >= self.settings.stop_grace_period => {
                        state.force_stop = true;
                        true
                    }
                    _ => false,
                }
            }
        };
        if escalated {
            tracing::warn!(session = %self.name, "stop not honored within grace period; forcing termination");
            self.latch(Outcome::Stopped);
        }
        escalated
    }
}

// =============================================================================
// Handles given to wrappers and the engine binding
// =============================================================================

/// Cloneable wrapper-facing view of the running session.
///
/// This is what contextual `Session` parameters resolve to: wrappers use it
/// to poll cancellation, emit deduplicated warnings, and route failures.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn elapsed(&self) -> Duration {
        self.shared.elapsed()
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    pub fn warn_once(&self, message: impl Into<String>) {
        self.shared.warn_once(message);
    }

    /// See [`SessionShared::on_fatal_exception`].
    pub fn fatal(&self, cause: anyhow::Error) -> anyhow::Error {
        self.shared.on_fatal_exception(cause)
    }
}

/// Why a host call did not return a value. The engine binding converts this
/// into a script-level raise.
#[derive(Clone, Debug)]
pub enum HostCallError {
    /// Forced termination; not an application failure and reported as such.
    Stopped,
    /// A fatal outcome was latched; the message is what the raise carries.
    Fatal(String),
}

/// The call-in/call-out boundary handed to the script runtime.
///
/// Every dispatched host call and every terminal engine event flows through
/// this link; the runtime has no other access to session state.
#[derive(Clone)]
pub struct SessionLink {
    shared: Arc<SessionShared>,
    dispatcher: Arc<CallDispatcher>,
    env: DispatchEnv,
}

impl SessionLink {
    pub fn settings(&self) -> &Settings {
        self.shared.settings()
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    pub fn force_stop_pending(&self) -> bool {
        self.shared.force_stop_pending()
    }

    pub fn on_script_completed(&self) {
        self.shared.on_script_completed();
    }

    pub fn on_script_uncaught_error(&self, message: &str, label: Option<&str>) {
        self.shared.on_script_uncaught_error(message, label);
    }

    /// The full dispatch path for one host call: start the operation record,
    /// resolve and invoke, end the record on every exit path, and route any
    /// failure through the fatal-exception latch.
    pub fn call(&self, request: DispatchRequest) -> Result<NativeValue, HostCallError> {
        let Some(spec) = self.dispatcher.lookup(&request.lookup_key) else {
            let raised = self.shared.on_fatal_exception(anyhow::Error::new(
                crate::dispatch::DispatchError::UnknownLookupKey(request.lookup_key.clone()),
            ));
            return Err(HostCallError::Fatal(raised.to_string()));
        };

        let subject = request
            .receiver_name
            .clone()
            .unwrap_or_else(|| spec.owner.to_string());
        let scope = match self.shared.begin_operation(spec.kind, &subject, spec.name) {
            Ok(scope) => scope,
            Err(_) => return Err(HostCallError::Stopped),
        };
        let result = self.dispatcher.invoke(&request, &self.env);
        drop(scope);

        result.map_err(|error| {
            let raised = self.shared.on_fatal_exception(anyhow::Error::new(error));
            HostCallError::Fatal(raised.to_string())
        })
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Everything a session run needs besides its source text.
pub struct SessionPlan {
    pub runtime: Arc<dyn ScriptRuntime>,
    pub dispatcher: Arc<CallDispatcher>,
    /// Identifier → capability pairs registered before execution starts.
    pub capabilities: Vec<(String, Arc<dyn Capability>)>,
    pub feedback: Arc<FeedbackChannel>,
    pub pads: [Arc<PadView>; 2],
}

impl SessionPlan {
    pub fn new(runtime: Arc<dyn ScriptRuntime>, dispatcher: Arc<CallDispatcher>) -> Self {
        Self {
            runtime,
            dispatcher,
            capabilities: Vec::new(),
            feedback: Arc::new(FeedbackChannel::new()),
            pads: [Arc::new(PadView::new()), Arc::new(PadView::new())],
        }
    }

    pub fn with_capability(
        mut self,
        identifier: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        self.capabilities.push((identifier.into(), capability));
        self
    }
}

enum ControllerPhase {
    Idle,
    Running {
        name: String,
        shared: Arc<SessionShared>,
    },
    TearingDown,
}

/// Orchestrates one script run end-to-end and is the sole decider of how a
/// session ends.
pub struct SessionController {
    settings: Settings,
    phase: Mutex<ControllerPhase>,
}

impl SessionController {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            phase: Mutex::new(ControllerPhase::Idle),
        }
    }

    /// Run one session to its terminal outcome.
    ///
    /// Fails without side effects if a session is running or a previous
    /// session's teardown is still in progress. Otherwise returns only after
    /// the outcome is known and the registry has been torn down.
    pub async fn begin(
        &self,
        name: &str,
        source: &str,
        plan: SessionPlan,
    ) -> AppResult<SessionReport> {
        let shared = {
            let mut phase = self.phase.lock().unwrap();
            match &*phase {
                ControllerPhase::Idle => {}
                ControllerPhase::Running { name: active, .. } => {
                    return Err(BridgeError::SessionActive(active.clone()));
                }
                ControllerPhase::TearingDown => return Err(BridgeError::TeardownPending),
            }
            let shared = SessionShared::new(name, self.settings.clone());
            *phase = ControllerPhase::Running {
                name: name.to_string(),
                shared: shared.clone(),
            };
            shared
        };
        tracing::info!(session = name, id = %shared.id(), "session starting");

        // Fresh registry per session, populated before the engine sees
        // anything. A duplicate identifier aborts the run before it starts.
        let registry = Arc::new(CapabilityRegistry::new());
        for (identifier, capability) in plan.capabilities {
            if let Err(error) = registry.register(&identifier, capability) {
                registry.unregister_all();
                *self.phase.lock().unwrap() = ControllerPhase::Idle;
                return Err(error);
            }
        }

        let feedback = plan.feedback.clone();
        let link = SessionLink {
            shared: shared.clone(),
            dispatcher: plan.dispatcher.clone(),
            env: DispatchEnv {
                session: SessionHandle::new(shared.clone()),
                registry: registry.clone(),
                feedback: feedback.clone(),
                pads: plan.pads.clone(),
            },
        };

        let runtime = plan.runtime.clone();
        let source = source.to_string();
        let mut script_task =
            tokio::spawn(async move { runtime.run_script(&source, link).await });

        // Blocking wait with bounded wakeups: each wakeup re-checks whether an
        // unhonored stop request must be escalated to forced termination.
        loop {
            tokio::select! {
                joined = &mut script_task => {
                    if let Err(join_error) = joined {
                        let cause = if join_error.is_panic() {
                            "The script context panicked"
                        } else {
                            "The script context was aborted"
                        };
                        let _ = shared.on_fatal_exception(anyhow::anyhow!(cause));
                    }
                    break;
                }
                _ = tokio::time::sleep(self.settings.completion_poll_interval) => {
                    shared.escalate_if_overdue();
                }
            }
        }

        let outcome = shared.outcome().unwrap_or_else(|| {
            // The runtime returned without reporting a terminal event; that is
            // a defect in the engine integration, not a silent success.
            tracing::error!(session = name, "script runtime reported no terminal event");
            Outcome::FatalMessage {
                message: "The script engine terminated without reporting a result.".to_string(),
            }
        });

        // Teardown runs off the async executor: capability shutdown hooks may
        // block, and `begin` must stay rejectable as teardown-in-progress.
        *self.phase.lock().unwrap() = ControllerPhase::TearingDown;
        let teardown_registry = registry.clone();
        if tokio::task::spawn_blocking(move || teardown_registry.unregister_all())
            .await
            .is_err()
        {
            tracing::error!(session = name, "capability teardown panicked");
        }
        *self.phase.lock().unwrap() = ControllerPhase::Idle;

        let report = SessionReport {
            name: name.to_string(),
            outcome,
            warnings: shared.warnings(),
            feedback: feedback.lines(),
            started_at: shared.started_at(),
            duration: shared.elapsed(),
        };
        tracing::info!(session = name, outcome = ?report.outcome, "session finished");
        Ok(report)
    }

    /// Ask the running session to stop. Idempotent; a no-op when no session
    /// is running.
    pub fn request_stop(&self) {
        if let ControllerPhase::Running { shared, .. } = &*self.phase.lock().unwrap() {
            shared.request_stop();
        }
    }
}
