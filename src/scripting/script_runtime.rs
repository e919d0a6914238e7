//! Engine-agnostic runtime interface.
//!
//! Keeping the engine behind a trait keeps the session controller, the
//! dispatcher, and the context tracker free of engine types: a different
//! embedded language only needs a new implementation of [`ScriptRuntime`].

use crate::session::SessionLink;
use async_trait::async_trait;
use std::fmt;

/// A compile-time fault in a script, reported without executing it.
#[derive(Debug, Clone)]
pub struct ScriptFault {
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Compile error: {}", self.message)?;
        if let Some(line) = self.line {
            write!(f, " at line {line}")?;
        }
        if let Some(column) = self.column {
            write!(f, ", column {column}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptFault {}

/// The embedded engine behind a call-in/call-out boundary.
///
/// # Contract
///
/// - `run_script` executes on a blocking thread and does not return early on
///   script errors; it reports exactly one terminal event through the link
///   (`on_script_completed` or `on_script_uncaught_error`) before returning.
/// - Every host call the script makes goes through
///   [`SessionLink::call`]; the runtime adds no other host surface.
/// - The runtime re-checks [`SessionLink::force_stop_pending`] at bounded
///   intervals (a progress hook or equivalent) so a script that never calls
///   into the host still terminates after a forced stop.
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Execute `source` to its terminal event.
    async fn run_script(&self, source: &str, link: SessionLink);

    /// Compile-check `source` without executing it.
    async fn validate(&self, source: &str) -> Result<(), ScriptFault>;

    /// Human-readable engine name for logs.
    fn engine_name(&self) -> &str;
}
