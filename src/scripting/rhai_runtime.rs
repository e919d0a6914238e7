//! Rhai implementation of the script runtime boundary.
//!
//! Rhai is an embeddable scripting language with Rust-like syntax; evaluation
//! is single-threaded and cooperatively scheduled, so the host cannot preempt
//! a script mid-instruction. This runtime builds a fresh, sandboxed engine
//! per run and registers the bridge call-in surface on it:
//!
//! - `host_call(key, [receiver,] json_args [, natives])`: the generic
//!   dispatch path into host capabilities. Pass `""` for a receiverless call
//!   when supplying natives, and `()` for native slots with no typed value.
//! - `stop_requested()`: cooperative cancellation poll.
//! - `sleep_ms(ms)`: blocking sleep that re-checks the interruption flag at
//!   the configured bounded interval.
//!
//! The engine's progress hook serves two safety duties: it terminates
//! evaluation once a forced stop is pending (covering scripts that never call
//! into the host), and it enforces the configured operation ceiling against
//! runaway loops.

use super::script_runtime::{ScriptFault, ScriptRuntime};
use crate::dispatch::{DispatchRequest, HostHandle, NativeValue, MAX_ARITY};
use crate::session::{HostCallError, SessionLink};
use async_trait::async_trait;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Position};
use std::time::{Duration, Instant};

/// Termination token raised when a forced stop interrupts evaluation.
const STOP_TOKEN: &str = "session stop enforced";

/// Stateless runtime; each run gets its own engine so sessions cannot leak
/// state into one another.
pub struct RhaiRuntime;

impl RhaiRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RhaiRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptRuntime for RhaiRuntime {
    async fn run_script(&self, source: &str, link: SessionLink) {
        let source = source.to_string();
        let joined = tokio::task::spawn_blocking(move || {
            let engine = build_engine(&link);
            match engine.eval::<Dynamic>(&source) {
                Ok(_) => link.on_script_completed(),
                Err(error) => {
                    let message = describe(&error);
                    link.on_script_uncaught_error(&message, None);
                }
            }
        })
        .await;
        if joined.is_err() {
            tracing::error!("script thread panicked before reporting a terminal event");
        }
    }

    async fn validate(&self, source: &str) -> Result<(), ScriptFault> {
        let source = source.to_string();
        tokio::task::spawn_blocking(move || {
            let engine = Engine::new();
            engine.compile(&source).map(|_| ()).map_err(|error| {
                let position = error.1;
                ScriptFault {
                    message: error.0.to_string(),
                    line: position.line(),
                    column: position.position(),
                }
            })
        })
        .await
        .unwrap_or_else(|_| {
            Err(ScriptFault {
                message: "validation task failed".to_string(),
                line: None,
                column: None,
            })
        })
    }

    fn engine_name(&self) -> &str {
        "Rhai"
    }
}

// =============================================================================
// Engine construction
// =============================================================================

fn build_engine(link: &SessionLink) -> Engine {
    let mut engine = Engine::new();

    let max_operations = link.settings().max_script_operations;
    let progress_link = link.clone();
    engine.on_progress(move |count| {
        if progress_link.force_stop_pending() {
            return Some(STOP_TOKEN.into());
        }
        if max_operations > 0 && count > max_operations {
            return Some(
                format!("Safety limit exceeded: maximum {max_operations} operations").into(),
            );
        }
        None
    });

    let call_link = link.clone();
    engine.register_fn(
        "host_call",
        move |key: &str, json_args: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            bridge_call(&call_link, key, None, json_args, Array::new())
        },
    );
    let call_link = link.clone();
    engine.register_fn(
        "host_call",
        move |key: &str, receiver: &str, json_args: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            bridge_call(&call_link, key, optional_name(receiver), json_args, Array::new())
        },
    );
    let call_link = link.clone();
    engine.register_fn(
        "host_call",
        move |key: &str,
              receiver: &str,
              json_args: &str,
              natives: Array|
              -> Result<Dynamic, Box<EvalAltResult>> {
            bridge_call(&call_link, key, optional_name(receiver), json_args, natives)
        },
    );

    let stop_link = link.clone();
    engine.register_fn("stop_requested", move || stop_link.stop_requested());

    let sleep_link = link.clone();
    engine.register_fn(
        "sleep_ms",
        move |ms: i64| -> Result<(), Box<EvalAltResult>> {
            let deadline = Instant::now() + Duration::from_millis(ms.max(0) as u64);
            let slice = sleep_link.settings().interrupt_poll_interval;
            loop {
                if sleep_link.force_stop_pending() {
                    return Err(stop_error());
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                std::thread::sleep((deadline - now).min(slice));
            }
        },
    );

    engine
}

fn optional_name(receiver: &str) -> Option<&str> {
    if receiver.is_empty() {
        None
    } else {
        Some(receiver)
    }
}

// =============================================================================
// Bridge glue
// =============================================================================

fn bridge_call(
    link: &SessionLink,
    key: &str,
    receiver: Option<&str>,
    json_args: &str,
    natives: Array,
) -> Result<Dynamic, Box<EvalAltResult>> {
    if natives.len() > MAX_ARITY {
        return Err(runtime_error(format!(
            "at most {MAX_ARITY} native arguments are supported"
        )));
    }
    let request = DispatchRequest {
        lookup_key: key.to_string(),
        receiver_name: receiver.map(str::to_string),
        json_arguments: json_args.to_string(),
        native_arguments: natives.into_iter().map(dynamic_to_native).collect(),
    };
    match link.call(request) {
        Ok(value) => Ok(native_to_dynamic(value)),
        Err(HostCallError::Stopped) => Err(stop_error()),
        Err(HostCallError::Fatal(message)) => Err(runtime_error(message)),
    }
}

fn stop_error() -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorTerminated(
        STOP_TOKEN.into(),
        Position::NONE,
    ))
}

fn runtime_error(message: String) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(message.into(), Position::NONE))
}

/// `()` marks a slot with no native form; everything else maps onto the
/// dispatcher's value model. Aggregate script types (arrays, maps) have no
/// native form and must travel on the wire side.
fn dynamic_to_native(value: Dynamic) -> Option<NativeValue> {
    if value.is_unit() {
        None
    } else if let Ok(flag) = value.as_bool() {
        Some(NativeValue::Bool(flag))
    } else if let Ok(int) = value.as_int() {
        Some(NativeValue::Int(int))
    } else if let Ok(float) = value.as_float() {
        Some(NativeValue::Float(float))
    } else if value.is_string() {
        value.into_string().ok().map(NativeValue::Str)
    } else {
        value.try_cast::<HostHandle>().map(NativeValue::Handle)
    }
}

fn native_to_dynamic(value: NativeValue) -> Dynamic {
    match value {
        NativeValue::Unit => Dynamic::UNIT,
        NativeValue::Bool(flag) => flag.into(),
        NativeValue::Int(int) => int.into(),
        NativeValue::Float(float) => float.into(),
        NativeValue::Str(text) => text.into(),
        NativeValue::Handle(handle) => Dynamic::from(handle),
    }
}

/// Innermost description of an evaluation error, without position noise for
/// the cases the session controller classifies.
fn describe(error: &EvalAltResult) -> String {
    match error {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => describe(inner),
        EvalAltResult::ErrorTerminated(token, _) => token.to_string(),
        EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
        other => other.to_string(),
    }
}
