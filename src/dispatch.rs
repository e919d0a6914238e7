//! Dynamic call dispatch from scripts to host capabilities.
//!
//! Scripts do not link against host methods; they name them. A call site
//! supplies a lookup key, an optional receiver name, a JSON array of argument
//! values, and a positional array of already-typed native values. The
//! dispatcher resolves the key against a declarative manifest of
//! [`MethodSpec`] entries built once at startup, assembles each parameter by
//! a fixed precedence ladder, and invokes the entry's strongly-typed thunk.
//!
//! # Argument precedence
//!
//! For each declared parameter, in order:
//!
//! 1. Contextual substitution: parameters declared as the current session,
//!    the device map, the feedback channel, or a pad view are filled from the
//!    session environment and ignore both supplied forms.
//! 2. A native form matching the declared type is used as-is.
//! 3. A wire (JSON) form exactly matching the declared type is used as-is.
//! 4. The wire form's textual representation is coerced to the declared
//!    type; numeric targets parse as floating point and round to nearest.
//! 5. A direct cast between numeric forms is attempted.
//! 6. Dispatch fails with an error naming both the source and the target.
//!
//! Call sites supply the wire array at full declared length, using `null`
//! for slots satisfied contextually or natively.

use crate::capability::{Capability, FeedbackChannel, PadView};
use crate::context::OperationKind;
use crate::error::{AppResult, BridgeError};
use crate::registry::CapabilityRegistry;
use crate::session::SessionHandle;
use anyhow::Context;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Fixed maximum parameter count. The calling convention has no variable
/// arity, so every manifest entry declares at most this many parameters.
pub const MAX_ARITY: usize = 8;

// =============================================================================
// Values
// =============================================================================

/// Reference-counted host object previously returned to a script.
#[derive(Clone)]
pub struct HostHandle {
    /// Declared type name, matched against `ParamType::Handle` targets.
    pub type_name: &'static str,
    object: Arc<dyn Any + Send + Sync>,
}

impl HostHandle {
    pub fn new<T: Send + Sync + 'static>(type_name: &'static str, object: T) -> Self {
        Self {
            type_name,
            object: Arc::new(object),
        }
    }

    /// Concrete access for thunks; `None` when the handle holds another type.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.object.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostHandle<{}>", self.type_name)
    }
}

/// Already-typed value crossing the script/host boundary.
#[derive(Clone, Debug)]
pub enum NativeValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Handle(HostHandle),
}

impl fmt::Display for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeValue::Unit => write!(f, "()"),
            NativeValue::Bool(value) => write!(f, "{value}"),
            NativeValue::Int(value) => write!(f, "{value}"),
            NativeValue::Float(value) => write!(f, "{value}"),
            NativeValue::Str(value) => write!(f, "\"{value}\""),
            NativeValue::Handle(handle) => write!(f, "handle<{}>", handle.type_name),
        }
    }
}

/// One positional argument as supplied by a call site.
#[derive(Clone, Debug, Default)]
pub struct ArgumentSlot {
    /// Already-typed form, present when the script holds a host object or a
    /// value the engine binding could type directly.
    pub native: Option<NativeValue>,
    /// Decoded JSON form.
    pub wire: Option<JsonValue>,
}

// =============================================================================
// Parameter declarations
// =============================================================================

/// Declared enum parameter: a closed set of named variants.
#[derive(Debug)]
pub struct EnumSpec {
    pub name: &'static str,
    pub variants: &'static [&'static str],
}

/// Which pad a pad-view parameter binds to.
///
/// Labeled pads bind by label; untagged pad parameters bind to pads one and
/// two in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PadBinding {
    First,
    Second,
    Untagged,
}

/// Declared type of one manifest parameter.
#[derive(Clone, Copy, Debug)]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Str,
    Enum(&'static EnumSpec),
    /// Host object of the given declared type name.
    Handle(&'static str),
    /// The current session (contextual).
    Session,
    /// The live capability registry (contextual).
    DeviceMap,
    /// The user-feedback channel (contextual).
    Feedback,
    /// A controller-pad view (contextual).
    Pad(PadBinding),
}

impl ParamType {
    fn is_contextual(&self) -> bool {
        matches!(
            self,
            ParamType::Session | ParamType::DeviceMap | ParamType::Feedback | ParamType::Pad(_)
        )
    }

    fn label(&self) -> String {
        match self {
            ParamType::Bool => "bool".to_string(),
            ParamType::Int => "int".to_string(),
            ParamType::Float => "float".to_string(),
            ParamType::Str => "string".to_string(),
            ParamType::Enum(spec) => format!("enum {}", spec.name),
            ParamType::Handle(type_name) => format!("handle<{type_name}>"),
            ParamType::Session => "session".to_string(),
            ParamType::DeviceMap => "device map".to_string(),
            ParamType::Feedback => "feedback channel".to_string(),
            ParamType::Pad(_) => "pad view".to_string(),
        }
    }
}

// =============================================================================
// Resolved arguments and invocation thunks
// =============================================================================

/// A fully resolved argument handed to an invocation thunk.
#[derive(Clone)]
pub enum CallArg {
    Value(NativeValue),
    Session(SessionHandle),
    Devices(Arc<CapabilityRegistry>),
    Feedback(Arc<FeedbackChannel>),
    Pad(Arc<PadView>),
}

impl CallArg {
    pub fn as_bool(&self) -> anyhow::Result<bool> {
        match self {
            CallArg::Value(NativeValue::Bool(value)) => Ok(*value),
            other => Err(anyhow::anyhow!("argument is not a bool: {}", other.kind())),
        }
    }

    pub fn as_int(&self) -> anyhow::Result<i64> {
        match self {
            CallArg::Value(NativeValue::Int(value)) => Ok(*value),
            other => Err(anyhow::anyhow!("argument is not an int: {}", other.kind())),
        }
    }

    pub fn as_float(&self) -> anyhow::Result<f64> {
        match self {
            CallArg::Value(NativeValue::Float(value)) => Ok(*value),
            other => Err(anyhow::anyhow!("argument is not a float: {}", other.kind())),
        }
    }

    pub fn as_str(&self) -> anyhow::Result<&str> {
        match self {
            CallArg::Value(NativeValue::Str(value)) => Ok(value),
            other => Err(anyhow::anyhow!("argument is not a string: {}", other.kind())),
        }
    }

    /// Concrete host object behind a handle argument.
    pub fn handle<T: Send + Sync + 'static>(&self) -> anyhow::Result<Arc<T>> {
        match self {
            CallArg::Value(NativeValue::Handle(handle)) => handle
                .downcast::<T>()
                .with_context(|| format!("handle does not hold a {}", std::any::type_name::<T>())),
            other => Err(anyhow::anyhow!("argument is not a handle: {}", other.kind())),
        }
    }

    pub fn session(&self) -> anyhow::Result<&SessionHandle> {
        match self {
            CallArg::Session(session) => Ok(session),
            other => Err(anyhow::anyhow!("argument is not the session: {}", other.kind())),
        }
    }

    pub fn devices(&self) -> anyhow::Result<&Arc<CapabilityRegistry>> {
        match self {
            CallArg::Devices(registry) => Ok(registry),
            other => Err(anyhow::anyhow!("argument is not the device map: {}", other.kind())),
        }
    }

    pub fn feedback(&self) -> anyhow::Result<&Arc<FeedbackChannel>> {
        match self {
            CallArg::Feedback(feedback) => Ok(feedback),
            other => Err(anyhow::anyhow!(
                "argument is not the feedback channel: {}",
                other.kind()
            )),
        }
    }

    pub fn pad(&self) -> anyhow::Result<&Arc<PadView>> {
        match self {
            CallArg::Pad(pad) => Ok(pad),
            other => Err(anyhow::anyhow!("argument is not a pad view: {}", other.kind())),
        }
    }

    fn kind(&self) -> String {
        match self {
            CallArg::Value(value) => value.to_string(),
            CallArg::Session(_) => "session".to_string(),
            CallArg::Devices(_) => "device map".to_string(),
            CallArg::Feedback(_) => "feedback channel".to_string(),
            CallArg::Pad(_) => "pad view".to_string(),
        }
    }
}

/// Invocation context assembled per dispatch.
pub struct CallContext {
    pub session: SessionHandle,
    pub registry: Arc<CapabilityRegistry>,
    pub feedback: Arc<FeedbackChannel>,
    pub pads: [Arc<PadView>; 2],
    /// Resolved receiver, when the call site named one.
    pub receiver: Option<Arc<dyn Capability>>,
}

impl CallContext {
    /// Concrete receiver access for thunks.
    pub fn receiver_as<T: 'static>(&self) -> anyhow::Result<&T> {
        let receiver = self
            .receiver
            .as_ref()
            .context("method requires a receiver but none was supplied")?;
        receiver
            .as_any()
            .downcast_ref::<T>()
            .with_context(|| format!("receiver is not a {}", std::any::type_name::<T>()))
    }
}

/// Strongly-typed invocation target of one manifest entry.
pub type InvocationThunk =
    Box<dyn Fn(&CallContext, &[CallArg]) -> anyhow::Result<NativeValue> + Send + Sync>;

/// One entry in the declarative capability manifest.
pub struct MethodSpec {
    /// Opaque key call sites use to name this method.
    pub lookup_key: &'static str,
    /// Operation kind recorded by the execution context tracker.
    pub kind: OperationKind,
    /// Declaring capability type; receivers are resolved against it.
    pub owner: &'static str,
    /// Member name; second part of the operation label.
    pub name: &'static str,
    /// Ordered parameter declarations.
    pub params: Vec<ParamType>,
    pub thunk: InvocationThunk,
}

// =============================================================================
// Dispatch requests and errors
// =============================================================================

/// One host call as it arrives from the engine binding.
#[derive(Debug)]
pub struct DispatchRequest {
    pub lookup_key: String,
    pub receiver_name: Option<String>,
    /// JSON array text, one element per declared parameter.
    pub json_arguments: String,
    /// Positional native forms; `None` where the script supplied no typed
    /// value for the slot.
    pub native_arguments: Vec<Option<NativeValue>>,
}

/// Per-session collaborators the dispatcher draws contextual arguments from.
#[derive(Clone)]
pub struct DispatchEnv {
    pub session: SessionHandle,
    pub registry: Arc<CapabilityRegistry>,
    pub feedback: Arc<FeedbackChannel>,
    pub pads: [Arc<PadView>; 2],
}

/// Errors surfaced by dispatch resolution, decoding, coercion, or invocation.
///
/// Every variant is fatal to the session: a dispatch failure means the script
/// and the host's capability set disagree, and continuing would run the wrong
/// program.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No capability method is registered under the key '{0}'")]
    UnknownLookupKey(String),

    #[error("No capability of type {type_name} named '{name}' is registered")]
    MissingReceiver { type_name: String, name: String },

    #[error("Malformed argument payload for '{key}': {detail}")]
    BadArgumentPayload { key: String, detail: String },

    #[error("'{key}' takes {expected} arguments but {actual} were supplied")]
    ArityMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("Cannot convert {value} to {target} for argument {index} of '{key}'")]
    Conversion {
        key: String,
        index: usize,
        value: String,
        target: String,
    },

    #[error(transparent)]
    Invocation(#[from] anyhow::Error),
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Lookup-key → method manifest with resolve-then-invoke semantics.
pub struct CallDispatcher {
    methods: HashMap<&'static str, MethodSpec>,
}

impl CallDispatcher {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Add one manifest entry. Duplicate keys and over-wide signatures fail
    /// manifest construction.
    pub fn register(&mut self, spec: MethodSpec) -> AppResult<()> {
        if spec.params.len() > MAX_ARITY {
            return Err(BridgeError::ArityCeilingExceeded(
                spec.lookup_key.to_string(),
                spec.params.len(),
                MAX_ARITY,
            ));
        }
        if self.methods.contains_key(spec.lookup_key) {
            return Err(BridgeError::DuplicateLookupKey(spec.lookup_key.to_string()));
        }
        self.methods.insert(spec.lookup_key, spec);
        Ok(())
    }

    /// Deterministic resolution of a lookup key.
    pub fn lookup(&self, key: &str) -> Option<&MethodSpec> {
        self.methods.get(key)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Resolve, decode, coerce, and invoke one request.
    ///
    /// The thunk runs only after every argument has been assembled; any
    /// failure before that point reports the request as a whole and leaves
    /// the target untouched.
    pub fn invoke(
        &self,
        request: &DispatchRequest,
        env: &DispatchEnv,
    ) -> Result<NativeValue, DispatchError> {
        let spec = self
            .lookup(&request.lookup_key)
            .ok_or_else(|| DispatchError::UnknownLookupKey(request.lookup_key.clone()))?;

        let receiver = match &request.receiver_name {
            Some(name) => Some(env.registry.resolve(spec.owner, name).ok_or_else(|| {
                DispatchError::MissingReceiver {
                    type_name: spec.owner.to_string(),
                    name: name.clone(),
                }
            })?),
            None => None,
        };

        let wire: Vec<JsonValue> = serde_json::from_str(&request.json_arguments).map_err(|e| {
            DispatchError::BadArgumentPayload {
                key: request.lookup_key.clone(),
                detail: e.to_string(),
            }
        })?;
        if wire.len() != spec.params.len() {
            return Err(DispatchError::ArityMismatch {
                key: request.lookup_key.clone(),
                expected: spec.params.len(),
                actual: wire.len(),
            });
        }

        let mut untagged_pads = 0usize;
        let mut args = Vec::with_capacity(spec.params.len());
        for (index, param) in spec.params.iter().enumerate() {
            let slot = ArgumentSlot {
                native: request.native_arguments.get(index).cloned().flatten(),
                wire: match &wire[index] {
                    JsonValue::Null => None,
                    value => Some(value.clone()),
                },
            };
            args.push(resolve_argument(
                &request.lookup_key,
                index,
                param,
                &slot,
                env,
                &mut untagged_pads,
            )?);
        }

        let ctx = CallContext {
            session: env.session.clone(),
            registry: env.registry.clone(),
            feedback: env.feedback.clone(),
            pads: env.pads.clone(),
            receiver,
        };
        (spec.thunk)(&ctx, &args).map_err(DispatchError::Invocation)
    }
}

impl Default for CallDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Argument assembly
// =============================================================================

fn resolve_argument(
    key: &str,
    index: usize,
    param: &ParamType,
    slot: &ArgumentSlot,
    env: &DispatchEnv,
    untagged_pads: &mut usize,
) -> Result<CallArg, DispatchError> {
    // (1) contextual substitution bypasses both supplied forms
    match param {
        ParamType::Session => return Ok(CallArg::Session(env.session.clone())),
        ParamType::DeviceMap => return Ok(CallArg::Devices(env.registry.clone())),
        ParamType::Feedback => return Ok(CallArg::Feedback(env.feedback.clone())),
        ParamType::Pad(binding) => {
            let view = match binding {
                PadBinding::First => env.pads[0].clone(),
                PadBinding::Second => env.pads[1].clone(),
                PadBinding::Untagged => {
                    let position = *untagged_pads;
                    *untagged_pads += 1;
                    env.pads
                        .get(position)
                        .cloned()
                        .ok_or_else(|| DispatchError::Conversion {
                            key: key.to_string(),
                            index,
                            value: format!("untagged pad parameter #{}", position + 1),
                            target: param.label(),
                        })?
                }
            };
            return Ok(CallArg::Pad(view));
        }
        _ => {}
    }
    coerce_value(key, index, param, slot).map(CallArg::Value)
}

fn coerce_value(
    key: &str,
    index: usize,
    param: &ParamType,
    slot: &ArgumentSlot,
) -> Result<NativeValue, DispatchError> {
    debug_assert!(!param.is_contextual());

    // (2) already-typed native form matching the declared type
    if let Some(native) = &slot.native {
        if let Some(value) = native_exact(param, native) {
            return Ok(value);
        }
    }
    // (3) wire form exactly matching the declared type
    if let Some(wire) = &slot.wire {
        if let Some(value) = wire_exact(param, wire) {
            return Ok(value);
        }
    }
    // (4) textual coercion of the wire form
    if let Some(wire) = &slot.wire {
        if let Some(value) = wire_textual(param, wire) {
            return Ok(value);
        }
    }
    // (5) direct cast
    if let Some(value) = direct_cast(param, slot) {
        return Ok(value);
    }
    // (6) descriptive failure
    Err(DispatchError::Conversion {
        key: key.to_string(),
        index,
        value: describe_slot(slot),
        target: param.label(),
    })
}

fn native_exact(param: &ParamType, native: &NativeValue) -> Option<NativeValue> {
    match (param, native) {
        (ParamType::Bool, NativeValue::Bool(_))
        | (ParamType::Int, NativeValue::Int(_))
        | (ParamType::Float, NativeValue::Float(_))
        | (ParamType::Str, NativeValue::Str(_)) => Some(native.clone()),
        (ParamType::Enum(spec), NativeValue::Str(text)) => spec
            .variants
            .iter()
            .any(|variant| variant == text)
            .then(|| native.clone()),
        (ParamType::Handle(type_name), NativeValue::Handle(handle)) => {
            (handle.type_name == *type_name).then(|| native.clone())
        }
        _ => None,
    }
}

fn wire_exact(param: &ParamType, wire: &JsonValue) -> Option<NativeValue> {
    match (param, wire) {
        (ParamType::Bool, JsonValue::Bool(value)) => Some(NativeValue::Bool(*value)),
        (ParamType::Int, JsonValue::Number(number)) => number.as_i64().map(NativeValue::Int),
        (ParamType::Float, JsonValue::Number(number)) => number.as_f64().map(NativeValue::Float),
        (ParamType::Str, JsonValue::String(text)) => Some(NativeValue::Str(text.clone())),
        (ParamType::Enum(spec), JsonValue::String(text)) => spec
            .variants
            .iter()
            .find(|variant| *variant == text)
            .map(|variant| NativeValue::Str((*variant).to_string())),
        _ => None,
    }
}

fn wire_textual(param: &ParamType, wire: &JsonValue) -> Option<NativeValue> {
    let text = match wire {
        JsonValue::String(text) => text.clone(),
        JsonValue::Number(number) => number.to_string(),
        JsonValue::Bool(value) => value.to_string(),
        _ => return None,
    };
    let text = text.trim();
    match param {
        ParamType::Bool => match text.to_ascii_lowercase().as_str() {
            "true" => Some(NativeValue::Bool(true)),
            "false" => Some(NativeValue::Bool(false)),
            _ => None,
        },
        // Numeric targets parse as floating point, then round to nearest.
        ParamType::Int => text
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(|value| NativeValue::Int(value.round() as i64)),
        ParamType::Float => text.parse::<f64>().ok().map(NativeValue::Float),
        ParamType::Str => Some(NativeValue::Str(text.to_string())),
        ParamType::Enum(spec) => spec
            .variants
            .iter()
            .find(|variant| variant.eq_ignore_ascii_case(text))
            .map(|variant| NativeValue::Str((*variant).to_string())),
        _ => None,
    }
}

fn direct_cast(param: &ParamType, slot: &ArgumentSlot) -> Option<NativeValue> {
    match (param, &slot.native) {
        (ParamType::Float, Some(NativeValue::Int(value))) => {
            return Some(NativeValue::Float(*value as f64));
        }
        (ParamType::Int, Some(NativeValue::Float(value))) if value.is_finite() => {
            return Some(NativeValue::Int(value.round() as i64));
        }
        (ParamType::Enum(spec), Some(NativeValue::Str(text))) => {
            return spec
                .variants
                .iter()
                .find(|variant| variant.eq_ignore_ascii_case(text))
                .map(|variant| NativeValue::Str((*variant).to_string()));
        }
        _ => {}
    }
    None
}

fn describe_slot(slot: &ArgumentSlot) -> String {
    if let Some(native) = &slot.native {
        return native.to_string();
    }
    if let Some(wire) = &slot.wire {
        return serde_json::to_string(wire).unwrap_or_else(|_| "unprintable value".to_string());
    }
    "nothing".to_string()
}
