//! Standard mock rig: capability objects plus the dispatch manifest that
//! exposes them to scripts.
//!
//! The manifest is the declarative replacement for runtime reflection: every
//! script-callable method is one [`MethodSpec`] naming its lookup key,
//! operation kind, owning type, parameter types, and a strongly-typed thunk.
//! It is built once at startup; there is nothing to scan while a session
//! runs.
//!
//! Lookup keys are grouped by owning type:
//!
//! | key prefix | owner | receiver |
//! |------------|-------------|---------------------------|
//! | `motor.` | `Motor` | named registry entry |
//! | `range_sensor.` | `RangeSensor` | named registry entry |
//! | `timer.` | `Timer` | native handle argument |
//! | `feedback.` | `Feedback` | contextual |
//! | `session.` | `Session` | contextual |
//! | `devices.` | `DeviceMap` | contextual |
//! | `pad.` | `Pad` | contextual |

pub mod mock;

pub use mock::{ElapsedTimer, MockMotor, MockRangeSensor};

use crate::capability::Capability;
use crate::context::OperationKind;
use crate::dispatch::{
    CallDispatcher, EnumSpec, HostHandle, MethodSpec, NativeValue, PadBinding, ParamType,
};
use crate::error::AppResult;
use std::sync::Arc;

static DIRECTION: EnumSpec = EnumSpec {
    name: "Direction",
    variants: &["forward", "reverse"],
};

/// Builds the dispatcher manifest for the standard mock rig.
pub fn standard_manifest() -> AppResult<CallDispatcher> {
    let mut dispatcher = CallDispatcher::new();

    // Motor property surface.
    dispatcher.register(MethodSpec {
        lookup_key: "motor.set_power",
        kind: OperationKind::PropertySet,
        owner: "Motor",
        name: "power",
        params: vec![ParamType::Session, ParamType::Float],
        thunk: Box::new(|ctx, args| {
            let motor = ctx.receiver_as::<MockMotor>()?;
            motor.set_power(args[0].session()?, args[1].as_float()?);
            Ok(NativeValue::Unit)
        }),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "motor.power",
        kind: OperationKind::PropertyGet,
        owner: "Motor",
        name: "power",
        params: vec![],
        thunk: Box::new(|ctx, _args| Ok(NativeValue::Float(ctx.receiver_as::<MockMotor>()?.power()))),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "motor.set_direction",
        kind: OperationKind::PropertySet,
        owner: "Motor",
        name: "direction",
        params: vec![ParamType::Enum(&DIRECTION)],
        thunk: Box::new(|ctx, args| {
            ctx.receiver_as::<MockMotor>()?.set_direction(args[0].as_str()?);
            Ok(NativeValue::Unit)
        }),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "motor.direction",
        kind: OperationKind::PropertyGet,
        owner: "Motor",
        name: "direction",
        params: vec![],
        thunk: Box::new(|ctx, _args| {
            Ok(NativeValue::Str(ctx.receiver_as::<MockMotor>()?.direction()))
        }),
    })?;

    // Range sensor.
    dispatcher.register(MethodSpec {
        lookup_key: "range_sensor.distance_mm",
        kind: OperationKind::PropertyGet,
        owner: "RangeSensor",
        name: "distance_mm",
        params: vec![],
        thunk: Box::new(|ctx, _args| {
            Ok(NativeValue::Float(
                ctx.receiver_as::<MockRangeSensor>()?.distance_mm(),
            ))
        }),
    })?;

    // Timers are created by scripts and travel back in as native handles.
    dispatcher.register(MethodSpec {
        lookup_key: "timer.new",
        kind: OperationKind::Creation,
        owner: "Timer",
        name: "new",
        params: vec![],
        thunk: Box::new(|_ctx, _args| {
            Ok(NativeValue::Handle(HostHandle::new(
                "Timer",
                ElapsedTimer::new(),
            )))
        }),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "timer.seconds",
        kind: OperationKind::PropertyGet,
        owner: "Timer",
        name: "seconds",
        params: vec![ParamType::Handle("Timer")],
        thunk: Box::new(|_ctx, args| {
            Ok(NativeValue::Float(args[0].handle::<ElapsedTimer>()?.seconds()))
        }),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "timer.reset",
        kind: OperationKind::Call,
        owner: "Timer",
        name: "reset",
        params: vec![ParamType::Handle("Timer")],
        thunk: Box::new(|_ctx, args| {
            args[0].handle::<ElapsedTimer>()?.reset();
            Ok(NativeValue::Unit)
        }),
    })?;

    // Feedback channel.
    dispatcher.register(MethodSpec {
        lookup_key: "feedback.say",
        kind: OperationKind::Call,
        owner: "Feedback",
        name: "say",
        params: vec![ParamType::Feedback, ParamType::Str],
        thunk: Box::new(|_ctx, args| {
            args[0].feedback()?.say(args[1].as_str()?);
            Ok(NativeValue::Unit)
        }),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "feedback.repeat",
        kind: OperationKind::Call,
        owner: "Feedback",
        name: "repeat",
        params: vec![ParamType::Feedback, ParamType::Str, ParamType::Int],
        thunk: Box::new(|_ctx, args| {
            let feedback = args[0].feedback()?;
            let line = args[1].as_str()?;
            for _ in 0..args[2].as_int()?.max(0) {
                feedback.say(line);
            }
            Ok(NativeValue::Unit)
        }),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "feedback.stamp",
        kind: OperationKind::Call,
        owner: "Feedback",
        name: "stamp",
        params: vec![ParamType::Feedback, ParamType::Str, ParamType::Handle("Timer")],
        thunk: Box::new(|_ctx, args| {
            let timer = args[2].handle::<ElapsedTimer>()?;
            args[0]
                .feedback()?
                .say(format!("{} @ {:.3}s", args[1].as_str()?, timer.seconds()));
            Ok(NativeValue::Unit)
        }),
    })?;

    // Session views.
    dispatcher.register(MethodSpec {
        lookup_key: "session.stop_requested",
        kind: OperationKind::Call,
        owner: "Session",
        name: "stop_requested",
        params: vec![ParamType::Session],
        thunk: Box::new(|_ctx, args| Ok(NativeValue::Bool(args[0].session()?.stop_requested()))),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "session.elapsed_seconds",
        kind: OperationKind::Call,
        owner: "Session",
        name: "elapsed_seconds",
        params: vec![ParamType::Session],
        thunk: Box::new(|_ctx, args| {
            Ok(NativeValue::Float(args[0].session()?.elapsed().as_secs_f64()))
        }),
    })?;

    // Device map views.
    dispatcher.register(MethodSpec {
        lookup_key: "devices.count",
        kind: OperationKind::Call,
        owner: "DeviceMap",
        name: "count",
        params: vec![ParamType::DeviceMap],
        thunk: Box::new(|_ctx, args| Ok(NativeValue::Int(args[0].devices()?.len() as i64))),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "devices.contains",
        kind: OperationKind::Call,
        owner: "DeviceMap",
        name: "contains",
        params: vec![ParamType::DeviceMap, ParamType::Str],
        thunk: Box::new(|_ctx, args| {
            Ok(NativeValue::Bool(
                args[0].devices()?.get(args[1].as_str()?).is_some(),
            ))
        }),
    })?;

    // Pad views.
    dispatcher.register(MethodSpec {
        lookup_key: "pad.button_a",
        kind: OperationKind::PropertyGet,
        owner: "Pad",
        name: "button_a",
        params: vec![ParamType::Pad(PadBinding::Untagged)],
        thunk: Box::new(|_ctx, args| Ok(NativeValue::Bool(args[0].pad()?.snapshot().button_a))),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "pad.left_x",
        kind: OperationKind::PropertyGet,
        owner: "Pad",
        name: "left_x",
        params: vec![ParamType::Pad(PadBinding::Untagged)],
        thunk: Box::new(|_ctx, args| Ok(NativeValue::Float(args[0].pad()?.snapshot().left_x))),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "pad2.button_a",
        kind: OperationKind::PropertyGet,
        owner: "Pad",
        name: "button_a",
        params: vec![ParamType::Pad(PadBinding::Second)],
        thunk: Box::new(|_ctx, args| Ok(NativeValue::Bool(args[0].pad()?.snapshot().button_a))),
    })?;
    dispatcher.register(MethodSpec {
        lookup_key: "pad.both_a",
        kind: OperationKind::Call,
        owner: "Pad",
        name: "both_a",
        params: vec![
            ParamType::Pad(PadBinding::Untagged),
            ParamType::Pad(PadBinding::Untagged),
        ],
        thunk: Box::new(|_ctx, args| {
            Ok(NativeValue::Bool(
                args[0].pad()?.snapshot().button_a && args[1].pad()?.snapshot().button_a,
            ))
        }),
    })?;

    Ok(dispatcher)
}

/// Capability population for the standard mock rig.
pub fn standard_capabilities() -> Vec<(String, Arc<dyn Capability>)> {
    vec![
        (
            "left_motor".to_string(),
            Arc::new(MockMotor::new()) as Arc<dyn Capability>,
        ),
        (
            "right_motor".to_string(),
            Arc::new(MockMotor::new()) as Arc<dyn Capability>,
        ),
        (
            "range".to_string(),
            Arc::new(MockRangeSensor::new()) as Arc<dyn Capability>,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_manifest_builds() {
        let dispatcher = standard_manifest().unwrap();
        assert!(dispatcher.lookup("motor.set_power").is_some());
        assert!(dispatcher.lookup("timer.seconds").is_some());
        assert!(dispatcher.lookup("nonexistent").is_none());
    }

    #[test]
    fn test_standard_capabilities_are_unique() {
        let capabilities = standard_capabilities();
        let mut identifiers: Vec<_> = capabilities.iter().map(|(id, _)| id.clone()).collect();
        identifiers.dedup();
        assert_eq!(identifiers.len(), capabilities.len());
    }
}
