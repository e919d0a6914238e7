//! Core library for the rig_script bridge.
//!
//! This library lets user scripts drive a hardware rig's capabilities while
//! the host keeps control over safety, cancellation, and error reporting.
//! The session controller, dynamic call dispatcher, and execution context
//! tracker form the bridge; capability objects and the embedded engine plug
//! in at its edges.

pub mod capability;
pub mod config;
pub mod context;
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod scripting;
pub mod session;
