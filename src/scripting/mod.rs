//! Script runtime boundary for session execution.
//!
//! The bridge never talks to a scripting engine directly; it talks to the
//! [`ScriptRuntime`] trait. A runtime receives the source text and a
//! [`SessionLink`](crate::session::SessionLink), drives the embedded engine
//! on a blocking thread, routes every host call through the link, and reports
//! exactly one terminal event (completion or uncaught error) before
//! returning.
//!
//! ```text
//! ScriptRuntime trait
//!     └── RhaiRuntime (embedded, cooperatively scheduled)
//!
//! Call-in surface registered on the engine
//!     ├── host_call(key, [receiver,] json_args [, natives])
//!     ├── stop_requested()
//!     └── sleep_ms(ms)
//! ```
//!
//! The engine is single-threaded and cannot be preempted mid-instruction;
//! the runtime's progress hook and the link's operation-start raise are what
//! bound termination time after a forced stop.

pub mod rhai_runtime;
pub mod script_runtime;

pub use rhai_runtime::RhaiRuntime;
pub use script_runtime::{ScriptFault, ScriptRuntime};
