//! Sandboxed script execution.
//!
//! Each [`Runtime`] wraps one embedded QuickJS interpreter with a restricted
//! global namespace:
//!
//! - Node-style host capabilities (`require`, `process`, ...) are `undefined`
//! - Timers are inert and never fire
//! - `console.*` is captured per execution when enabled
//! - `document` is bound to a [`Document`](crate::dom::Document) when enabled
//!
//! Every execution has a hard wall-clock timeout and honours caller
//! cancellation; both halt the interpreter cooperatively.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use script_sandbox::sandbox::{Runtime, SandboxConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), script_sandbox::Error> {
//! let config = SandboxConfig::default().with_timeout(Duration::from_millis(100));
//! let runtime: Runtime = Runtime::new(config)?;
//!
//! let result = runtime
//!     .execute(&CancellationToken::new(), "while (true) {}", None)
//!     .await?;
//! assert!(result.error.is_some_and(|e| e.is_interrupt()));
//! # Ok(())
//! # }
//! ```

mod config;
mod console;
mod engine;
mod quickjs;
mod runtime;
mod security;

pub(crate) use config::duration_ms;
pub use config::SandboxConfig;
pub use console::{
    ConsoleBuffer, ConsoleEntry, ConsoleLevel, MAX_CONSOLE_ENTRIES, MAX_MESSAGE_BYTES,
};
pub use engine::{GlobalBindings, InterruptFlag, InterruptReason, InterruptTicket, ScriptEngine};
pub use quickjs::QuickJsEngine;
pub use runtime::{ExecutionResult, Runtime};
pub use security::{BLOCKED_GLOBALS, TIMER_GLOBALS};
