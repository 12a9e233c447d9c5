//! The seam between runtimes and a concrete script interpreter.
//!
//! [`Runtime`](super::Runtime) and [`SandboxPool`](crate::SandboxPool) only talk
//! to an interpreter through [`ScriptEngine`], so another embeddable engine can
//! be substituted without touching pooling or document logic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{ConsoleBuffer, SandboxConfig};
use crate::dom::Document;
use crate::error::{EngineError, ScriptError};

/// Why a running script was halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// The configured execution timeout elapsed.
    Timeout,
    /// The caller cancelled the request.
    Cancelled,
}

/// Identifies one armed execution on an [`InterruptFlag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptTicket(u64);

#[derive(Debug, Default)]
struct InterruptState {
    generation: u64,
    reason: Option<InterruptReason>,
}

/// Interrupt request shared between a runtime's watcher and its engine.
///
/// The engine polls [`InterruptFlag::is_raised`] from its interrupt hook. Each
/// execution arms the flag and gets a ticket; an interrupt carrying a ticket
/// from an earlier execution is ignored, so a late watcher can never halt a
/// later script.
#[derive(Debug, Default)]
pub struct InterruptFlag {
    raised: AtomicBool,
    state: Mutex<InterruptState>,
}

impl InterruptFlag {
    /// Creates a lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowers the flag and starts a new generation.
    pub fn arm(&self) -> InterruptTicket {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.reason = None;
        self.raised.store(false, Ordering::Release);
        InterruptTicket(state.generation)
    }

    /// Raises the flag for the execution identified by `ticket`.
    ///
    /// Returns `false` if the ticket is stale or the flag was already raised;
    /// the first reason wins.
    pub fn interrupt(&self, ticket: InterruptTicket, reason: InterruptReason) -> bool {
        let mut state = self.state.lock();
        if state.generation != ticket.0 || state.reason.is_some() {
            return false;
        }
        state.reason = Some(reason);
        self.raised.store(true, Ordering::Release);
        true
    }

    /// Polled by the engine while a script runs.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Reason of the current generation's interrupt, if any.
    #[must_use]
    pub fn reason(&self) -> Option<InterruptReason> {
        self.state.lock().reason
    }
}

/// What to install into a fresh global namespace.
#[derive(Debug, Clone, Default)]
pub struct GlobalBindings {
    /// Buffer for `console.*`; `None` leaves `console` undefined.
    pub console: Option<ConsoleBuffer>,
    /// Install the inert `fetch` stub.
    pub network: bool,
}

impl GlobalBindings {
    /// Bindings implied by a configuration.
    #[must_use]
    pub fn from_config(config: &SandboxConfig, console: &ConsoleBuffer) -> Self {
        Self {
            console: config.enable_console.then(|| console.clone()),
            network: config.enable_network,
        }
    }
}

/// An embeddable interpreter driven by a [`Runtime`](super::Runtime).
///
/// Engines are owned by exactly one runtime and are only ever used from one
/// thread at a time, but may move between threads between calls.
pub trait ScriptEngine: Send + Sized + 'static {
    /// Builds a fresh interpreter that halts when `interrupt` is raised.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Create` if the interpreter cannot be constructed.
    fn create(config: &SandboxConfig, interrupt: Arc<InterruptFlag>) -> Result<Self, EngineError>;

    /// Installs the restricted global namespace.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Setup` if a global cannot be defined.
    fn install_globals(&mut self, bindings: &GlobalBindings) -> Result<(), EngineError>;

    /// Binds `document` to the given model, or removes the binding for `None`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Setup` if the proxy cannot be installed.
    fn bind_document(&mut self, document: Option<Arc<Document>>) -> Result<(), EngineError>;

    /// Evaluates a script and converts its completion value.
    ///
    /// # Errors
    ///
    /// Returns `ScriptError::Exception` for syntax errors, thrown values and
    /// interrupts; the runtime re-tags interrupts by their reason.
    fn run(&mut self, script: &str) -> Result<serde_json::Value, ScriptError>;
}
