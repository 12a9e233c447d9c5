//! Error types for the script sandbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the crate.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Interpreter could not be created or prepared
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),

    /// Execution environment failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Runtime(#[from] RuntimeError),

    /// Environment pool failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Pool(#[from] PoolError),

    /// Document model failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Dom(#[from] DomError),
}

/// Errors raised while constructing or preparing an interpreter instance.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum EngineError {
    /// The interpreter instance could not be constructed
    #[error("Failed to create script engine: {0}")]
    #[diagnostic(code(sandbox::engine::create))]
    Create(String),

    /// Installing the restricted global namespace failed
    #[error("Failed to install sandbox globals: {0}")]
    #[diagnostic(code(sandbox::engine::setup))]
    Setup(String),
}

/// A script did not run to completion.
///
/// Carried inside [`ExecutionResult::error`](crate::ExecutionResult) rather than
/// returned as `Err`, so console output and duration survive the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum ScriptError {
    /// Syntax error, thrown value, or an engine-level failure such as running out of memory
    #[error("Script error: {message}")]
    #[diagnostic(code(sandbox::script::exception))]
    Exception { message: String },

    /// Interrupted because the configured execution timeout elapsed
    #[error("Script interrupted: execution timeout of {timeout_ms}ms exceeded")]
    #[diagnostic(
        code(sandbox::script::timeout),
        help("Raise the sandbox timeout or look for an unbounded loop in the script")
    )]
    Timeout { timeout_ms: u64 },

    /// Interrupted because the caller cancelled the request
    #[error("Script interrupted: context cancelled")]
    #[diagnostic(code(sandbox::script::cancelled))]
    Cancelled,
}

impl ScriptError {
    /// Returns `true` if the script was forcibly halted rather than failing on its own.
    #[must_use]
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled)
    }
}

/// Errors from a single execution environment.
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// The environment has been closed
    #[error("Runtime is closed")]
    #[diagnostic(code(sandbox::runtime::closed))]
    Closed,

    /// The interpreter could not be (re)built
    #[error("Runtime engine error")]
    #[diagnostic(code(sandbox::runtime::engine))]
    Engine(#[from] EngineError),

    /// The engine thread panicked while running a script
    #[error("Script engine panicked: {0}")]
    #[diagnostic(code(sandbox::runtime::panicked))]
    Panicked(String),
}

/// Errors from the environment pool.
#[derive(Error, Debug, Diagnostic)]
pub enum PoolError {
    /// The pool has been closed
    #[error("Runtime pool is closed")]
    #[diagnostic(code(sandbox::pool::closed))]
    Closed,

    /// No runtime became idle in time
    #[error("Timed out after {timeout_ms}ms waiting for an idle runtime")]
    #[diagnostic(
        code(sandbox::pool::acquire_timeout),
        help("Retry with backoff or increase the pool size")
    )]
    AcquireTimeout { timeout_ms: u64 },

    /// The caller cancelled while waiting for a runtime
    #[error("Runtime acquisition cancelled")]
    #[diagnostic(code(sandbox::pool::cancelled))]
    Cancelled,

    /// A runtime could not be reset and was replaced
    #[error("Failed to reset runtime, a replacement is being created")]
    #[diagnostic(
        code(sandbox::pool::reset),
        severity(Warning),
        help("The pool keeps its capacity; this only affects the runtime being released")
    )]
    Reset {
        #[source]
        source: RuntimeError,
    },

    /// Constructing the pool's runtimes failed
    #[error("Failed to build runtime pool")]
    #[diagnostic(code(sandbox::pool::build))]
    Build {
        #[source]
        source: RuntimeError,
    },

    /// Execution environment failure while serving a pooled call
    #[error(transparent)]
    #[diagnostic(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors related to the document model.
#[derive(Error, Debug, Diagnostic)]
pub enum DomError {
    /// A node handle does not belong to this document
    #[error("Unknown node {0}")]
    #[diagnostic(code(sandbox::dom::unknown_node))]
    UnknownNode(usize),

    /// Appending the node would make it its own ancestor
    #[error("Cannot append node {child} under its own descendant {parent}")]
    #[diagnostic(code(sandbox::dom::cycle))]
    Cycle { parent: usize, child: usize },

    /// A document snapshot could not be parsed
    #[error("Invalid document snapshot")]
    #[diagnostic(
        code(sandbox::dom::snapshot),
        help("Expected an element object: {{\"tag\": \"div\", \"children\": [...]}}")
    )]
    Snapshot(#[from] serde_json::Error),

    /// A document snapshot could not be read
    #[error("Failed to read document snapshot: {context}")]
    #[diagnostic(code(sandbox::dom::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
