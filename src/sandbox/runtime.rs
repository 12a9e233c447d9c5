//! Execution environments.
//!
//! A [`Runtime`] owns one interpreter instance plus its console buffer. Calls
//! on the same runtime are serialized; the interpreter itself runs on tokio's
//! blocking pool while a watcher task enforces the timeout and caller
//! cancellation through the shared [`InterruptFlag`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::engine::{GlobalBindings, InterruptFlag, InterruptReason, InterruptTicket, ScriptEngine};
use super::{ConsoleBuffer, ConsoleEntry, QuickJsEngine, SandboxConfig};
use crate::dom::{DomChange, Document};
use crate::error::{RuntimeError, ScriptError};

/// Output of one execution.
///
/// A failed script still carries the console output and duration produced
/// before the failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// Completion value of the script; `null` for `undefined` and on failure.
    pub value: serde_json::Value,
    /// Console entries in call order.
    pub console: Vec<ConsoleEntry>,
    /// Mutation log of the bound document, copied on success.
    pub dom_changes: Vec<DomChange>,
    /// Wall-clock duration of the call.
    #[serde(rename = "duration_ms", serialize_with = "super::duration_ms::serialize")]
    pub duration: Duration,
    /// Why the script did not complete, if it didn't.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<ScriptError>,
}

impl ExecutionResult {
    /// Returns `true` if the script ran to completion.
    #[must_use]
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    fn failed(error: ScriptError, console: Vec<ConsoleEntry>, duration: Duration) -> Self {
        Self {
            value: serde_json::Value::Null,
            console,
            dom_changes: Vec::new(),
            duration,
            error: Some(error),
        }
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<ScriptError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

/// What the blocking half of an execution hands back.
struct Completed {
    outcome: Result<serde_json::Value, ScriptError>,
    console: Vec<ConsoleEntry>,
    dom_changes: Vec<DomChange>,
}

/// One isolated interpreter instance with its restricted globals.
///
/// # Example
///
/// ```no_run
/// use script_sandbox::sandbox::{Runtime, SandboxConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), script_sandbox::Error> {
/// let runtime: Runtime = Runtime::new(SandboxConfig::default())?;
/// let result = runtime
///     .execute(&CancellationToken::new(), "console.log('hi'); 1 + 2", None)
///     .await?;
///
/// assert!(result.success());
/// assert_eq!(result.value, 3);
/// assert_eq!(result.console[0].message, "hi");
/// # Ok(())
/// # }
/// ```
pub struct Runtime<E: ScriptEngine = QuickJsEngine> {
    id: Uuid,
    config: Arc<SandboxConfig>,
    interrupt: Arc<InterruptFlag>,
    console: ConsoleBuffer,
    /// `None` once closed.
    engine: Arc<Mutex<Option<E>>>,
}

impl<E: ScriptEngine> std::fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: ScriptEngine> Runtime<E> {
    /// Builds a runtime with a fresh interpreter and installed globals.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Engine` if the interpreter cannot be created.
    pub fn new(config: SandboxConfig) -> Result<Self, RuntimeError> {
        Self::with_shared_config(Arc::new(config))
    }

    #[instrument(skip_all)]
    pub(crate) fn with_shared_config(config: Arc<SandboxConfig>) -> Result<Self, RuntimeError> {
        let interrupt = Arc::new(InterruptFlag::new());
        let console = ConsoleBuffer::new();
        let engine = build_engine::<E>(&config, &interrupt, &console)?;
        let id = Uuid::new_v4();
        debug!(%id, "Created runtime");

        Ok(Self {
            id,
            config,
            interrupt,
            console,
            engine: Arc::new(Mutex::new(Some(engine))),
        })
    }

    /// Unique identifier of this runtime.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration this runtime was built with.
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Runs a script to completion, timeout, or cancellation.
    ///
    /// The console buffer is cleared first, so the result only holds entries
    /// from this call. `document` is bound as `document` when DOM access is
    /// enabled and ignored otherwise. Script failures are reported in
    /// [`ExecutionResult::error`]; the runtime stays usable afterwards but
    /// should be [reset](Self::reset) before reuse.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Closed` if the runtime has been closed,
    /// `RuntimeError::Engine` if the document could not be bound, and
    /// `RuntimeError::Panicked` if the interpreter thread panicked.
    #[instrument(skip_all, fields(runtime_id = %self.id, script_len = script.len()))]
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        script: &str,
        document: Option<Arc<Document>>,
    ) -> Result<ExecutionResult, RuntimeError> {
        let started = Instant::now();
        let guard = Arc::clone(&self.engine).lock_owned().await;
        if guard.is_none() {
            return Err(RuntimeError::Closed);
        }

        self.console.clear();
        if cancel.is_cancelled() {
            debug!("Context already cancelled, not running script");
            return Ok(ExecutionResult::failed(
                ScriptError::Cancelled,
                Vec::new(),
                started.elapsed(),
            ));
        }

        let ticket = self.interrupt.arm();
        let (done_tx, done_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch(
            Arc::clone(&self.interrupt),
            ticket,
            self.config.timeout,
            cancel.clone(),
            done_rx,
        ));

        let document = if self.config.enable_dom { document } else { None };
        let script = script.to_owned();
        let interrupt = Arc::clone(&self.interrupt);
        let console = self.console.clone();
        let timeout_ms = self.config.timeout_ms();

        let joined = tokio::task::spawn_blocking(move || -> Result<Completed, RuntimeError> {
            let mut guard = guard;
            let _done = done_tx;
            let engine = guard.as_mut().ok_or(RuntimeError::Closed)?;
            engine.bind_document(document.clone())?;

            let outcome = engine.run(&script).map_err(|err| match interrupt.reason() {
                Some(InterruptReason::Timeout) => ScriptError::Timeout { timeout_ms },
                Some(InterruptReason::Cancelled) => ScriptError::Cancelled,
                None => err,
            });
            // Lower the flag before the lock is released so a late watcher
            // cannot halt anything that runs next on this engine.
            interrupt.arm();

            let dom_changes = match (&outcome, &document) {
                (Ok(_), Some(document)) => document.changes(),
                _ => Vec::new(),
            };
            Ok(Completed {
                outcome,
                console: console.snapshot(),
                dom_changes,
            })
        })
        .await;
        // The completion signal has been dropped by now, so this returns promptly.
        if let Err(join_err) = watcher.await {
            trace!(error = %join_err, "Interrupt watcher ended abnormally");
        }

        let completed = match joined {
            Ok(completed) => completed?,
            Err(join_err) => {
                warn!(error = %join_err, "Script engine task failed");
                return Err(RuntimeError::Panicked(join_err.to_string()));
            }
        };
        let duration = started.elapsed();

        match completed.outcome {
            Ok(value) => {
                debug!(
                    elapsed = ?duration,
                    console_entries = completed.console.len(),
                    dom_changes = completed.dom_changes.len(),
                    "Script completed"
                );
                Ok(ExecutionResult {
                    value,
                    console: completed.console,
                    dom_changes: completed.dom_changes,
                    duration,
                    error: None,
                })
            }
            Err(error) => {
                debug!(elapsed = ?duration, %error, "Script failed");
                Ok(ExecutionResult::failed(error, completed.console, duration))
            }
        }
    }

    /// Replaces the interpreter with a fresh one and reinstalls the globals.
    ///
    /// Scrubs globals, prototypes and anything else a previous script left
    /// behind. The rebuild runs on the blocking pool and holds the engine
    /// lock until it finishes. On failure the runtime is left closed.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Closed` if the runtime has been closed,
    /// `RuntimeError::Engine` if the new interpreter cannot be built, and
    /// `RuntimeError::Panicked` if the rebuild panicked.
    #[instrument(skip_all, fields(runtime_id = %self.id))]
    pub async fn reset(&self) -> Result<(), RuntimeError> {
        let mut guard = Arc::clone(&self.engine).lock_owned().await;
        let Some(old) = guard.take() else {
            return Err(RuntimeError::Closed);
        };

        self.console.clear();
        self.interrupt.arm();
        let config = Arc::clone(&self.config);
        let interrupt = Arc::clone(&self.interrupt);
        let console = self.console.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RuntimeError> {
            drop(old);
            *guard = Some(build_engine::<E>(&config, &interrupt, &console)?);
            Ok(())
        })
        .await
        .map_err(|join_err| RuntimeError::Panicked(join_err.to_string()))??;

        trace!("Runtime reset");
        Ok(())
    }

    /// Releases the interpreter. Idempotent.
    #[instrument(skip_all, fields(runtime_id = %self.id))]
    pub async fn close(&self) {
        if self.engine.lock().await.take().is_some() {
            self.console.clear();
            debug!("Runtime closed");
        }
    }

    /// Returns `true` once the runtime has been closed or failed a reset.
    pub async fn is_closed(&self) -> bool {
        self.engine.lock().await.is_none()
    }
}

fn build_engine<E: ScriptEngine>(
    config: &SandboxConfig,
    interrupt: &Arc<InterruptFlag>,
    console: &ConsoleBuffer,
) -> Result<E, RuntimeError> {
    let mut engine = E::create(config, Arc::clone(interrupt))?;
    engine.install_globals(&GlobalBindings::from_config(config, console))?;
    Ok(engine)
}

/// Raises `interrupt` when the timeout elapses or `cancel` fires, unless the
/// execution signals completion first.
async fn watch(
    interrupt: Arc<InterruptFlag>,
    ticket: InterruptTicket,
    timeout: Duration,
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
) {
    let reason = tokio::select! {
        biased;
        _ = done => return,
        () = cancel.cancelled() => InterruptReason::Cancelled,
        () = tokio::time::sleep(timeout) => InterruptReason::Timeout,
    };
    if interrupt.interrupt(ticket, reason) {
        debug!(?reason, "Interrupting script");
    }
}
