//! Pool lifecycle: construction, acquire/release, shutdown.
//!
//! # Availability
//!
//! The idle queue is the only record of which runtimes are free. A semaphore
//! carries one permit per queued runtime, so waiting for a runtime is waiting
//! for a permit; there is no separate "in use" registry.
//!
//! # Release
//!
//! A released runtime is reset before it is queued again. A runtime that fails
//! to reset is closed and a replacement is built in the background so the pool
//! keeps its capacity. Once the pool is closed, released runtimes are closed
//! instead of queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::{PoolConfig, PoolStats};
use crate::dom::Document;
use crate::error::{PoolError, RuntimeError};
use crate::sandbox::{ExecutionResult, QuickJsEngine, Runtime, SandboxConfig, ScriptEngine};

struct PoolInner<E: ScriptEngine> {
    config: Arc<SandboxConfig>,
    size: usize,
    acquire_timeout: std::time::Duration,
    idle: Mutex<VecDeque<Runtime<E>>>,
    /// One permit per runtime in `idle`.
    available: Semaphore,
    closed: AtomicBool,
}

/// Outcome of offering a runtime back to the idle queue.
enum Offer<E: ScriptEngine> {
    Queued,
    Closed(Runtime<E>),
    Full(Runtime<E>),
}

impl<E: ScriptEngine> PoolInner<E> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn offer(&self, runtime: Runtime<E>) -> Offer<E> {
        let mut idle = self.idle.lock();
        if self.is_closed() {
            return Offer::Closed(runtime);
        }
        if idle.len() >= self.size {
            return Offer::Full(runtime);
        }
        idle.push_back(runtime);
        drop(idle);
        self.available.add_permits(1);
        Offer::Queued
    }
}

/// A fixed-size pool of [`Runtime`]s.
///
/// Cloning is cheap and yields a handle to the same pool.
pub struct SandboxPool<E: ScriptEngine = QuickJsEngine> {
    inner: Arc<PoolInner<E>>,
}

impl<E: ScriptEngine> Clone for SandboxPool<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: ScriptEngine> std::fmt::Debug for SandboxPool<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<E: ScriptEngine> SandboxPool<E> {
    /// Builds every runtime up front.
    ///
    /// Construction is all-or-nothing: if any runtime fails to build, the ones
    /// already built are dropped and no pool is returned.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Build` if a runtime cannot be created.
    #[instrument(skip_all, fields(size = pool_config.effective_size()))]
    pub fn new(config: SandboxConfig, pool_config: PoolConfig) -> Result<Self, PoolError> {
        let size = pool_config.effective_size();
        let config = Arc::new(config);

        let mut idle = VecDeque::with_capacity(size);
        for _ in 0..size {
            let runtime = Runtime::with_shared_config(Arc::clone(&config))
                .map_err(|source| PoolError::Build { source })?;
            idle.push_back(runtime);
        }
        debug!(size, "Runtime pool ready");

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                size,
                acquire_timeout: pool_config.acquire_timeout,
                idle: Mutex::new(idle),
                available: Semaphore::new(size),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Configuration shared by every runtime in the pool.
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Takes an idle runtime, waiting for one if none is free.
    ///
    /// The runtime is invisible to other callers until it is handed back with
    /// [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool is closed, `PoolError::Cancelled`
    /// if `cancel` fires first, and `PoolError::AcquireTimeout` if no runtime
    /// becomes idle within the acquisition timeout.
    #[instrument(skip_all)]
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Runtime<E>, PoolError> {
        if self.inner.is_closed() {
            return Err(PoolError::Closed);
        }

        let timeout = self.inner.acquire_timeout;
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PoolError::Cancelled),
            acquired = tokio::time::timeout(timeout, self.inner.available.acquire()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(PoolError::Closed),
                    Err(_) => {
                        debug!(?timeout, "No idle runtime within acquisition timeout");
                        return Err(PoolError::AcquireTimeout {
                            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                }
            }
        };
        // The permit stands for the runtime popped below; `offer` re-adds it.
        permit.forget();

        let runtime = self.inner.idle.lock().pop_front().ok_or(PoolError::Closed)?;
        trace!(runtime_id = %runtime.id(), "Acquired runtime");
        Ok(runtime)
    }

    /// Hands a runtime back to the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool has been closed (the runtime is
    /// closed rather than queued), or `PoolError::Reset` if the runtime could
    /// not be reset (it is closed and a replacement is built in the background).
    #[instrument(skip_all, fields(runtime_id = %runtime.id()))]
    pub async fn release(&self, runtime: Runtime<E>) -> Result<(), PoolError> {
        if self.inner.is_closed() {
            runtime.close().await;
            return Err(PoolError::Closed);
        }

        if let Err(source) = runtime.reset().await {
            warn!(error = %source, "Failed to reset runtime, replacing it");
            runtime.close().await;
            self.spawn_replacement();
            return Err(PoolError::Reset { source });
        }

        match self.inner.offer(runtime) {
            Offer::Queued => {
                trace!("Runtime returned to pool");
                Ok(())
            }
            Offer::Closed(runtime) => {
                runtime.close().await;
                Err(PoolError::Closed)
            }
            Offer::Full(runtime) => {
                warn!("Idle queue already full, closing surplus runtime");
                runtime.close().await;
                Ok(())
            }
        }
    }

    /// Acquires a runtime, runs one script on it and releases it.
    ///
    /// The runtime is released even if the returned future is dropped before
    /// it completes: while the script runs the lease owns it, and the release
    /// itself runs on its own task. Release failures are logged; the script's
    /// outcome is returned regardless.
    ///
    /// # Errors
    ///
    /// Returns any error from [`acquire`](Self::acquire), or
    /// `PoolError::Runtime` if the runtime itself failed.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        script: &str,
        document: Option<Arc<Document>>,
    ) -> Result<ExecutionResult, PoolError> {
        let runtime = self.acquire(cancel).await?;
        let mut lease = Lease {
            pool: self.clone(),
            runtime: Some(runtime),
        };

        let result = match &lease.runtime {
            Some(runtime) => runtime.execute(cancel, script, document).await,
            None => Err(RuntimeError::Closed),
        };
        if let Some(runtime) = lease.runtime.take() {
            let pool = self.clone();
            let release = tokio::spawn(async move { pool.release(runtime).await });
            match release.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "Failed to release runtime"),
                Err(join_err) => warn!(error = %join_err, "Release task failed"),
            }
        }

        Ok(result?)
    }

    /// Closes the pool and every idle runtime. Idempotent.
    ///
    /// Runtimes currently acquired are closed when they are released.
    #[instrument(skip_all)]
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.available.close();

        let drained: Vec<_> = self.inner.idle.lock().drain(..).collect();
        let count = drained.len();
        for runtime in drained {
            runtime.close().await;
        }
        debug!(closed_runtimes = count, "Runtime pool closed");
    }

    /// Point-in-time snapshot of pool occupancy.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let available = self.inner.idle.lock().len();
        PoolStats {
            size: self.inner.size,
            available,
            in_use: self.inner.size.saturating_sub(available),
            closed: self.inner.is_closed(),
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn spawn_replacement(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let runtime = match Runtime::<E>::with_shared_config(Arc::clone(&inner.config)) {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(
                        error = %err,
                        "Failed to build replacement runtime, pool capacity reduced"
                    );
                    return;
                }
            };
            match inner.offer(runtime) {
                Offer::Queued => debug!("Replacement runtime added to pool"),
                Offer::Closed(_) | Offer::Full(_) => trace!("Replacement runtime discarded"),
            }
        });
    }
}

/// Releases its runtime on a background task if dropped while still holding it.
struct Lease<E: ScriptEngine> {
    pool: SandboxPool<E>,
    runtime: Option<Runtime<E>>,
}

impl<E: ScriptEngine> Drop for Lease<E> {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = pool.release(runtime).await {
                        warn!(error = %err, "Failed to release abandoned runtime");
                    }
                });
            }
            Err(_) => warn!("No async runtime available, dropping abandoned runtime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, ScriptError};
    use crate::sandbox::{GlobalBindings, InterruptFlag};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Engine whose second construction fails; every other one succeeds.
    struct FailsOnSecondCreate;

    static SECOND_CREATE_CALLS: AtomicUsize = AtomicUsize::new(0);

    impl ScriptEngine for FailsOnSecondCreate {
        fn create(_: &SandboxConfig, _: Arc<InterruptFlag>) -> Result<Self, EngineError> {
            if SECOND_CREATE_CALLS.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(EngineError::Create("injected failure".into()));
            }
            Ok(Self)
        }

        fn install_globals(&mut self, _: &GlobalBindings) -> Result<(), EngineError> {
            Ok(())
        }

        fn bind_document(&mut self, _: Option<Arc<Document>>) -> Result<(), EngineError> {
            Ok(())
        }

        fn run(&mut self, script: &str) -> Result<serde_json::Value, ScriptError> {
            Ok(serde_json::Value::String(script.to_owned()))
        }
    }

    /// Engine that can never be constructed.
    struct NeverCreates;

    impl ScriptEngine for NeverCreates {
        fn create(_: &SandboxConfig, _: Arc<InterruptFlag>) -> Result<Self, EngineError> {
            Err(EngineError::Create("unavailable".into()))
        }

        fn install_globals(&mut self, _: &GlobalBindings) -> Result<(), EngineError> {
            Ok(())
        }

        fn bind_document(&mut self, _: Option<Arc<Document>>) -> Result<(), EngineError> {
            Ok(())
        }

        fn run(&mut self, _: &str) -> Result<serde_json::Value, ScriptError> {
            Ok(serde_json::Value::Null)
        }
    }

    /// Engine whose first construction is instant and every rebuild slow.
    struct SlowRebuild;

    static SLOW_REBUILD_CALLS: AtomicUsize = AtomicUsize::new(0);

    impl ScriptEngine for SlowRebuild {
        fn create(_: &SandboxConfig, _: Arc<InterruptFlag>) -> Result<Self, EngineError> {
            if SLOW_REBUILD_CALLS.fetch_add(1, Ordering::SeqCst) > 0 {
                std::thread::sleep(Duration::from_millis(200));
            }
            Ok(Self)
        }

        fn install_globals(&mut self, _: &GlobalBindings) -> Result<(), EngineError> {
            Ok(())
        }

        fn bind_document(&mut self, _: Option<Arc<Document>>) -> Result<(), EngineError> {
            Ok(())
        }

        fn run(&mut self, _: &str) -> Result<serde_json::Value, ScriptError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn pool(size: usize) -> SandboxPool {
        SandboxPool::new(
            SandboxConfig::default(),
            PoolConfig::new()
                .with_size(size)
                .with_acquire_timeout(Duration::from_millis(100)),
        )
        .unwrap()
    }

    #[test]
    fn test_construction_failure_is_atomic() {
        let err = SandboxPool::<NeverCreates>::new(SandboxConfig::default(), PoolConfig::new())
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::Build {
                source: RuntimeError::Engine(EngineError::Create(_))
            }
        ));
    }

    #[tokio::test]
    async fn test_stats_track_acquire_and_release() {
        let pool = pool(2);
        assert_eq!(
            pool.stats(),
            PoolStats {
                size: 2,
                available: 2,
                in_use: 0,
                closed: false
            }
        );

        let runtime = pool.acquire(&CancellationToken::new()).await.unwrap();
        assert_eq!(pool.stats().available, 1);
        assert_eq!(pool.stats().in_use, 1);

        pool.release(runtime).await.unwrap();
        assert_eq!(pool.stats().available, 2);
    }

    #[tokio::test]
    async fn test_zero_size_uses_default() {
        let pool = pool(0);
        assert_eq!(pool.stats().size, super::super::DEFAULT_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = pool(1);
        let _held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let err = pool.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout { timeout_ms: 100 }));
    }

    #[tokio::test]
    async fn test_acquire_honours_cancellation() {
        let pool = pool(1);
        let _held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pool.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, PoolError::Cancelled));
    }

    #[tokio::test]
    async fn test_surplus_runtime_is_closed() {
        let pool = pool(1);
        let extra: Runtime = Runtime::new(SandboxConfig::default()).unwrap();

        pool.release(extra).await.unwrap();
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn test_reset_failure_replaces_runtime() {
        let pool = SandboxPool::<FailsOnSecondCreate>::new(
            SandboxConfig::default(),
            PoolConfig::new().with_size(1),
        )
        .unwrap();

        let runtime = pool.acquire(&CancellationToken::new()).await.unwrap();
        let err = pool.release(runtime).await.unwrap_err();
        assert!(matches!(err, PoolError::Reset { .. }));

        for _ in 0..100 {
            if pool.stats().available == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.stats().available, 1);

        let result = pool
            .execute(&CancellationToken::new(), "still serving", None)
            .await
            .unwrap();
        assert_eq!(result.value, serde_json::json!("still serving"));
    }

    #[tokio::test]
    async fn test_dropped_execution_returns_runtime() {
        let pool: SandboxPool = SandboxPool::new(
            SandboxConfig::default().with_timeout(Duration::from_millis(200)),
            PoolConfig::new()
                .with_size(1)
                .with_acquire_timeout(Duration::from_secs(5)),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let execution = pool.execute(&cancel, "while (true) {}", None);
        let abandoned = tokio::time::timeout(Duration::from_millis(20), execution).await;
        assert!(abandoned.is_err());

        // The script halts at its own timeout, then the lease hands the
        // runtime back.
        let runtime = pool.acquire(&CancellationToken::new()).await.unwrap();
        pool.release(runtime).await.unwrap();
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn test_dropped_during_release_returns_runtime() {
        let pool = SandboxPool::<SlowRebuild>::new(
            SandboxConfig::default(),
            PoolConfig::new()
                .with_size(1)
                .with_acquire_timeout(Duration::from_secs(5)),
        )
        .unwrap();

        // The script finishes at once; the future is dropped while the
        // release is still rebuilding the interpreter.
        let cancel = CancellationToken::new();
        let execution = pool.execute(&cancel, "1", None);
        let abandoned = tokio::time::timeout(Duration::from_millis(50), execution).await;
        assert!(abandoned.is_err());

        let runtime = pool.acquire(&CancellationToken::new()).await.unwrap();
        assert_eq!(pool.stats().in_use, 1);
        pool.release(runtime).await.unwrap();
        assert_eq!(pool.stats().available, 1);
    }
}
