//! Bounded pools of reusable runtimes.
//!
//! A [`SandboxPool`] builds a fixed number of [`Runtime`](crate::sandbox::Runtime)s
//! up front and hands them out one caller at a time. Released runtimes are
//! reset before they become available again, so nothing a script leaves behind
//! is visible to the next caller.
//!
//! # Example
//!
//! ```no_run
//! use script_sandbox::pool::{PoolConfig, SandboxPool};
//! use script_sandbox::sandbox::SandboxConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), script_sandbox::Error> {
//! let pool: SandboxPool = SandboxPool::new(SandboxConfig::default(), PoolConfig::default())?;
//!
//! let result = pool
//!     .execute(&CancellationToken::new(), "[1, 2, 3].map(x => x * 2)", None)
//!     .await?;
//! assert_eq!(result.value, serde_json::json!([2, 4, 6]));
//!
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

mod lifecycle;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use lifecycle::SandboxPool;

/// Number of runtimes built when no positive size is configured.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// How long [`SandboxPool::acquire`] waits for an idle runtime by default.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool sizing and acquisition settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of runtimes; `0` falls back to [`DEFAULT_POOL_SIZE`].
    pub size: usize,

    /// Maximum time to wait for an idle runtime.
    #[serde(rename = "acquire_timeout_ms", with = "crate::sandbox::duration_ms")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of runtimes.
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Sets the acquisition timeout.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Size actually used by the pool.
    #[must_use]
    pub fn effective_size(&self) -> usize {
        if self.size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            self.size
        }
    }
}

/// Point-in-time view of a pool.
///
/// `in_use` is derived from `size - available` and is approximate while other
/// callers are acquiring or releasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
    pub closed: bool,
}
