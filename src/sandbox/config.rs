//! Configuration for sandbox runtimes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by every runtime in a pool.
///
/// Use the builder methods to customize the sandbox behavior.
///
/// # Example
///
/// ```
/// use script_sandbox::SandboxConfig;
/// use std::time::Duration;
///
/// let config = SandboxConfig::default()
///     .with_timeout(Duration::from_millis(250))
///     .with_memory_limit_mb(32)
///     .with_dom(false);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Heap ceiling for one interpreter instance, in megabytes. `0` disables the limit.
    pub memory_limit_mb: usize,

    /// Interpreter call-stack ceiling, in bytes.
    pub max_stack_size: usize,

    /// Maximum wall-clock time a single script may run.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,

    /// Install `console.log/warn/info/error`.
    pub enable_console: bool,

    /// Bind a `document` global when an execution supplies a document.
    pub enable_dom: bool,

    /// Install the inert `fetch` stub.
    pub enable_network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 50,
            max_stack_size: 512 * 1024,
            timeout: Duration::from_secs(5),
            enable_console: true,
            enable_dom: true,
            enable_network: false,
        }
    }
}

impl SandboxConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the heap ceiling in megabytes.
    #[must_use]
    pub fn with_memory_limit_mb(mut self, memory_limit_mb: usize) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self
    }

    /// Sets the call-stack ceiling in bytes.
    #[must_use]
    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    /// Sets the script execution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables console capture.
    #[must_use]
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.enable_console = enabled;
        self
    }

    /// Enables or disables the `document` binding.
    #[must_use]
    pub fn with_dom(mut self, enabled: bool) -> Self {
        self.enable_dom = enabled;
        self
    }

    /// Enables or disables the `fetch` stub.
    #[must_use]
    pub fn with_network(mut self, enabled: bool) -> Self {
        self.enable_network = enabled;
        self
    }

    /// Heap ceiling in bytes, or `None` when unlimited.
    #[must_use]
    pub fn memory_limit_bytes(&self) -> Option<usize> {
        (self.memory_limit_mb > 0).then(|| self.memory_limit_mb.saturating_mul(1024 * 1024))
    }

    /// Timeout in whole milliseconds, saturating.
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
