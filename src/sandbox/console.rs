//! Console capture for sandboxed scripts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Maximum number of entries kept per execution; later calls are dropped.
pub const MAX_CONSOLE_ENTRIES: usize = 10_000;

/// Maximum length of a single message in bytes; longer messages are truncated.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Console method that produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
    Info,
}

impl ConsoleLevel {
    /// Every level, in the order the `console` object exposes them.
    pub const ALL: [Self; 4] = [Self::Log, Self::Warn, Self::Error, Self::Info];

    /// Method name on the `console` object.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured console call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    /// Arguments stringified and joined with single spaces.
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-runtime buffer the `console` bindings append to.
///
/// Cloning shares the underlying buffer.
#[derive(Debug, Clone, Default)]
pub struct ConsoleBuffer {
    entries: Arc<Mutex<Vec<ConsoleEntry>>>,
}

impl ConsoleBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry stamped with the current time.
    pub fn push(&self, level: ConsoleLevel, mut message: String) {
        let mut entries = self.entries.lock();
        if entries.len() >= MAX_CONSOLE_ENTRIES {
            return;
        }
        if message.len() > MAX_MESSAGE_BYTES {
            let mut cut = MAX_MESSAGE_BYTES;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        trace!(target: "sandbox::console", %level, %message);
        entries.push(ConsoleEntry {
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Copy of the entries, in call order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConsoleEntry> {
        self.entries.lock().clone()
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
