//! Script Sandbox - pooled execution of untrusted page scripts.
//!
//! This crate runs short JavaScript snippets inside embedded QuickJS
//! interpreters with a restricted global namespace, a hard per-execution
//! timeout, caller cancellation, captured console output and an optional
//! simplified DOM the script can query and annotate.
//!
//! # Components
//!
//! - [`dom`]: in-memory element tree with selector lookup and a change log
//! - [`sandbox`]: one interpreter per [`Runtime`], plus its configuration
//! - [`pool`]: a fixed set of runtimes reset between callers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use script_sandbox::dom::{Document, Element};
//! use script_sandbox::{PoolConfig, SandboxConfig, SandboxPool};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     let pool: SandboxPool = SandboxPool::new(SandboxConfig::default(), PoolConfig::default())?;
//!
//!     let document = Arc::new(Document::new());
//!     let body = document.create_element(Element::new("body"));
//!     document.append_child(document.root(), body)?;
//!     document.add_element(body, Element::new("div").with_id("main"))?;
//!
//!     let result = pool
//!         .execute(
//!             &CancellationToken::new(),
//!             "document.getElementById('main').setAttribute('data-seen', 'yes')",
//!             Some(Arc::clone(&document)),
//!         )
//!         .await?;
//!
//!     assert!(result.success());
//!     assert_eq!(result.dom_changes[0].selector, "#main");
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

pub mod dom;
pub mod error;
pub mod pool;
pub mod sandbox;

// Re-export commonly used types
pub use dom::{DomChange, Document, Element};
pub use error::{Error, Result, ScriptError};
pub use pool::{PoolConfig, PoolStats, SandboxPool};
pub use sandbox::{ConsoleEntry, ConsoleLevel, ExecutionResult, Runtime, SandboxConfig};
