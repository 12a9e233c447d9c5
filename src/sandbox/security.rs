//! The restricted global namespace.
//!
//! Sandboxed code must never observe a working host capability. QuickJS has no
//! filesystem, process or module-loading globals of its own, but page scripts
//! routinely probe for Node-style names, so those are pinned to `undefined`
//! rather than left for a script to define and then trust.
//!
//! # Neutralized globals
//!
//! - `require`, `module`, `exports`, `process`, `Buffer`, `__dirname`,
//!   `__filename`, `importScripts`: always `undefined`
//! - `setTimeout`, `setInterval`, `setImmediate`, `clearTimeout`,
//!   `clearInterval`, `queueMicrotask`: inert functions returning `0`
//! - `fetch`: `undefined`, or an inert function returning `undefined` when
//!   network binding is enabled

/// Host-capability names that are always bound to `undefined`.
pub const BLOCKED_GLOBALS: &[&str] = &[
    "require",
    "module",
    "exports",
    "process",
    "Buffer",
    "__dirname",
    "__filename",
    "importScripts",
];

/// Scheduling functions replaced by inert stubs.
pub const TIMER_GLOBALS: &[&str] = &[
    "setTimeout",
    "setInterval",
    "setImmediate",
    "clearTimeout",
    "clearInterval",
    "queueMicrotask",
];

/// Installs the timer stubs listed in [`TIMER_GLOBALS`].
pub(crate) const TIMER_PRELUDE: &str = r#"
(() => {
    const inert = function () { return 0; };
    for (const name of ["setTimeout", "setInterval", "setImmediate",
                        "clearTimeout", "clearInterval", "queueMicrotask"]) {
        globalThis[name] = inert;
    }
})();
"#;

/// Installs `fetch` as a no-op until a proxied bridge exists.
pub(crate) const FETCH_STUB: &str = r#"
globalThis.fetch = function fetch() { return undefined; };
"#;
