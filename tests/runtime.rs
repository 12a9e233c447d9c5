//! Integration tests for single execution environments.
//!
//! These tests cover a runtime's observable contract: completion values,
//! console capture, timeouts, caller cancellation, reset and the bound
//! `document` proxy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use script_sandbox::dom::{Document, Element};
use script_sandbox::sandbox::{Runtime, SandboxConfig};
use script_sandbox::{ConsoleLevel, ScriptError};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn runtime() -> Runtime {
    Runtime::new(SandboxConfig::default()).expect("failed to create runtime")
}

/// Document with `<body><div id="main" class="content primary">Hello</div>
/// <p class="note">a</p><p>b</p></body>`.
fn page() -> Arc<Document> {
    let document = Document::new();
    let body = document
        .add_element(document.root(), Element::new("body"))
        .expect("failed to add body");
    document
        .add_element(
            body,
            Element::new("div")
                .with_id("main")
                .with_class("content primary")
                .with_text("Hello")
                .with_attribute("data-role", "panel"),
        )
        .expect("failed to add div");
    document
        .add_element(body, Element::new("p").with_class("note").with_text("a"))
        .expect("failed to add p");
    document
        .add_element(body, Element::new("p").with_text("b"))
        .expect("failed to add p");
    Arc::new(document)
}

// =============================================================================
// Completion Value Tests
// =============================================================================

/// Test that arithmetic yields an integer value.
#[tokio::test]
async fn test_arithmetic_value() {
    let result = runtime()
        .execute(&CancellationToken::new(), "1 + 2", None)
        .await
        .expect("execute failed");

    assert!(result.success());
    assert_eq!(result.value, json!(3));
    assert!(result.console.is_empty());
    assert!(result.dom_changes.is_empty());
}

/// Test that a bare literal without a document yields its value.
#[tokio::test]
async fn test_literal_value() {
    let result = runtime()
        .execute(&CancellationToken::new(), "42", None)
        .await
        .expect("execute failed");

    assert_eq!(result.value, json!(42));
    assert!(result.error.is_none());
}

/// Test that structured values are converted recursively.
#[tokio::test]
async fn test_structured_value() {
    let result = runtime()
        .execute(
            &CancellationToken::new(),
            "({ name: 'x', tags: ['a', 'b'], ratio: 0.5, \
               nested: { ok: true, nothing: undefined } })",
            None,
        )
        .await
        .expect("execute failed");

    assert_eq!(
        result.value,
        json!({
            "name": "x",
            "tags": ["a", "b"],
            "ratio": 0.5,
            "nested": {"ok": true, "nothing": null}
        })
    );
}

/// Test that undefined and non-finite numbers become null.
#[tokio::test]
async fn test_neutral_values() {
    let runtime = runtime();
    let cancel = CancellationToken::new();

    for script in ["undefined", "null", "0 / 0", "1 / 0", "Symbol('s')"] {
        let result = runtime
            .execute(&cancel, script, None)
            .await
            .expect("execute failed");
        assert!(result.success(), "{script}: {:?}", result.error);
        assert_eq!(result.value, json!(null), "{script}");
    }
}

/// Test that a syntax error is reported in the result, not as a failure.
#[tokio::test]
async fn test_syntax_error_reported() {
    let result = runtime()
        .execute(&CancellationToken::new(), "console.log('before'); let = ;", None)
        .await
        .expect("execute failed");

    assert!(matches!(result.error, Some(ScriptError::Exception { .. })));
    assert_eq!(result.value, json!(null));
}

// =============================================================================
// Console Capture Tests
// =============================================================================

/// Test that console entries keep call order and level.
#[tokio::test]
async fn test_console_order_and_value() {
    let result = runtime()
        .execute(
            &CancellationToken::new(),
            "console.log('a'); console.warn('b'); 'done'",
            None,
        )
        .await
        .expect("execute failed");

    assert_eq!(result.value, json!("done"));
    assert_eq!(result.console.len(), 2);
    assert_eq!(result.console[0].level, ConsoleLevel::Log);
    assert_eq!(result.console[0].message, "a");
    assert_eq!(result.console[1].level, ConsoleLevel::Warn);
    assert_eq!(result.console[1].message, "b");
}

/// Test that arguments are stringified and joined with single spaces.
#[tokio::test]
async fn test_console_joins_arguments() {
    let result = runtime()
        .execute(
            &CancellationToken::new(),
            "console.info('count', 3, true, null); console.error()",
            None,
        )
        .await
        .expect("execute failed");

    assert_eq!(result.console[0].level, ConsoleLevel::Info);
    assert_eq!(result.console[0].message, "count 3 true null");
    assert_eq!(result.console[1].level, ConsoleLevel::Error);
    assert_eq!(result.console[1].message, "");
}

/// Test that a reused runtime never returns a previous execution's entries.
#[tokio::test]
async fn test_console_cleared_between_executions() {
    let runtime = runtime();
    let cancel = CancellationToken::new();

    runtime
        .execute(&cancel, "console.log('first')", None)
        .await
        .expect("execute failed");
    let result = runtime
        .execute(&cancel, "console.log('second')", None)
        .await
        .expect("execute failed");

    assert_eq!(result.console.len(), 1);
    assert_eq!(result.console[0].message, "second");
}

/// Test that console output before a failure is kept.
#[tokio::test]
async fn test_console_survives_exception() {
    let result = runtime()
        .execute(
            &CancellationToken::new(),
            "console.log('partial'); throw new Error('boom')",
            None,
        )
        .await
        .expect("execute failed");

    assert!(result.error.expect("should fail").to_string().contains("boom"));
    assert_eq!(result.console.len(), 1);
    assert_eq!(result.console[0].message, "partial");
}

/// Test that console is undefined when disabled.
#[tokio::test]
async fn test_console_disabled() {
    let runtime: Runtime = Runtime::new(SandboxConfig::default().with_console(false))
        .expect("failed to create runtime");
    let result = runtime
        .execute(&CancellationToken::new(), "typeof console", None)
        .await
        .expect("execute failed");

    assert_eq!(result.value, json!("undefined"));
}

// =============================================================================
// Interruption Tests
// =============================================================================

/// Test that an infinite loop is halted by the timeout.
#[tokio::test]
async fn test_infinite_loop_times_out() {
    let runtime: Runtime =
        Runtime::new(SandboxConfig::default().with_timeout(Duration::from_millis(100)))
            .expect("failed to create runtime");

    let started = Instant::now();
    let result = runtime
        .execute(
            &CancellationToken::new(),
            "console.log('spinning'); while (true) {}",
            None,
        )
        .await
        .expect("execute failed");

    assert_eq!(result.error, Some(ScriptError::Timeout { timeout_ms: 100 }));
    assert!(result.duration >= Duration::from_millis(100));
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "returned after {:?}",
        started.elapsed()
    );
    assert_eq!(result.console.len(), 1);
}

/// Test that caller cancellation halts a running script.
#[tokio::test]
async fn test_cancellation_interrupts() {
    let runtime = runtime();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = runtime
        .execute(&cancel, "while (true) {}", None)
        .await
        .expect("execute failed");
    assert_eq!(result.error, Some(ScriptError::Cancelled));
    assert!(result.duration < SandboxConfig::default().timeout);
}

/// Test that a timed-out runtime runs the next script normally.
#[tokio::test]
async fn test_runtime_usable_after_timeout() {
    let runtime: Runtime =
        Runtime::new(SandboxConfig::default().with_timeout(Duration::from_millis(50)))
            .expect("failed to create runtime");
    let cancel = CancellationToken::new();

    let result = runtime
        .execute(&cancel, "while (true) {}", None)
        .await
        .expect("execute failed");
    assert!(result.error.is_some_and(|e| e.is_interrupt()));

    let result = runtime
        .execute(&cancel, "'alive'", None)
        .await
        .expect("execute failed");
    assert_eq!(result.value, json!("alive"));
}

/// Test that a huge sparse completion value fails fast instead of being
/// materialized past the timeout.
#[tokio::test]
async fn test_sparse_array_value_is_bounded() {
    let runtime: Runtime =
        Runtime::new(SandboxConfig::default().with_timeout(Duration::from_millis(200)))
            .expect("failed to create runtime");

    let started = Instant::now();
    let result = runtime
        .execute(&CancellationToken::new(), "new Array(20000000)", None)
        .await
        .expect("execute failed");

    assert!(result.error.is_some());
    assert_eq!(result.value, json!(null));
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "returned after {:?}",
        started.elapsed()
    );
}

/// Test that an array whose length exceeds `i32::MAX` is reported as a script
/// error rather than failing the runtime, with or without a heap ceiling.
#[tokio::test]
async fn test_huge_length_array_is_script_error() {
    for memory_limit_mb in [50, 0] {
        let runtime: Runtime =
            Runtime::new(SandboxConfig::default().with_memory_limit_mb(memory_limit_mb))
                .expect("failed to create runtime");
        let result = runtime
            .execute(
                &CancellationToken::new(),
                "const a = []; a.length = 4294967295; a",
                None,
            )
            .await
            .expect("execute failed");

        assert!(
            matches!(result.error, Some(ScriptError::Exception { .. })),
            "limit {memory_limit_mb}: {:?}",
            result.error
        );

        let result = runtime
            .execute(&CancellationToken::new(), "'still usable'", None)
            .await
            .expect("execute failed");
        assert_eq!(result.value, json!("still usable"));
    }
}

// =============================================================================
// Reset Tests
// =============================================================================

/// Test that reset scrubs global state left by a script.
#[tokio::test]
async fn test_reset_scrubs_globals() {
    let runtime = runtime();
    let cancel = CancellationToken::new();

    runtime
        .execute(&cancel, "globalThis.leaked = 42; Array.prototype.evil = 1", None)
        .await
        .expect("execute failed");
    runtime.reset().await.expect("reset failed");

    let result = runtime
        .execute(&cancel, "[typeof leaked, [].evil === undefined]", None)
        .await
        .expect("execute failed");
    assert_eq!(result.value, json!(["undefined", true]));
}

/// Test that without reset, state persists on the same runtime.
#[tokio::test]
async fn test_state_persists_without_reset() {
    let runtime = runtime();
    let cancel = CancellationToken::new();

    runtime
        .execute(&cancel, "globalThis.counter = 1", None)
        .await
        .expect("execute failed");
    let result = runtime
        .execute(&cancel, "counter + 1", None)
        .await
        .expect("execute failed");
    assert_eq!(result.value, json!(2));
}

// =============================================================================
// Document Binding Tests
// =============================================================================

/// Test that the document proxy exposes element properties.
#[tokio::test]
async fn test_document_element_properties() {
    let result = runtime()
        .execute(
            &CancellationToken::new(),
            "const el = document.getElementById('main'); \
             [el.tagName, el.id, el.className, el.textContent, el.getAttribute('data-role')]",
            Some(page()),
        )
        .await
        .expect("execute failed");

    assert_eq!(
        result.value,
        json!(["div", "main", "content primary", "Hello", "panel"])
    );
}

/// Test the query methods and their empty results.
#[tokio::test]
async fn test_document_queries() {
    let result = runtime()
        .execute(
            &CancellationToken::new(),
            "[document.querySelectorAll('p').length, \
              document.getElementsByTagName('P').length, \
              document.getElementsByClassName('note').length, \
              document.querySelector('.primary').id, \
              document.querySelector('#missing'), \
              document.getElementById('missing'), \
              document.querySelectorAll('div > p').length, \
              document.getElementById('main').getAttribute('nope')]",
            Some(page()),
        )
        .await
        .expect("execute failed");

    assert_eq!(result.value, json!([2, 2, 1, "main", null, null, 0, null]));
}

/// Test that setAttribute writes through and records a change.
#[tokio::test]
async fn test_set_attribute_records_change() {
    let document = page();
    let result = runtime()
        .execute(
            &CancellationToken::new(),
            "const el = document.getElementById('main'); \
             el.setAttribute('data-state', 'open'); \
             document.querySelectorAll('p')[1].setAttribute('title', 7); \
             el.getAttribute('data-state')",
            Some(Arc::clone(&document)),
        )
        .await
        .expect("execute failed");

    assert_eq!(result.value, json!("open"));
    assert_eq!(result.dom_changes.len(), 2);
    assert_eq!(result.dom_changes[0].change_type, "attribute");
    assert_eq!(result.dom_changes[0].selector, "#main");
    assert_eq!(result.dom_changes[0].property, "data-state");
    assert_eq!(result.dom_changes[0].value, "open");
    assert_eq!(result.dom_changes[1].selector, "p");
    assert_eq!(result.dom_changes[1].value, "7");
    assert_eq!(document.changes(), result.dom_changes);
}

/// Test that changes are not reported when the script fails.
#[tokio::test]
async fn test_failed_script_reports_no_changes() {
    let result = runtime()
        .execute(
            &CancellationToken::new(),
            "document.getElementById('main').setAttribute('a', 'b'); throw 'late'",
            Some(page()),
        )
        .await
        .expect("execute failed");

    assert!(result.error.is_some());
    assert!(result.dom_changes.is_empty());
}

/// Test that document is undefined when no document is supplied.
#[tokio::test]
async fn test_document_absent_without_model() {
    let runtime = runtime();
    let cancel = CancellationToken::new();

    runtime
        .execute(&cancel, "typeof document", Some(page()))
        .await
        .expect("execute failed");
    let result = runtime
        .execute(&cancel, "typeof document", None)
        .await
        .expect("execute failed");
    assert_eq!(result.value, json!("undefined"));
}
