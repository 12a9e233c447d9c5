//! QuickJS-backed [`ScriptEngine`].
//!
//! Heap size and stack depth are enforced by QuickJS itself
//! (`set_memory_limit`, `set_max_stack_size`). Interrupts are delivered through
//! the runtime's interrupt hook, which QuickJS polls at bytecode-dispatch
//! granularity; a script blocked inside a single native call is only halted
//! once that call returns.

use std::sync::Arc;

use rquickjs::convert::Coerced;
use rquickjs::function::{Opt, Rest};
use rquickjs::{
    Array, CatchResultExt, Context, Ctx, Exception, Function, IntoJs, Object, Runtime as JsRuntime,
    Undefined, Value,
};
use tracing::{debug, trace};

use super::console::{ConsoleBuffer, ConsoleLevel};
use super::engine::{GlobalBindings, InterruptFlag, ScriptEngine};
use super::security::{BLOCKED_GLOBALS, FETCH_STUB, TIMER_PRELUDE};
use super::SandboxConfig;
use crate::dom::{DomChange, Document, NodeId};
use crate::error::{EngineError, ScriptError};

/// Nesting depth past which converted values are cut off as `null`.
const MAX_VALUE_DEPTH: usize = 32;

/// Largest integer a double represents exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Approximate host bytes charged per converted value node.
const NODE_COST: usize = std::mem::size_of::<serde_json::Value>();

/// Conversion budget in bytes when the heap ceiling is disabled.
const DEFAULT_VALUE_BUDGET: usize = 256 * 1024 * 1024;

/// `document` methods: (name, selector prefix, returns every match).
const DOCUMENT_METHODS: &[(&str, &str, bool)] = &[
    ("querySelector", "", false),
    ("querySelectorAll", "", true),
    ("getElementById", "#", false),
    ("getElementsByClassName", ".", true),
    ("getElementsByTagName", "", true),
];

/// One QuickJS runtime with a single full context.
pub struct QuickJsEngine {
    // Declared before the runtime so the context is freed first.
    context: Context,
    _runtime: JsRuntime,
    interrupt: Arc<InterruptFlag>,
    /// Host bytes the completion value may occupy once converted.
    value_budget: usize,
}

impl std::fmt::Debug for QuickJsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickJsEngine").finish_non_exhaustive()
    }
}

impl ScriptEngine for QuickJsEngine {
    fn create(config: &SandboxConfig, interrupt: Arc<InterruptFlag>) -> Result<Self, EngineError> {
        let runtime = JsRuntime::new().map_err(|e| EngineError::Create(e.to_string()))?;
        if let Some(limit) = config.memory_limit_bytes() {
            runtime.set_memory_limit(limit);
        }
        runtime.set_max_stack_size(config.max_stack_size);
        let hook = Arc::clone(&interrupt);
        runtime.set_interrupt_handler(Some(Box::new(move || hook.is_raised())));

        let context = Context::full(&runtime).map_err(|e| EngineError::Create(e.to_string()))?;
        trace!(
            memory_limit_mb = config.memory_limit_mb,
            max_stack_size = config.max_stack_size,
            "Created QuickJS runtime"
        );
        Ok(Self {
            context,
            _runtime: runtime,
            interrupt,
            value_budget: config.memory_limit_bytes().unwrap_or(DEFAULT_VALUE_BUDGET),
        })
    }

    fn install_globals(&mut self, bindings: &GlobalBindings) -> Result<(), EngineError> {
        self.context.with(|ctx| {
            install_globals(&ctx, bindings).map_err(|e| EngineError::Setup(e.to_string()))
        })
    }

    fn bind_document(&mut self, document: Option<Arc<Document>>) -> Result<(), EngineError> {
        self.context.with(move |ctx| {
            let bound = match document {
                Some(document) => document_object(&ctx, document)
                    .and_then(|object| ctx.globals().set("document", object)),
                None => ctx.globals().set("document", Undefined),
            };
            bound.map_err(|e| EngineError::Setup(format!("failed to bind document: {e}")))
        })
    }

    fn run(&mut self, script: &str) -> Result<serde_json::Value, ScriptError> {
        let interrupt = &self.interrupt;
        let budget = self.value_budget;
        self.context.with(|ctx| {
            let value = ctx
                .eval::<Value, _>(script)
                .catch(&ctx)
                .map_err(|caught| ScriptError::Exception {
                    message: caught.to_string(),
                })?;
            Converter::new(&ctx, interrupt, budget).convert(&value, 0)
        })
    }
}

fn install_globals(ctx: &Ctx<'_>, bindings: &GlobalBindings) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    for name in BLOCKED_GLOBALS {
        globals.set(*name, Undefined)?;
    }

    match &bindings.console {
        Some(buffer) => globals.set("console", console_object(ctx, buffer)?)?,
        None => globals.set("console", Undefined)?,
    }

    ctx.eval::<(), _>(TIMER_PRELUDE)?;
    if bindings.network {
        ctx.eval::<(), _>(FETCH_STUB)?;
    } else {
        globals.set("fetch", Undefined)?;
    }
    globals.set("document", Undefined)
}

fn console_object<'js>(ctx: &Ctx<'js>, buffer: &ConsoleBuffer) -> rquickjs::Result<Object<'js>> {
    let console = Object::new(ctx.clone())?;
    for level in ConsoleLevel::ALL {
        let buffer = buffer.clone();
        let method = Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            let message = args
                .0
                .into_iter()
                .map(|arg| arg.0)
                .collect::<Vec<_>>()
                .join(" ");
            buffer.push(level, message);
        })?
        .with_name(level.as_str())?;
        console.set(level.as_str(), method)?;
    }
    Ok(console)
}

fn document_object<'js>(ctx: &Ctx<'js>, document: Arc<Document>) -> rquickjs::Result<Object<'js>> {
    let object = Object::new(ctx.clone())?;
    for &(name, prefix, all) in DOCUMENT_METHODS {
        let document = Arc::clone(&document);
        let method = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, selector: Opt<Coerced<String>>| -> rquickjs::Result<Value<'js>> {
                let matches = match selector.0 {
                    Some(Coerced(selector)) => document.query(&format!("{prefix}{selector}")),
                    None => Vec::new(),
                };
                trace!(method = name, matches = matches.len(), "document query");

                if all {
                    let array = Array::new(ctx.clone())?;
                    for (index, node) in matches.into_iter().enumerate() {
                        array.set(index, element_object(&ctx, &document, node)?)?;
                    }
                    return Ok(array.into_value());
                }
                match matches.first() {
                    Some(node) => element_object(&ctx, &document, *node),
                    None => Ok(Value::new_null(ctx)),
                }
            },
        )?
        .with_name(name)?;
        object.set(name, method)?;
    }
    Ok(object)
}

/// Plain object view of one element; attribute access goes through to the tree.
fn element_object<'js>(
    ctx: &Ctx<'js>,
    document: &Arc<Document>,
    node: NodeId,
) -> rquickjs::Result<Value<'js>> {
    let Some(element) = document.element(node) else {
        return Ok(Value::new_null(ctx.clone()));
    };

    let object = Object::new(ctx.clone())?;
    object.set("tagName", element.tag_name)?;
    object.set("id", element.id)?;
    object.set("className", element.class_name)?;
    object.set("textContent", element.text_content)?;

    let reader = Arc::clone(document);
    let get_attribute = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, name: Coerced<String>| -> rquickjs::Result<Value<'js>> {
            match reader.get_attribute(node, &name.0) {
                Some(value) => value.into_js(&ctx),
                None => Ok(Value::new_null(ctx)),
            }
        },
    )?
    .with_name("getAttribute")?;
    object.set("getAttribute", get_attribute)?;

    let writer = Arc::clone(document);
    let set_attribute = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>,
              name: Coerced<String>,
              value: Coerced<String>|
              -> rquickjs::Result<()> {
            let selector = writer
                .element(node)
                .map(|element| element.selector())
                .unwrap_or_default();
            writer
                .set_attribute(node, &name.0, &value.0)
                .map_err(|e| Exception::throw_message(&ctx, &e.to_string()))?;
            debug!(%selector, attribute = %name.0, "Script set attribute");
            writer.record_change(DomChange::attribute(selector, name.0, value.0));
            Ok(())
        },
    )?
    .with_name("setAttribute")?;
    object.set("setAttribute", set_attribute)?;

    Ok(object.into_value())
}

/// Converts a completion value into JSON.
///
/// `undefined`, functions, symbols and non-finite numbers become `null`.
/// Conversion runs outside the interpreter's interrupt hook, so it polls the
/// interrupt flag itself and charges every node against a byte budget; the
/// array length is read as a number because scripts can set it to any
/// `u32`.
struct Converter<'a, 'js> {
    ctx: &'a Ctx<'js>,
    interrupt: &'a InterruptFlag,
    budget: usize,
    remaining: usize,
}

impl<'a, 'js> Converter<'a, 'js> {
    fn new(ctx: &'a Ctx<'js>, interrupt: &'a InterruptFlag, budget: usize) -> Self {
        Self {
            ctx,
            interrupt,
            budget,
            remaining: budget,
        }
    }

    fn convert(
        &mut self,
        value: &Value<'js>,
        depth: usize,
    ) -> Result<serde_json::Value, ScriptError> {
        self.poll()?;
        self.charge(NODE_COST)?;
        if depth > MAX_VALUE_DEPTH
            || value.is_undefined()
            || value.is_null()
            || value.is_function()
        {
            return Ok(serde_json::Value::Null);
        }
        if let Some(flag) = value.as_bool() {
            return Ok(serde_json::Value::Bool(flag));
        }
        if let Some(int) = value.as_int() {
            return Ok(serde_json::Value::from(int));
        }
        if let Some(float) = value.as_float() {
            return Ok(number_to_json(float));
        }
        if let Some(string) = value.as_string() {
            let string = string.to_string().map_err(|e| self.exception(e))?;
            self.charge(string.len())?;
            return Ok(serde_json::Value::String(string));
        }
        if let Some(array) = value.as_array() {
            let object: &Object<'js> = array;
            let length: f64 = object.get("length").map_err(|e| self.exception(e))?;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let length = length.max(0.0) as usize;
            if length.saturating_mul(NODE_COST) > self.remaining {
                return Err(self.too_large());
            }
            let mut items = Vec::new();
            for index in 0..length {
                let item: Value = array.get(index).map_err(|e| self.exception(e))?;
                items.push(self.convert(&item, depth + 1)?);
            }
            return Ok(serde_json::Value::Array(items));
        }
        if let Some(object) = value.as_object() {
            let mut map = serde_json::Map::new();
            for prop in object.props::<String, Value>() {
                let (key, item) = prop.map_err(|e| self.exception(e))?;
                self.charge(key.len())?;
                let item = self.convert(&item, depth + 1)?;
                map.insert(key, item);
            }
            return Ok(serde_json::Value::Object(map));
        }
        Ok(serde_json::Value::Null)
    }

    /// Fails once a timeout or cancellation has been requested; the runtime
    /// tags the error with the interrupt's reason.
    fn poll(&self) -> Result<(), ScriptError> {
        if self.interrupt.is_raised() {
            return Err(ScriptError::Exception {
                message: String::from("interrupted while converting the completion value"),
            });
        }
        Ok(())
    }

    fn charge(&mut self, bytes: usize) -> Result<(), ScriptError> {
        match self.remaining.checked_sub(bytes) {
            Some(remaining) => {
                self.remaining = remaining;
                Ok(())
            }
            None => Err(self.too_large()),
        }
    }

    fn too_large(&self) -> ScriptError {
        ScriptError::Exception {
            message: format!(
                "completion value exceeds the {} byte conversion limit",
                self.budget
            ),
        }
    }

    fn exception(&self, error: rquickjs::Error) -> ScriptError {
        let message = match Err::<(), _>(error).catch(self.ctx) {
            Err(caught) => caught.to_string(),
            Ok(()) => String::new(),
        };
        ScriptError::Exception { message }
    }
}

fn number_to_json(number: f64) -> serde_json::Value {
    if number.is_finite() && number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER {
        #[allow(clippy::cast_possible_truncation)]
        return serde_json::Value::from(number as i64);
    }
    serde_json::Number::from_f64(number)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}
