//! Sandboxed expression engine.
//!
//! Scripted transformers evaluate user expressions with an embedded QuickJS
//! engine. One engine lives per worker thread, created lazily on first use
//! and torn down when the last script registered on that thread is released.
//! The engine is capped at 50 MB of heap and five seconds per invocation; an
//! interrupt handler aborts evaluation past the deadline. QuickJS exposes no
//! file, network or process access, so user scripts only ever see the row
//! they are handed.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::{Array, Context, Function, Object, Runtime, Value as JsValue};

use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::row::{Row, Value};
use rowpipe_core::schema::Schema;

pub const MEMORY_LIMIT_BYTES: usize = 50 * 1024 * 1024;
pub const INVOCATION_TIMEOUT: Duration = Duration::from_secs(5);

/// A script result lifted out of the engine before the context borrow ends.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<ScriptValue>),
    Object(Vec<(String, ScriptValue)>),
}

impl ScriptValue {
    /// JavaScript truthiness: `false`, `0`, `NaN`, `""`, `null` and
    /// `undefined` are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            ScriptValue::Undefined | ScriptValue::Null => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ScriptValue::String(s) => !s.is_empty(),
            ScriptValue::Array(_) | ScriptValue::Object(_) => true,
        }
    }

    /// Marshal back into a row value, narrowing integral numbers when the
    /// target column is an integer type.
    pub fn into_value(self, target: rowpipe_core::row::LogicalType) -> Value {
        use rowpipe_core::row::LogicalType as T;
        match self {
            ScriptValue::Undefined | ScriptValue::Null => Value::Null,
            ScriptValue::Bool(b) => Value::Bool(b),
            ScriptValue::Number(n) => match target {
                T::Int32 if n.fract() == 0.0 => Value::Int32(n as i32),
                T::Int64 if n.fract() == 0.0 => Value::Int64(n as i64),
                T::Float32 => Value::Float32(n as f32),
                // String carriers keep carrying strings.
                T::String => Value::String(n.to_string()),
                _ => Value::Float64(n),
            },
            ScriptValue::String(s) => Value::String(s),
            other => Value::String(other.render()),
        }
    }

    /// String form for non-primitive results (round-trip via string).
    fn render(&self) -> String {
        match self {
            ScriptValue::Undefined => "undefined".to_string(),
            ScriptValue::Null => "null".to_string(),
            ScriptValue::Bool(b) => b.to_string(),
            ScriptValue::Number(n) => n.to_string(),
            ScriptValue::String(s) => s.clone(),
            ScriptValue::Array(items) => {
                let inner: Vec<String> = items.iter().map(|i| i.render()).collect();
                format!("[{}]", inner.join(","))
            }
            ScriptValue::Object(props) => {
                let inner: Vec<String> = props
                    .iter()
                    .map(|(k, v)| format!("{k}:{}", v.render()))
                    .collect();
                format!("{{{}}}", inner.join(","))
            }
        }
    }
}

/// What a script invocation receives.
pub enum Invocation<'a> {
    /// The current row as a name/value bag (`row`).
    Row(&'a Schema, &'a Row),
    /// The accumulated window as an array of bags (`rows`).
    Rows(&'a Schema, &'a [Row]),
}

struct InterruptShared {
    deadline: Mutex<Option<Instant>>,
    fired: AtomicBool,
}

/// One engine instance, owned by exactly one thread.
pub struct ScriptHost {
    // Field order keeps the context alive no longer than the runtime.
    context: Context,
    _runtime: Runtime,
    interrupt: Arc<InterruptShared>,
    registered: HashSet<String>,
}

impl ScriptHost {
    fn new() -> Result<Self> {
        let runtime = Runtime::new().map_err(engine_setup_error)?;
        runtime.set_memory_limit(MEMORY_LIMIT_BYTES);

        let interrupt = Arc::new(InterruptShared {
            deadline: Mutex::new(None),
            fired: AtomicBool::new(false),
        });
        let shared = interrupt.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            let expired = shared
                .deadline
                .lock()
                .map(|dl| dl.map(|d| Instant::now() >= d).unwrap_or(false))
                .unwrap_or(false);
            if expired {
                shared.fired.store(true, Ordering::SeqCst);
            }
            expired
        })));

        let context = Context::full(&runtime).map_err(engine_setup_error)?;
        Ok(ScriptHost {
            context,
            _runtime: runtime,
            interrupt,
            registered: HashSet::new(),
        })
    }

    /// Compile `body` into a function named `name` taking `param`, once per
    /// engine. Expressions are wrapped in a `return`; bodies that already
    /// contain statements compile as-is.
    pub fn ensure_function(&mut self, name: &str, param: &str, body: &str) -> Result<()> {
        if self.registered.contains(name) {
            return Ok(());
        }
        let as_expression = format!("function {name}({param}) {{ return ( {body} ); }}");
        let as_body = format!("function {name}({param}) {{ {body} }}");
        let compiled = self.context.with(|ctx| {
            ctx.eval::<(), _>(as_expression.as_bytes())
                .or_else(|_| ctx.eval::<(), _>(as_body.as_bytes()))
        });
        compiled.map_err(|e| {
            PipeError::InvalidConfiguration(format!("script '{name}' does not compile: {e}"))
        })?;
        self.registered.insert(name.to_string());
        Ok(())
    }

    /// Invoke a compiled function under the deadline.
    pub fn call(&mut self, name: &str, row_index: usize, invocation: Invocation<'_>) -> Result<ScriptValue> {
        self.arm_deadline();
        let result = self.context.with(|ctx| -> std::result::Result<ScriptValue, rquickjs::Error> {
            let func: Function = ctx.globals().get(name)?;
            let out: JsValue = match invocation {
                Invocation::Row(schema, row) => {
                    let bag = build_bag(&ctx, schema, row)?;
                    func.call((bag,))?
                }
                Invocation::Rows(schema, rows) => {
                    let arr = Array::new(ctx.clone())?;
                    for (i, row) in rows.iter().enumerate() {
                        arr.set(i, build_bag(&ctx, schema, row)?)?;
                    }
                    func.call((arr,))?
                }
            };
            Ok(lift(&out))
        });
        self.clear_deadline();

        result.map_err(|err| {
            if self.interrupt.fired.swap(false, Ordering::SeqCst) {
                PipeError::ScriptTimeout { id: name.to_string() }
            } else {
                PipeError::Script {
                    id: name.to_string(),
                    row: row_index,
                    message: describe_js_error(&self.context, err),
                }
            }
        })
    }

    fn arm_deadline(&self) {
        if let Ok(mut dl) = self.interrupt.deadline.lock() {
            *dl = Some(Instant::now() + INVOCATION_TIMEOUT);
        }
        self.interrupt.fired.store(false, Ordering::SeqCst);
    }

    fn clear_deadline(&self) {
        if let Ok(mut dl) = self.interrupt.deadline.lock() {
            *dl = None;
        }
    }
}

fn engine_setup_error(e: rquickjs::Error) -> PipeError {
    PipeError::Other(anyhow::anyhow!("script engine setup failed: {e}"))
}

/// Pull the pending exception text if there is one.
fn describe_js_error(context: &Context, err: rquickjs::Error) -> String {
    if matches!(err, rquickjs::Error::Exception) {
        context.with(|ctx| {
            let exc = ctx.catch();
            if exc.is_undefined() {
                err.to_string()
            } else {
                exc.as_object()
                    .and_then(|o| o.get::<_, String>("message").ok())
                    .unwrap_or_else(|| lift(&exc).render())
            }
        })
    } else {
        err.to_string()
    }
}

fn build_bag<'js>(
    ctx: &rquickjs::Ctx<'js>,
    schema: &Schema,
    row: &Row,
) -> std::result::Result<Object<'js>, rquickjs::Error> {
    let bag = Object::new(ctx.clone())?;
    for (idx, column) in schema.columns().iter().enumerate() {
        let name = column.name.as_str();
        match row.get(idx) {
            Value::Null => bag.set(name, JsValue::new_null(ctx.clone()))?,
            Value::Bool(b) => bag.set(name, *b)?,
            Value::Int32(v) => bag.set(name, *v)?,
            Value::Int64(v) => bag.set(name, *v)?,
            Value::Float32(v) => bag.set(name, *v as f64)?,
            Value::Float64(v) => bag.set(name, *v)?,
            Value::String(s) => bag.set(name, s.as_str())?,
            other => bag.set(name, other.canonical_text())?,
        }
    }
    Ok(bag)
}

/// Convert a JS value into an owned [`ScriptValue`] (bounded depth).
fn lift(value: &JsValue<'_>) -> ScriptValue {
    lift_depth(value, 0)
}

fn lift_depth(value: &JsValue<'_>, depth: u8) -> ScriptValue {
    if depth > 16 {
        return ScriptValue::Undefined;
    }
    if value.is_undefined() {
        ScriptValue::Undefined
    } else if value.is_null() {
        ScriptValue::Null
    } else if let Some(b) = value.as_bool() {
        ScriptValue::Bool(b)
    } else if let Some(i) = value.as_int() {
        ScriptValue::Number(i as f64)
    } else if let Some(f) = value.as_float() {
        ScriptValue::Number(f)
    } else if let Some(s) = value.as_string() {
        ScriptValue::String(s.to_string().unwrap_or_default())
    } else if let Some(arr) = value.as_array() {
        let mut items = Vec::with_capacity(arr.len());
        for item in arr.iter::<JsValue>() {
            match item {
                Ok(v) => items.push(lift_depth(&v, depth + 1)),
                Err(_) => items.push(ScriptValue::Undefined),
            }
        }
        ScriptValue::Array(items)
    } else if let Some(obj) = value.as_object() {
        let mut props = Vec::new();
        for entry in obj.props::<String, JsValue>() {
            if let Ok((key, v)) = entry {
                props.push((key, lift_depth(&v, depth + 1)));
            }
        }
        ScriptValue::Object(props)
    } else {
        ScriptValue::Undefined
    }
}

thread_local! {
    static HOST: RefCell<Option<ScriptHost>> = RefCell::new(None);
}

/// Run `f` against this thread's engine, creating it on first use.
pub fn with_host<R>(f: impl FnOnce(&mut ScriptHost) -> Result<R>) -> Result<R> {
    HOST.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(ScriptHost::new()?);
        }
        f(slot.as_mut().expect("host just created"))
    })
}

/// Forget a script on this thread; the engine is dropped with its last
/// script, so all engines of a pipeline go away together at shutdown.
pub fn release_script(name: &str) {
    HOST.with(|slot| {
        let mut slot = slot.borrow_mut();
        let empty = match slot.as_mut() {
            Some(host) => {
                host.registered.remove(name);
                host.registered.is_empty()
            }
            None => false,
        };
        if empty {
            *slot = None;
        }
    });
}

/// A per-instance unique script id (also the wrapped function name).
pub fn fresh_script_id(tag: &str) -> String {
    format!("__rp_{tag}_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowpipe_core::row::LogicalType;
    use rowpipe_core::schema::Column;

    fn schema_v() -> Schema {
        Schema::new(vec![Column::new("v", LogicalType::Int64)]).unwrap()
    }

    #[test]
    fn expression_and_body_forms_compile() {
        let id1 = fresh_script_id("t");
        let id2 = fresh_script_id("t");
        let schema = schema_v();
        let row = Row::new(vec![Value::Int64(21)]);
        let out = with_host(|host| {
            host.ensure_function(&id1, "row", "row.v * 2")?;
            host.ensure_function(&id2, "row", "var x = row.v + 1; return x;")?;
            let a = host.call(&id1, 0, Invocation::Row(&schema, &row))?;
            let b = host.call(&id2, 0, Invocation::Row(&schema, &row))?;
            Ok((a, b))
        })
        .unwrap();
        assert_eq!(out.0, ScriptValue::Number(42.0));
        assert_eq!(out.1, ScriptValue::Number(22.0));
        release_script(&id1);
        release_script(&id2);
    }

    #[test]
    fn syntax_errors_are_configuration_errors() {
        let id = fresh_script_id("bad");
        let err = with_host(|host| host.ensure_function(&id, "row", "this is not js (")).unwrap_err();
        assert!(matches!(err, PipeError::InvalidConfiguration(_)));
    }

    #[test]
    fn runtime_errors_carry_script_id_and_row() {
        let id = fresh_script_id("boom");
        let schema = schema_v();
        let row = Row::new(vec![Value::Int64(1)]);
        let err = with_host(|host| {
            host.ensure_function(&id, "row", "row.missing.deep")?;
            host.call(&id, 7, Invocation::Row(&schema, &row))
        })
        .unwrap_err();
        match err {
            PipeError::Script { id: got, row, .. } => {
                assert_eq!(got, id);
                assert_eq!(row, 7);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        release_script(&id);
    }

    #[test]
    fn runaway_scripts_hit_the_timeout() {
        let id = fresh_script_id("spin");
        let schema = schema_v();
        let row = Row::new(vec![Value::Int64(1)]);
        let err = with_host(|host| {
            host.ensure_function(&id, "row", "while (true) {}")?;
            host.call(&id, 0, Invocation::Row(&schema, &row))
        })
        .unwrap_err();
        assert!(matches!(err, PipeError::ScriptTimeout { .. }));
        release_script(&id);
    }

    #[test]
    fn rows_invocation_sees_every_bag() {
        let id = fresh_script_id("win");
        let schema = schema_v();
        let rows = vec![
            Row::new(vec![Value::Int64(1)]),
            Row::new(vec![Value::Int64(2)]),
        ];
        let out = with_host(|host| {
            host.ensure_function(&id, "rows", "rows.map(r => ({v: r.v * 2}))")?;
            host.call(&id, 0, Invocation::Rows(&schema, &rows))
        })
        .unwrap();
        match out {
            ScriptValue::Array(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(
                    items[0],
                    ScriptValue::Object(vec![("v".to_string(), ScriptValue::Number(2.0))])
                );
            }
            other => panic!("expected array, got {other:?}"),
        }
        release_script(&id);
    }

    #[test]
    fn falsy_table() {
        for (sv, truthy) in [
            (ScriptValue::Bool(false), false),
            (ScriptValue::Number(0.0), false),
            (ScriptValue::Number(f64::NAN), false),
            (ScriptValue::String(String::new()), false),
            (ScriptValue::Null, false),
            (ScriptValue::Undefined, false),
            (ScriptValue::Bool(true), true),
            (ScriptValue::Number(0.5), true),
            (ScriptValue::String("x".into()), true),
            (ScriptValue::Array(Vec::new()), true),
        ] {
            assert_eq!(sv.is_truthy(), truthy, "case: {sv:?}");
        }
    }
}
