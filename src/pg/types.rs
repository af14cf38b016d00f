//! Result/notification shapes and the value-conversion hooks handed to
//! [`super::DbConn`]. Grounded in `original_source/src/pgeff.c`'s row
//! table shape (index *and* name addressable, per-OID converters with a
//! bool fast path) and the notify struct it copies out of `PQnotifies`.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Well-known OIDs the bool fast path cares about; everything else falls
/// through to the registered converter or, failing that, the raw text.
pub const OID_BOOL: u32 = 16;
pub const OID_INT2: u32 = 21;
pub const OID_INT4: u32 = 23;
pub const OID_INT8: u32 = 20;
pub const OID_FLOAT4: u32 = 700;
pub const OID_FLOAT8: u32 = 701;

/// A decoded query parameter value. `serialize` is how [`send_query`]
/// turns it into libpq's `(Oid, *const c_char)` pair.
#[derive(Debug, Clone)]
pub enum Param {
    Null,
    Bool(bool),
    Text(String),
}

impl Param {
    pub(super) fn oid(&self) -> u32 {
        match self {
            Param::Bool(_) => OID_BOOL,
            Param::Null | Param::Text(_) => 0,
        }
    }

    pub(super) fn text(&self) -> Option<String> {
        match self {
            Param::Null => None,
            Param::Bool(b) => Some(if *b { "t".into() } else { "f".into() }),
            Param::Text(s) => Some(s.clone()),
        }
    }
}

impl From<&str> for Param {
    fn from(s: &str) -> Param {
        Param::Text(s.to_string())
    }
}

impl From<String> for Param {
    fn from(s: String) -> Param {
        Param::Text(s)
    }
}

impl From<bool> for Param {
    fn from(b: bool) -> Param {
        Param::Bool(b)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Param {
        match v {
            Some(v) => v.into(),
            None => Param::Null,
        }
    }
}

/// A decoded column value. The built-in fast paths cover bool/int/float;
/// anything else (including types a registered `OutputConverter` doesn't
/// claim) stays `Text`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Per-OID output conversion hook, checked before the built-in fast
/// paths so a caller can override e.g. numeric-as-decimal handling.
pub type OutputConverter = Arc<dyn Fn(u32, &str) -> Option<Value> + Send + Sync>;

/// Per-param input conversion hook, applied before the built-in bool
/// fast path (mirrors `pgeff`'s `input_converter`, which runs first and
/// may itself return a boolean).
pub type InputConverter = Arc<dyn Fn(&Param) -> Param + Send + Sync>;

fn builtin_convert(oid: u32, text: &str) -> Option<Value> {
    match oid {
        OID_BOOL => Some(Value::Bool(text == "t")),
        OID_INT2 | OID_INT4 | OID_INT8 => text.parse().ok().map(Value::Int),
        OID_FLOAT4 | OID_FLOAT8 => text.parse().ok().map(Value::Float),
        _ => None,
    }
}

pub(super) fn convert_value(converter: Option<&OutputConverter>, oid: u32, text: &str) -> Value {
    if let Some(f) = converter {
        if let Some(v) = f(oid, text) {
            return v;
        }
    }
    builtin_convert(oid, text).unwrap_or_else(|| Value::Text(text.to_string()))
}

/// One result row, addressable by 0-based column index or by name.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub(super) values: Vec<Option<Value>>,
    pub(super) columns: Rc<HashMap<String, usize>>,
}

impl Row {
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)?.as_ref()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let idx = *self.columns.get(name)?;
        self.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One statement's worth of results, as accumulated by
/// [`super::DbConn::get_result`] up to the next sync boundary.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub column_names: Vec<String>,
    pub column_oids: Vec<u32>,
    pub rows: Vec<Row>,
}

/// An asynchronous server notification delivered via `LISTEN`/`NOTIFY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub name: String,
    pub backend_pid: i32,
    pub payload: String,
}
