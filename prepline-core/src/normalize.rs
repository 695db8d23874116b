//! Numeric normalizer: converts nested values holding non-portable numeric
//! representations into portable JSON.
//!
//! Portable scalars are: integers in i64 range, finite f64, bool, string and
//! null. Integers outside the i64 range widen to f64; non-finite floats become
//! null. Shared nodes may form cycles; re-entering a node that is already on
//! the current walk path fails with [`PipelineError::CyclicStructure`].

use crate::error::PipelineError;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// A node that may be referenced from several places, including itself.
pub type SharedValue = Arc<RwLock<NativeValue>>;

/// A nested value as produced by statistics code, before normalization.
#[derive(Clone)]
pub enum NativeValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    WideInt(i128),
    WideUInt(u128),
    Float32(f32),
    Float(f64),
    Str(String),
    BoolMask(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    Seq(Vec<NativeValue>),
    Tuple(Vec<NativeValue>),
    Map(Vec<(String, NativeValue)>),
    Shared(SharedValue),
}

impl NativeValue {
    pub fn shared(value: NativeValue) -> SharedValue {
        Arc::new(RwLock::new(value))
    }
}

// Shared nodes can be cyclic, so Debug never follows them.
impl fmt::Debug for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeValue::Null => write!(f, "Null"),
            NativeValue::Bool(v) => write!(f, "Bool({v})"),
            NativeValue::Int(v) => write!(f, "Int({v})"),
            NativeValue::UInt(v) => write!(f, "UInt({v})"),
            NativeValue::WideInt(v) => write!(f, "WideInt({v})"),
            NativeValue::WideUInt(v) => write!(f, "WideUInt({v})"),
            NativeValue::Float32(v) => write!(f, "Float32({v})"),
            NativeValue::Float(v) => write!(f, "Float({v})"),
            NativeValue::Str(v) => write!(f, "Str({v:?})"),
            NativeValue::BoolMask(v) => write!(f, "BoolMask({v:?})"),
            NativeValue::IntArray(v) => write!(f, "IntArray({v:?})"),
            NativeValue::FloatArray(v) => write!(f, "FloatArray({v:?})"),
            NativeValue::Seq(v) => f.debug_tuple("Seq").field(v).finish(),
            NativeValue::Tuple(v) => f.debug_tuple("Tuple").field(v).finish(),
            NativeValue::Map(v) => f.debug_tuple("Map").field(v).finish(),
            NativeValue::Shared(node) => write!(f, "Shared({:p})", Arc::as_ptr(node)),
        }
    }
}

impl From<f64> for NativeValue {
    fn from(v: f64) -> Self {
        NativeValue::Float(v)
    }
}

impl From<i64> for NativeValue {
    fn from(v: i64) -> Self {
        NativeValue::Int(v)
    }
}

impl From<usize> for NativeValue {
    fn from(v: usize) -> Self {
        NativeValue::UInt(v as u64)
    }
}

impl From<&str> for NativeValue {
    fn from(v: &str) -> Self {
        NativeValue::Str(v.to_string())
    }
}

/// Normalize a native value into portable JSON.
pub fn normalize(value: &NativeValue) -> Result<Value, PipelineError> {
    let mut walker = Walker {
        on_path: Vec::new(),
        path: vec!["$".to_string()],
    };
    walker.walk(value)
}

struct Walker {
    on_path: Vec<*const RwLock<NativeValue>>,
    path: Vec<String>,
}

impl Walker {
    fn walk(&mut self, value: &NativeValue) -> Result<Value, PipelineError> {
        Ok(match value {
            NativeValue::Null => Value::Null,
            NativeValue::Bool(b) => Value::Bool(*b),
            NativeValue::Int(i) => Value::from(*i),
            NativeValue::UInt(u) => portable_u128(u128::from(*u)),
            NativeValue::WideInt(i) => match i64::try_from(*i) {
                Ok(v) => Value::from(v),
                Err(_) => portable_f64(*i as f64),
            },
            NativeValue::WideUInt(u) => portable_u128(*u),
            NativeValue::Float32(f) => portable_f64(f64::from(*f)),
            NativeValue::Float(f) => portable_f64(*f),
            NativeValue::Str(s) => Value::String(s.clone()),
            NativeValue::BoolMask(mask) => Value::Array(mask.iter().map(|b| Value::Bool(*b)).collect()),
            NativeValue::IntArray(items) => Value::Array(items.iter().map(|i| Value::from(*i)).collect()),
            NativeValue::FloatArray(items) => {
                Value::Array(items.iter().map(|f| portable_f64(*f)).collect())
            }
            NativeValue::Seq(items) | NativeValue::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    self.path.push(format!("[{i}]"));
                    out.push(self.walk(item)?);
                    self.path.pop();
                }
                Value::Array(out)
            }
            NativeValue::Map(entries) => {
                let mut out = Map::new();
                for (key, item) in entries {
                    self.path.push(format!(".{key}"));
                    out.insert(key.clone(), self.walk(item)?);
                    self.path.pop();
                }
                Value::Object(out)
            }
            NativeValue::Shared(node) => {
                let ptr = Arc::as_ptr(node);
                if self.on_path.contains(&ptr) {
                    return Err(PipelineError::CyclicStructure {
                        path: self.path.concat(),
                    });
                }
                self.on_path.push(ptr);
                let inner = node.read().unwrap_or_else(PoisonError::into_inner);
                let result = self.walk(&inner);
                drop(inner);
                self.on_path.pop();
                result?
            }
        })
    }
}

fn portable_f64(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn portable_u128(u: u128) -> Value {
    match i64::try_from(u) {
        Ok(v) => Value::from(v),
        Err(_) => portable_f64(u as f64),
    }
}

/// Re-normalize an existing JSON value. Idempotent.
pub fn normalize_json(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_u64() && n.as_i64().is_none() => {
            n.as_f64().map_or(Value::Null, portable_f64)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_json).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_json(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Serialize a report and normalize it into portable JSON.
pub fn to_portable<T: Serialize + ?Sized>(value: &T) -> Result<Value, PipelineError> {
    Ok(normalize_json(serde_json::to_value(value)?))
}

/// Whether every scalar in `value` is portable.
pub fn is_portable(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_i64() || (!n.is_u64() && n.as_f64().is_some_and(f64::is_finite)),
        Value::Array(items) => items.iter().all(is_portable),
        Value::Object(map) => map.values().all(is_portable),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_become_portable() {
        let value = NativeValue::Seq(vec![
            NativeValue::UInt(u64::MAX),
            NativeValue::UInt(7),
            NativeValue::WideInt(-5),
            NativeValue::WideInt(i128::MAX),
            NativeValue::Float32(1.5),
            NativeValue::Float(f64::NAN),
            NativeValue::BoolMask(vec![true, false]),
        ]);
        let out = normalize(&value).unwrap();
        assert_eq!(out[0], json!(u64::MAX as f64));
        assert_eq!(out[1], json!(7));
        assert_eq!(out[2], json!(-5));
        assert!(out[3].is_f64());
        assert_eq!(out[4], json!(1.5));
        assert_eq!(out[5], Value::Null);
        assert_eq!(out[6], json!([true, false]));
        assert!(is_portable(&out));
    }

    #[test]
    fn test_map_preserves_key_order_and_nesting() {
        let value = NativeValue::Map(vec![
            ("mean".into(), NativeValue::Float(2.0)),
            (
                "quartiles".into(),
                NativeValue::Tuple(vec![1.0.into(), 2.0.into(), 3.0.into()]),
            ),
            ("counts".into(), NativeValue::IntArray(vec![1, 2])),
        ]);
        let out = normalize(&value).unwrap();
        assert_eq!(
            out,
            json!({"mean": 2.0, "quartiles": [1.0, 2.0, 3.0], "counts": [1, 2]})
        );
    }

    #[test]
    fn test_cycle_is_detected() {
        let node = NativeValue::shared(NativeValue::Seq(Vec::new()));
        {
            let mut inner = node.write().unwrap();
            *inner = NativeValue::Map(vec![("self".into(), NativeValue::Shared(node.clone()))]);
        }
        let err = normalize(&NativeValue::Shared(node.clone())).unwrap_err();
        match err {
            PipelineError::CyclicStructure { path } => assert_eq!(path, "$.self"),
            other => panic!("expected cycle error, got {other}"),
        }
        // Break the cycle so the Arc can be freed.
        *node.write().unwrap() = NativeValue::Null;
    }

    #[test]
    fn test_shared_diamond_is_not_a_cycle() {
        let leaf = NativeValue::shared(NativeValue::Int(1));
        let value = NativeValue::Seq(vec![
            NativeValue::Shared(leaf.clone()),
            NativeValue::Shared(leaf),
        ]);
        assert_eq!(normalize(&value).unwrap(), json!([1, 1]));
    }

    #[test]
    fn test_normalize_json_is_idempotent() {
        let raw = json!({"big": u64::MAX, "small": 3, "nested": [1.5, {"x": null}]});
        let once = normalize_json(raw);
        let twice = normalize_json(once.clone());
        assert_eq!(once, twice);
        assert!(is_portable(&once));
    }

    #[test]
    fn test_to_portable_maps_nan_to_null() {
        #[derive(Serialize)]
        struct Stats {
            mean: f64,
        }
        let out = to_portable(&Stats { mean: f64::NAN }).unwrap();
        assert_eq!(out, json!({"mean": null}));
    }
}
