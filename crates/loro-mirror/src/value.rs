use enum_as_inner::EnumAsInner;
use rustc_hash::FxHashMap;
use std::collections::HashMap;

use crate::text::SyncedText;

/// A plain value assignable into a mirrored tree.
///
/// This is the JSON-compatible value model of the mirror: scalars, dense
/// lists, string-keyed maps, plus two extensions carried over from the
/// document model — raw [`Binary`](Value::Binary) blobs and
/// [`SyncedText`] rich text handles.
///
/// There is no "undefined": `Option::None` converts to [`Value::Null`], and
/// nothing unrepresentable (functions, cyclic data, sparse lists) can be
/// constructed. The one representable invalid case, a non-finite float, is
/// rejected at assignment time with the offending path.
#[derive(Debug, Clone, PartialEq, Default, EnumAsInner)]
pub enum Value {
    /// The null value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    I64(i64),
    /// A 64-bit float. Must be finite to be assignable.
    Double(f64),
    /// A string.
    Str(String),
    /// A binary blob.
    Binary(Vec<u8>),
    /// A dense list.
    List(Vec<Value>),
    /// A string-keyed map. Key order is not preserved; the underlying
    /// shared map is unordered.
    Map(FxHashMap<String, Value>),
    /// A rich text handle. See [`synced_text`](crate::synced_text).
    Text(SyncedText),
}

/// Coarse classification of a [`Value`], used by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// A JSON-safe scalar (null, bool, integer, finite float, string,
    /// binary).
    Scalar,
    /// A float that is `NaN` or infinite. Not assignable.
    NonFinite,
    /// A plain list.
    List,
    /// A plain map.
    Map,
    /// A rich text handle.
    Text,
}

impl Value {
    /// Classify this value. Only the top level is inspected; use
    /// [`Value::validate`] for a deep check.
    pub fn classify(&self) -> ValueKind {
        match self {
            Value::Double(d) if !d.is_finite() => ValueKind::NonFinite,
            Value::Null
            | Value::Bool(_)
            | Value::I64(_)
            | Value::Double(_)
            | Value::Str(_)
            | Value::Binary(_) => ValueKind::Scalar,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Text(_) => ValueKind::Text,
        }
    }

    /// Whether this is a scalar (including non-finite floats).
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Map(_) | Value::Text(_))
    }

    /// Check that the whole value is assignable into a mirrored tree,
    /// without assigning it: every float finite, every text handle still
    /// unattached. The same checks run (with full paths) on assignment;
    /// this is for hosts that want to reject input early.
    pub fn validate(&self) -> Result<(), crate::MirrorError> {
        let mut segs = Vec::new();
        self.validate_at(&mut segs)
    }

    fn validate_at(&self, segs: &mut Vec<PathSeg>) -> Result<(), crate::MirrorError> {
        match self {
            Value::Double(d) if !d.is_finite() => Err(crate::MirrorError::Validation {
                path: format_path("$", segs),
                reason: "the number is not finite".into(),
            }),
            Value::Text(t) if t.is_attached() => Err(crate::MirrorError::Reparent {
                path: format_path("$", segs),
            }),
            Value::List(xs) => {
                for (i, v) in xs.iter().enumerate() {
                    segs.push(PathSeg::Index(i));
                    v.validate_at(segs)?;
                    segs.pop();
                }
                Ok(())
            }
            Value::Map(m) => {
                for (k, v) in m {
                    segs.push(PathSeg::Key(k.clone()));
                    v.validate_at(segs)?;
                    segs.pop();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Render this value as a `serde_json::Value` for diagnostics.
    ///
    /// Text handles render as their current string content; binary renders
    /// as an array of numbers.
    pub fn to_json_value(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => (*b).into(),
            Value::I64(i) => (*i).into(),
            Value::Double(d) => (*d).into(),
            Value::Str(s) => s.clone().into(),
            Value::Binary(b) => b.iter().map(|x| (*x as u64).into()).collect::<Vec<serde_json::Value>>().into(),
            Value::List(xs) => xs.iter().map(|v| v.to_json_value()).collect::<Vec<_>>().into(),
            Value::Map(m) => serde_json::Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_value()))
                    .collect(),
            ),
            Value::Text(t) => t.to_string().into(),
        }
    }
}

/// One segment of a path into a mirrored tree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PathSeg {
    Key(String),
    Index(usize),
}

/// Render a slash-separated path (`data/xs/1`), matching the style of
/// `LoroDoc::get_by_str_path`.
pub(crate) fn format_path(root: &str, segs: &[PathSeg]) -> String {
    let mut out = String::from(root);
    for seg in segs {
        out.push('/');
        match seg {
            PathSeg::Key(k) => out.push_str(k),
            PathSeg::Index(i) => out.push_str(&i.to_string()),
        }
    }
    out
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I64(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::I64(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Binary(v.to_vec())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<FxHashMap<String, Value>> for Value {
    fn from(v: FxHashMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl<S: Into<String>> From<HashMap<S, Value>> for Value {
    fn from(v: HashMap<S, Value>) -> Self {
        Value::Map(v.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<SyncedText> for Value {
    fn from(v: SyncedText) -> Self {
        Value::Text(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::I64(i)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(xs) => Value::List(xs.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(m) => {
                Value::Map(m.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Value::List(iter.into_iter().collect())
    }
}

impl FromIterator<(String, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Value::Map(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_impls() {
        assert_eq!(Value::from(1), Value::I64(1));
        assert_eq!(Value::from("a"), Value::Str("a".into()));
        assert_eq!(Value::from(Option::<i64>::None), Value::Null);
        assert_eq!(Value::from(Some(3i64)), Value::I64(3));
        assert_eq!(
            Value::from(vec![1, 2]),
            Value::List(vec![Value::I64(1), Value::I64(2)])
        );
        assert_eq!(Value::from(vec![0u8, 1]), Value::Binary(vec![0, 1]));
    }

    #[test]
    fn from_json() {
        let v = Value::from(json!({"a": [1, 2.5, null], "b": "x"}));
        let m = v.as_map().unwrap();
        assert_eq!(
            m["a"],
            Value::List(vec![Value::I64(1), Value::Double(2.5), Value::Null])
        );
        assert_eq!(m["b"], Value::Str("x".into()));
    }

    #[test]
    fn classify_non_finite() {
        assert_eq!(Value::Double(1.0).classify(), ValueKind::Scalar);
        assert_eq!(Value::Double(f64::NAN).classify(), ValueKind::NonFinite);
        assert_eq!(
            Value::Double(f64::INFINITY).classify(),
            ValueKind::NonFinite
        );
    }

    #[test]
    fn validate_reports_the_offending_path() {
        let v = Value::from(json!({"a": [1, 2]}));
        assert!(v.validate().is_ok());

        let mut inner = rustc_hash::FxHashMap::default();
        inner.insert("bad".to_string(), Value::Double(f64::NAN));
        let v = Value::List(vec![Value::I64(0), Value::Map(inner)]);
        let err = v.validate().unwrap_err();
        let crate::MirrorError::Validation { path, .. } = err else {
            panic!("expected a validation error");
        };
        assert_eq!(path, "$/1/bad");
    }

    #[test]
    fn path_format() {
        let segs = vec![
            PathSeg::Key("xs".into()),
            PathSeg::Index(1),
            PathSeg::Key("name".into()),
        ];
        assert_eq!(format_path("data", &segs), "data/xs/1/name");
    }
}
