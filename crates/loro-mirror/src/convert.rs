//! Conversions between the mirror's plain [`Value`] model and [`LoroValue`].
//!
//! Composite plain values never convert wholesale into the document: the
//! applier creates empty containers and replays the planned child intents
//! inside the same commit. Only scalars cross this boundary downwards.
//! Upwards, deep document values (where child containers are already
//! resolved) convert in full.

use loro::LoroValue;
use tracing::warn;

use crate::value::Value;

/// Convert a scalar [`Value`] to a [`LoroValue`].
///
/// Returns `None` for composites and text handles; those are planned as
/// container creations, not values.
pub(crate) fn scalar_to_loro(v: &Value) -> Option<LoroValue> {
    match v {
        Value::Null => Some(LoroValue::Null),
        Value::Bool(b) => Some(LoroValue::Bool(*b)),
        Value::I64(i) => Some(LoroValue::I64(*i)),
        Value::Double(d) => Some(LoroValue::Double(*d)),
        Value::Str(s) => Some(s.clone().into()),
        Value::Binary(b) => Some(b.clone().into()),
        Value::List(_) | Value::Map(_) | Value::Text(_) => None,
    }
}

/// Convert a document value to a plain [`Value`].
///
/// The input is expected to be deep (containers resolved, text rendered as
/// strings), as produced by `get_deep_value`. A stray container marker is
/// mapped to `Null` with a warning rather than panicking.
pub(crate) fn value_from_loro(v: &LoroValue) -> Value {
    match v {
        LoroValue::Null => Value::Null,
        LoroValue::Bool(b) => Value::Bool(*b),
        LoroValue::Double(d) => Value::Double(*d),
        LoroValue::I64(i) => Value::I64(*i),
        LoroValue::Binary(b) => Value::Binary((**b).clone()),
        LoroValue::String(s) => Value::Str((**s).clone()),
        LoroValue::List(xs) => Value::List(xs.iter().map(value_from_loro).collect()),
        LoroValue::Map(m) => Value::Map(
            m.iter()
                .map(|(k, v)| (k.clone(), value_from_loro(v)))
                .collect(),
        ),
        LoroValue::Container(id) => {
            warn!(%id, "unresolved container in a deep value");
            Value::Null
        }
    }
}

/// Deep value of any container kind, with text rendered as its string
/// content. Kinds the mirror does not model still snapshot cleanly.
pub(crate) fn container_deep_value(c: &loro::Container) -> LoroValue {
    match c {
        loro::Container::Map(m) => m.get_deep_value(),
        loro::Container::List(l) => l.get_deep_value(),
        loro::Container::Text(t) => t.to_string().into(),
        loro::Container::MovableList(l) => l.get_deep_value(),
        loro::Container::Tree(t) => t.get_value(),
        _ => LoroValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::I64(-3),
            Value::Double(1.5),
            Value::Str("hi".into()),
            Value::Binary(vec![1, 2, 3]),
        ] {
            let loro = scalar_to_loro(&v).unwrap();
            assert_eq!(value_from_loro(&loro), v);
        }
    }

    #[test]
    fn composites_do_not_convert_as_scalars() {
        assert!(scalar_to_loro(&Value::List(vec![])).is_none());
        assert!(scalar_to_loro(&Value::Map(Default::default())).is_none());
    }
}
