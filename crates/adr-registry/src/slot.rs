//! A single typed registry slot and the kind coercion applied on write.

use adr_types::{AdrError, PvKind, PvName, Value};
use chrono::{DateTime, Utc};

/// Storage for one variable.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) value: Value,
    pub(crate) writes: u64,
    pub(crate) updated_at: Option<DateTime<Utc>>,
}

impl Slot {
    pub(crate) fn new(name: PvName) -> Self {
        Self {
            value: name.initial_value(),
            writes: 0,
            updated_at: None,
        }
    }

    /// Store `value`, returning what was there before.
    pub(crate) fn store(&mut self, value: Value) -> Value {
        self.writes += 1;
        self.updated_at = Some(Utc::now());
        std::mem::replace(&mut self.value, value)
    }
}

/// Convert `value` to the storage kind of `name`.
///
/// Integers widen into real slots and integral reals narrow into integer
/// slots; everything else is a [`AdrError::TypeMismatch`].
pub(crate) fn coerce(name: PvName, value: Value) -> Result<Value, AdrError> {
    let expected = name.kind();
    let coerced = match (expected, &value) {
        (PvKind::Float, Value::Float(_)) | (PvKind::Int, Value::Int(_)) | (PvKind::Text, Value::Text(_)) => {
            Some(value.clone())
        }
        (PvKind::Float, Value::Int(i)) => Some(Value::Float(*i as f64)),
        (PvKind::Int, Value::Float(_)) => value.as_i64().map(Value::Int),
        _ => None,
    };
    coerced.ok_or_else(|| AdrError::TypeMismatch {
        name: name.to_string(),
        expected,
        found: format!("{} {value}", value.kind()),
    })
}
