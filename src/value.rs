//! Model values stored in scope data and produced by watch getters.
//!
//! Containers are immutable and shared through `Arc`, which gives every list
//! and map a stable identity: replacing a collection changes its identity,
//! rebuilding an equal one does not make it identical.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A dynamically typed model value.
///
/// `PartialEq` is structural equality (see [`Value::deep_eq`]). Change
/// detection by reference uses [`Value::identical`] instead.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// Absent value. Reads of missing keys produce this.
    #[default]
    Undefined,
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Double precision number, `NaN` included.
    Number(f64),
    /// Immutable string.
    String(Arc<str>),
    /// Immutable list with pointer identity.
    List(Arc<Vec<Value>>),
    /// Immutable string-keyed map with pointer identity.
    Map(Arc<BTreeMap<String, Value>>),
}

impl Value {
    /// Build a list value.
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::List(Arc::new(items.into_iter().map(Into::into).collect()))
    }

    /// Build a map value.
    pub fn map<I, K, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<Value>,
    {
        Value::Map(Arc::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    /// Returns true unless this is [`Value::Undefined`].
    pub fn is_defined(&self) -> bool {
        !matches!(self, Value::Undefined)
    }

    /// Returns true for [`Value::Undefined`].
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Returns true for a `NaN` number.
    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Number(n) if n.is_nan())
    }

    /// Returns true for lists and maps.
    pub fn is_collection(&self) -> bool {
        matches!(self, Value::List(_) | Value::Map(_))
    }

    /// Defined, and for containers every direct element is defined too.
    pub fn is_all_defined(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::List(items) => items.iter().all(Value::is_defined),
            Value::Map(entries) => entries.values().all(Value::is_defined),
            _ => true,
        }
    }

    /// Numeric view of this value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer view of a number without a fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    /// Boolean view of this value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String view of this value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// List view of this value.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Map view of this value.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Field of a map value, `Undefined` for anything else.
    pub fn field(&self, name: &str) -> Value {
        match self {
            Value::Map(entries) => entries.get(name).cloned().unwrap_or_default(),
            _ => Value::Undefined,
        }
    }

    /// Reference comparison used by default watches.
    ///
    /// Scalars compare by value with `NaN` identical to itself, strings by
    /// content, containers by pointer.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Structural comparison used by deep watches. `NaN` equals `NaN`.
    pub fn deep_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.deep_eq(y)))
            }
            (Value::Map(a), Value::Map(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.len() == b.len()
                        && a.iter()
                            .zip(b.iter())
                            .all(|((ka, va), (kb, vb))| ka == kb && va.deep_eq(vb)))
            }
            _ => self.identical(other),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.deep_eq(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{:?}:{}", key, item)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(Arc::new(entries))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_is_identical_to_itself() {
        let nan = Value::from(f64::NAN);
        assert!(nan.identical(&Value::from(f64::NAN)));
        assert!(nan.deep_eq(&Value::from(f64::NAN)));
        assert!(!nan.identical(&Value::from(0.0)));
    }

    #[test]
    fn test_containers_compare_by_pointer_for_identity() {
        let a = Value::list([1, 2, 3]);
        let b = Value::list([1, 2, 3]);
        assert!(!a.identical(&b));
        assert!(a.identical(&a.clone()));
        assert!(a.deep_eq(&b));
    }

    #[test]
    fn test_deep_eq_nested() {
        let a = Value::map([("x", Value::list([1, 2])), ("y", Value::from("s"))]);
        let b = Value::map([("x", Value::list([1, 2])), ("y", Value::from("s"))]);
        let c = Value::map([("x", Value::list([1, 3])), ("y", Value::from("s"))]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_all_defined() {
        assert!(Value::list([1, 2]).is_all_defined());
        assert!(!Value::list([Value::from(1), Value::Undefined]).is_all_defined());
        assert!(!Value::Undefined.is_all_defined());
        assert!(Value::Null.is_all_defined());
    }

    #[test]
    fn test_display() {
        let v = Value::map([("a", Value::list([Value::from(1), Value::Null]))]);
        assert_eq!(v.to_string(), r#"{"a":[1,null]}"#);
    }
}
