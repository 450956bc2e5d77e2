//! Core types: keys, key paths and key ranges.

use crate::error::{DataDbError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Bound, RangeBounds};

/// A stored record. Records are schemaless JSON documents.
pub type Record = Value;

/// Largest key the key generator will hand out (2^53).
pub const MAX_GENERATED_KEY: u64 = 1 << 53;

/// A primary or index key.
///
/// Keys of different kinds order as `Number < String < Array`; arrays compare
/// element by element. `-0.0` and `0.0` are the same key; NaN is rejected on
/// deserialization and by every store operation.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "KeyRepr")]
pub enum Key {
    Number(f64),
    String(String),
    Array(Vec<Key>),
}

#[derive(Deserialize)]
enum KeyRepr {
    Number(f64),
    String(String),
    Array(Vec<Key>),
}

impl TryFrom<KeyRepr> for Key {
    type Error = DataDbError;

    fn try_from(repr: KeyRepr) -> Result<Self> {
        match repr {
            KeyRepr::Number(n) => Key::number(n),
            KeyRepr::String(s) => Ok(Key::String(s)),
            KeyRepr::Array(items) => Ok(Key::Array(items)),
        }
    }
}

impl Key {
    /// Build a numeric key. NaN is not a valid key.
    pub fn number(n: f64) -> Result<Self> {
        if n.is_nan() {
            return Err(DataDbError::Data("NaN is not a valid key".into()));
        }
        // -0.0 and 0.0 are the same key
        Ok(Key::Number(if n == 0.0 { 0.0 } else { n }))
    }

    /// Convert a JSON value into a key, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().and_then(|f| Key::number(f).ok()),
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    /// Convert back into a JSON value. Integral numbers stay integers.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => match integral(*n) {
                Some(i) => Value::from(i),
                None => Value::from(*n),
            },
            Key::String(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    /// Check that the key, and every element of an array key, is usable.
    pub fn validate(&self) -> Result<()> {
        match self {
            Key::Number(n) if n.is_nan() => {
                Err(DataDbError::Data("NaN is not a valid key".into()))
            }
            Key::Array(items) => items.iter().try_for_each(Key::validate),
            _ => Ok(()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Array(_) => 2,
        }
    }
}

fn integral(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n.abs() <= MAX_GENERATED_KEY as f64 {
        Some(n as i64)
    } else {
        None
    }
}

fn canonical(n: f64) -> f64 {
    if n == 0.0 {
        0.0
    } else {
        n
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => canonical(*a).total_cmp(&canonical(*b)),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => match integral(*n) {
                Some(i) => write!(f, "{}", i),
                None => write!(f, "{}", n),
            },
            Key::String(s) => write!(f, "{:?}", s),
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

impl TryFrom<&Value> for Key {
    type Error = DataDbError;

    fn try_from(value: &Value) -> Result<Self> {
        Key::from_value(value).ok_or_else(|| DataDbError::Data(format!("{} is not a valid key", value)))
    }
}

/// Where a key lives inside a record.
///
/// A single path is a dotted field path (`"meta.id"`); a compound path yields
/// an array key built from each field in turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    Single(String),
    Compound(Vec<String>),
}

impl KeyPath {
    pub fn single(path: impl Into<String>) -> Self {
        KeyPath::Single(path.into())
    }

    pub fn compound<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPath::Compound(paths.into_iter().map(Into::into).collect())
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, KeyPath::Compound(_))
    }

    /// Every segment of every path must be non-empty.
    pub fn is_valid(&self) -> bool {
        fn valid(path: &str) -> bool {
            !path.is_empty() && path.split('.').all(|seg| !seg.is_empty())
        }
        match self {
            KeyPath::Single(p) => valid(p),
            KeyPath::Compound(ps) => !ps.is_empty() && ps.iter().all(|p| valid(p)),
        }
    }

    /// Extract the key this path points at, if it resolves to a valid key.
    pub fn evaluate(&self, record: &Value) -> Option<Key> {
        match self {
            KeyPath::Single(path) => resolve(record, path).and_then(Key::from_value),
            KeyPath::Compound(paths) => paths
                .iter()
                .map(|p| resolve(record, p).and_then(Key::from_value))
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
        }
    }

    /// Write `key` into `record` at this path, creating intermediate objects.
    pub(crate) fn inject(&self, record: &mut Value, key: &Key) -> Result<()> {
        let path = match self {
            KeyPath::Single(path) => path,
            KeyPath::Compound(_) => {
                return Err(DataDbError::Data(
                    "cannot inject a key through a compound key path".into(),
                ))
            }
        };

        let mut segments = path.split('.').peekable();
        let mut current = record;
        while let Some(segment) = segments.next() {
            let object = current.as_object_mut().ok_or_else(|| {
                DataDbError::Data(format!("cannot inject key at {}: not an object", path))
            })?;
            if segments.peek().is_none() {
                object.insert(segment.to_string(), key.to_value());
                return Ok(());
            }
            current = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        Ok(())
    }
}

pub(crate) fn resolve<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |value, segment| value.as_object()?.get(segment))
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPath::Single(p) => write!(f, "{}", p),
            KeyPath::Compound(ps) => write!(f, "[{}]", ps.join(", ")),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

/// A contiguous range of keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<Key>,
    upper: Bound<Key>,
}

impl KeyRange {
    /// Exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    /// Every key above `lower` (exclusive when `open`).
    pub fn lower_bound(lower: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: bound(lower.into(), open),
            upper: Bound::Unbounded,
        }
    }

    /// Every key below `upper` (exclusive when `open`).
    pub fn upper_bound(upper: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: bound(upper.into(), open),
        }
    }

    /// Keys between `lower` and `upper`.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Result<Self> {
        let (lower, upper) = (lower.into(), upper.into());
        match lower.cmp(&upper) {
            Ordering::Greater => Err(DataDbError::Data(format!(
                "lower bound {} is above upper bound {}",
                lower, upper
            ))),
            Ordering::Equal if lower_open || upper_open => Err(DataDbError::Data(format!(
                "empty range at {} with an open bound",
                lower
            ))),
            _ => Ok(Self {
                lower: bound(lower, lower_open),
                upper: bound(upper, upper_open),
            }),
        }
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        RangeBounds::contains(self, key)
    }

    pub(crate) fn as_bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        (self.lower.as_ref(), self.upper.as_ref())
    }
}

fn bound(key: Key, open: bool) -> Bound<Key> {
    if open {
        Bound::Excluded(key)
    } else {
        Bound::Included(key)
    }
}

impl RangeBounds<Key> for KeyRange {
    fn start_bound(&self) -> Bound<&Key> {
        self.lower.as_ref()
    }

    fn end_bound(&self) -> Bound<&Key> {
        self.upper.as_ref()
    }
}
