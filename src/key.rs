use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use crate::error::{Error, Result};

/// A store or index key
#[derive(Debug, Clone)]
pub enum Key {
    Number(f64),
    /// Milliseconds since the Unix epoch
    Date(i64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Key>),
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Date(_) => 1,
            Key::String(_) => 2,
            Key::Binary(_) => 3,
            Key::Array(_) => 4,
        }
    }

    /// Validate that the key is usable; NaN is rejected.
    pub fn validate(&self) -> Result<()> {
        match self {
            Key::Number(n) if n.is_nan() => {
                Err(Error::InvalidArgument("NaN is not a valid key".into()))
            }
            Key::Array(items) => items.iter().try_for_each(Key::validate),
            _ => Ok(()),
        }
    }

    /// Returns the number if this is a numeric key.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns whichever key is further along the iteration direction.
    pub fn max_by_direction(a: &Key, b: &Key, reverse: bool) -> Key {
        let a_ahead = if reverse { a < b } else { a > b };
        if a_ahead {
            a.clone()
        } else {
            b.clone()
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Key) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Key) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => zero_sign(*a).total_cmp(&zero_sign(*b)),
            (Key::Date(a), Key::Date(b)) => a.cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{}", n),
            Key::Date(ms) => write!(f, "@{}", ms),
            Key::String(s) => write!(f, "{:?}", s),
            Key::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Key {
        Key::Number(n)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Key {
        Key::Number(n as f64)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Key {
        Key::Number(n as f64)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Key {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Key {
        Key::String(s)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Key {
        Key::Array(items)
    }
}

/// Range bounds for cursor iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    /// Lower bound.
    pub lower: Bound<Key>,
    /// Upper bound.
    pub upper: Bound<Key>,
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

impl KeyRange {
    /// Creates a range covering all keys.
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Creates a range matching exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    /// Creates a range starting from a key.
    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: bound(key.into(), open),
            upper: Bound::Unbounded,
        }
    }

    /// Creates a range ending at a key.
    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: bound(key.into(), open),
        }
    }

    /// Creates a range between two keys.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Result<Self> {
        let lower = lower.into();
        let upper = upper.into();
        match lower.cmp(&upper) {
            Ordering::Greater => {
                return Err(Error::InvalidArgument(format!(
                    "lower bound {} is above upper bound {}",
                    lower, upper
                )))
            }
            Ordering::Equal if lower_open || upper_open => {
                return Err(Error::InvalidArgument(format!(
                    "empty open range at {}",
                    lower
                )))
            }
            _ => {}
        }
        Ok(Self {
            lower: bound(lower, lower_open),
            upper: bound(upper, upper_open),
        })
    }

    /// Creates a range of every string key starting with `prefix`.
    pub fn starts_with(prefix: &str) -> Self {
        let mut end = prefix.to_string();
        end.push(char::MAX);
        Self {
            lower: Bound::Included(Key::from(prefix)),
            upper: Bound::Included(Key::String(end)),
        }
    }

    /// Returns true if the key lies before the lower bound.
    pub fn is_below(&self, key: &Key) -> bool {
        match &self.lower {
            Bound::Included(l) => key < l,
            Bound::Excluded(l) => key <= l,
            Bound::Unbounded => false,
        }
    }

    /// Returns true if the key lies past the upper bound.
    pub fn is_above(&self, key: &Key) -> bool {
        match &self.upper {
            Bound::Included(u) => key > u,
            Bound::Excluded(u) => key >= u,
            Bound::Unbounded => false,
        }
    }

    /// Returns true if the key is within the range.
    pub fn contains(&self, key: &Key) -> bool {
        !self.is_below(key) && !self.is_above(key)
    }
}

/// -0.0 and 0.0 are the same key.
fn zero_sign(n: f64) -> f64 {
    if n == 0.0 {
        0.0
    } else {
        n
    }
}

fn bound(key: Key, open: bool) -> Bound<Key> {
    if open {
        Bound::Excluded(key)
    } else {
        Bound::Included(key)
    }
}
