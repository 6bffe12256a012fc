use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::iter;
use std::ops::Bound;

use crate::backend::CursorDesc;
use crate::error::{Error, Result};
use crate::key::{Key, KeyRange};
use crate::value::Value;

/// Index definition
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSchema {
    pub name: String,
    pub key_path: String,
    pub unique: bool,
    /// Index every element of an array value separately
    pub multi_entry: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        IndexSchema {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    /// Index keys `value` contributes; empty when the path is missing.
    fn keys_of(&self, value: &Value) -> Vec<Key> {
        match (self.multi_entry, value.get_path(&self.key_path)) {
            (true, Some(Value::Array(items))) => {
                let keys: BTreeSet<Key> = items.iter().filter_map(Value::to_key).collect();
                keys.into_iter().collect()
            }
            (_, Some(v)) => v.to_key().into_iter().collect(),
            (_, None) => Vec::new(),
        }
    }
}

/// Object store definition
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSchema {
    pub name: String,
    /// In-line key path; out-of-line keys when `None`
    pub key_path: Option<String>,
    pub auto_increment: bool,
    pub indexes: Vec<IndexSchema>,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>) -> Self {
        StoreSchema {
            name: name.into(),
            key_path: None,
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    pub fn key_path(mut self, path: impl Into<String>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }
}

#[derive(Debug)]
struct IndexData {
    schema: IndexSchema,
    /// Index key to the primary keys filed under it
    entries: BTreeMap<Key, BTreeSet<Key>>,
}

/// Where a seek starts, along the iteration direction.
#[derive(Debug, Clone)]
pub(crate) enum Seek {
    Start,
    /// First effective key at or past `key`
    Key { key: Key, inclusive: bool },
    /// First (effective key, primary key) pair at or past the given pair
    Entry {
        key: Key,
        primary_key: Key,
        inclusive: bool,
    },
}

/// (effective key, primary key) pairs in iteration order
pub(crate) type Entries<'a> = Box<dyn Iterator<Item = (Key, Key)> + 'a>;

/// A change to undo when a transaction rolls back
#[derive(Debug, Clone)]
pub(crate) enum Undo {
    Record {
        store: String,
        key: Key,
        previous: Option<Value>,
    },
    Generator {
        store: String,
        previous: i64,
    },
}

impl Undo {
    fn store(&self) -> &str {
        match self {
            Undo::Record { store, .. } | Undo::Generator { store, .. } => store,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StoreData {
    schema: StoreSchema,
    records: BTreeMap<Key, Value>,
    indexes: BTreeMap<String, IndexData>,
    /// Next generated key
    next_key: i64,
}

impl StoreData {
    pub fn new(schema: StoreSchema) -> Result<Self> {
        let mut indexes = BTreeMap::new();
        for index in &schema.indexes {
            if index.name.is_empty() || index.key_path.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "index on {} needs a name and a key path",
                    schema.name
                )));
            }
            let data = IndexData {
                schema: index.clone(),
                entries: BTreeMap::new(),
            };
            if indexes.insert(index.name.clone(), data).is_some() {
                return Err(Error::Constraint(format!(
                    "index {} defined twice on {}",
                    index.name, schema.name
                )));
            }
        }
        Ok(StoreData {
            schema,
            records: BTreeMap::new(),
            indexes,
            next_key: 1,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.records.get(key)
    }

    fn index(&self, name: &str) -> Result<&IndexData> {
        self.indexes.get(name).ok_or_else(|| {
            Error::NotFound(format!("index {} on {}", name, self.schema.name))
        })
    }

    /// Work out the primary key of a record being written, generating one
    /// when the store auto-increments.
    fn resolve_key(
        &mut self,
        key: Option<Key>,
        value: &mut Value,
        undo: &mut Vec<Undo>,
    ) -> Result<Key> {
        let key = match (self.schema.key_path.clone(), key) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidArgument(format!(
                    "{} uses in-line keys, an explicit key is not allowed",
                    self.schema.name
                )))
            }
            (Some(path), None) => match value.key_at(&path) {
                Some(key) => key,
                None if self.schema.auto_increment => {
                    let key = self.generate(undo);
                    if !value.set_field(&path, Value::from(&key)) {
                        return Err(Error::InvalidArgument(format!(
                            "cannot store generated key at {} in {}",
                            path, self.schema.name
                        )));
                    }
                    key
                }
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "record has no key at {}",
                        path
                    )))
                }
            },
            (None, Some(key)) => key,
            (None, None) if self.schema.auto_increment => self.generate(undo),
            (None, None) => {
                return Err(Error::InvalidArgument(format!(
                    "{} needs an explicit key",
                    self.schema.name
                )))
            }
        };
        key.validate()?;
        if let Some(n) = key.as_number() {
            if self.schema.auto_increment && n >= self.next_key as f64 {
                undo.push(Undo::Generator {
                    store: self.schema.name.clone(),
                    previous: self.next_key,
                });
                self.next_key = n.floor() as i64 + 1;
            }
        }
        Ok(key)
    }

    fn generate(&mut self, undo: &mut Vec<Undo>) -> Key {
        undo.push(Undo::Generator {
            store: self.schema.name.clone(),
            previous: self.next_key,
        });
        let key = Key::Number(self.next_key as f64);
        self.next_key += 1;
        key
    }

    fn check_unique(&self, key: &Key, value: &Value) -> Result<()> {
        for index in self.indexes.values().filter(|i| i.schema.unique) {
            for ikey in index.schema.keys_of(value) {
                let clash = index
                    .entries
                    .get(&ikey)
                    .map_or(false, |pks| pks.iter().any(|pk| pk != key));
                if clash {
                    return Err(Error::Constraint(format!(
                        "{} already contains {} in unique index {}",
                        self.schema.name, ikey, index.schema.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Insert a record; fails when the key exists and `overwrite` is false.
    pub fn insert(
        &mut self,
        key: Option<Key>,
        mut value: Value,
        overwrite: bool,
        undo: &mut Vec<Undo>,
    ) -> Result<Key> {
        let mut changes = Vec::new();
        let key = match self.resolve_key(key, &mut value, &mut changes) {
            Ok(key) => key,
            Err(e) => {
                self.rollback(changes);
                return Err(e);
            }
        };
        if !overwrite && self.records.contains_key(&key) {
            self.rollback(changes);
            return Err(Error::Constraint(format!(
                "{} already contains key {}",
                self.schema.name, key
            )));
        }
        if let Err(e) = self.check_unique(&key, &value) {
            self.rollback(changes);
            return Err(e);
        }
        let previous = self.write(&key, Some(value));
        undo.extend(changes);
        undo.push(Undo::Record {
            store: self.schema.name.clone(),
            key: key.clone(),
            previous,
        });
        Ok(key)
    }

    pub fn remove(&mut self, key: &Key, undo: &mut Vec<Undo>) {
        if let Some(previous) = self.write(key, None) {
            undo.push(Undo::Record {
                store: self.schema.name.clone(),
                key: key.clone(),
                previous: Some(previous),
            });
        }
    }

    pub fn remove_range(&mut self, range: &KeyRange, undo: &mut Vec<Undo>) -> usize {
        let keys: Vec<Key> = self
            .records
            .keys()
            .filter(|k| range.contains(k))
            .cloned()
            .collect();
        for key in &keys {
            self.remove(key, undo);
        }
        keys.len()
    }

    pub fn clear(&mut self, undo: &mut Vec<Undo>) {
        self.remove_range(&KeyRange::all(), undo);
    }

    /// Replace or delete a record, keeping every index in step. Returns the
    /// previous value.
    pub fn write(&mut self, key: &Key, value: Option<Value>) -> Option<Value> {
        let previous = match value {
            Some(value) => {
                for index in self.indexes.values_mut() {
                    for ikey in index.schema.keys_of(&value) {
                        index.entries.entry(ikey).or_default().insert(key.clone());
                    }
                }
                self.records.insert(key.clone(), value)
            }
            None => self.records.remove(key),
        };
        if let Some(old) = &previous {
            let current = self.records.get(key);
            for index in self.indexes.values_mut() {
                let keep = current.map(|v| index.schema.keys_of(v)).unwrap_or_default();
                for ikey in index.schema.keys_of(old) {
                    if keep.contains(&ikey) {
                        continue;
                    }
                    if let Some(pks) = index.entries.get_mut(&ikey) {
                        pks.remove(key);
                        if pks.is_empty() {
                            index.entries.remove(&ikey);
                        }
                    }
                }
            }
        }
        previous
    }

    fn revert_one(&mut self, change: Undo) {
        match change {
            Undo::Record { key, previous, .. } => {
                self.write(&key, previous);
            }
            Undo::Generator { previous, .. } => self.next_key = previous,
        }
    }

    /// Undo changes made to this store, newest first.
    pub fn rollback(&mut self, changes: Vec<Undo>) {
        for change in changes.into_iter().rev() {
            self.revert_one(change);
        }
    }

    /// Insert every entry or none of them.
    pub fn insert_all(
        &mut self,
        entries: Vec<(Option<Key>, Value)>,
        overwrite: bool,
        undo: &mut Vec<Undo>,
    ) -> Result<Vec<Key>> {
        let mut batch = Vec::new();
        let mut keys = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match self.insert(key, value, overwrite, &mut batch) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    self.rollback(batch);
                    return Err(e);
                }
            }
        }
        undo.extend(batch);
        Ok(keys)
    }

    /// Entries a cursor over `desc` visits, starting at `from`. Only the
    /// part of the store or index past the seek point is walked.
    pub fn seek(&self, desc: &CursorDesc, from: Seek) -> Result<Entries<'_>> {
        let reverse = desc.is_reverse();
        let index = match &desc.index {
            Some(name) => Some(self.index(name)?),
            None => None,
        };
        let (start, head) = match from {
            Seek::Start => (None, None),
            Seek::Key { key, inclusive } => (Some((key, inclusive)), None),
            Seek::Entry {
                key,
                primary_key,
                inclusive,
            } if index.is_some() => (Some((key.clone(), false)), Some((key, primary_key, inclusive))),
            Seek::Entry { key, inclusive, .. } => (Some((key, inclusive)), None),
        };

        let mut lower = desc.range.lower.as_ref();
        let mut upper = desc.range.upper.as_ref();
        if let Some((key, inclusive)) = &start {
            let at = if *inclusive {
                Bound::Included(key)
            } else {
                Bound::Excluded(key)
            };
            if reverse {
                upper = tighter(upper, at, Ordering::Less);
            } else {
                lower = tighter(lower, at, Ordering::Greater);
            }
        }

        let tail: Entries<'_> = if is_empty(lower, upper) {
            Box::new(iter::empty())
        } else {
            match index {
                Some(index) => {
                    let runs = index.entries.range::<Key, _>((lower, upper));
                    if reverse {
                        Box::new(runs.rev().flat_map(|(k, pks)| {
                            pks.iter().rev().map(move |pk| (k.clone(), pk.clone()))
                        }))
                    } else {
                        Box::new(runs.flat_map(|(k, pks)| {
                            pks.iter().map(move |pk| (k.clone(), pk.clone()))
                        }))
                    }
                }
                None => {
                    let keys = self
                        .records
                        .range::<Key, _>((lower, upper))
                        .map(|(k, _)| (k.clone(), k.clone()));
                    if reverse {
                        Box::new(keys.rev())
                    } else {
                        Box::new(keys)
                    }
                }
            }
        };

        // rest of the run at the seek key, before the later index keys
        let run = match (index, head) {
            (Some(index), Some((key, pk, inclusive))) if desc.range.contains(&key) => {
                index.entries.get(&key).map(|pks| (key, pk, inclusive, pks))
            }
            _ => None,
        };
        let entries: Entries<'_> = match run {
            Some((key, pk, inclusive, pks)) => {
                let at = if inclusive {
                    Bound::Included(&pk)
                } else {
                    Bound::Excluded(&pk)
                };
                let rest: Box<dyn Iterator<Item = &Key> + '_> = if reverse {
                    Box::new(pks.range::<Key, _>((Bound::Unbounded, at)).rev())
                } else {
                    Box::new(pks.range::<Key, _>((at, Bound::Unbounded)))
                };
                Box::new(rest.map(move |pk| (key.clone(), pk.clone())).chain(tail))
            }
            None => tail,
        };
        Ok(entries)
    }

    /// Primary keys and values in `range`, through `index` when given.
    pub fn scan(
        &self,
        index: Option<&str>,
        range: &KeyRange,
        reverse: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(Key, &Value)>> {
        let mut desc = CursorDesc::new(self.schema.name.clone());
        desc.index = index.map(str::to_string);
        desc.range = range.clone();
        if reverse {
            desc.flags |= crate::constants::CursorFlags::REVERSE;
        }
        let rows = self
            .seek(&desc, Seek::Start)?
            .filter_map(|(_, pk)| self.records.get(&pk).map(|v| (pk, v)))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(rows)
    }
}

/// The narrower of two bounds on the same side. `keep` is the ordering a
/// key in `b` must have against `a` for `b` to win.
fn tighter<'a>(a: Bound<&'a Key>, b: Bound<&'a Key>, keep: Ordering) -> Bound<&'a Key> {
    let (x, y) = match (a, b) {
        (Bound::Unbounded, _) => return b,
        (_, Bound::Unbounded) => return a,
        (Bound::Included(x) | Bound::Excluded(x), Bound::Included(y) | Bound::Excluded(y)) => {
            (x, y)
        }
    };
    match y.cmp(x) {
        Ordering::Equal if matches!(a, Bound::Excluded(_)) => a,
        Ordering::Equal => b,
        ord if ord == keep => b,
        _ => a,
    }
}

/// True when no key fits between the bounds.
fn is_empty(lower: Bound<&Key>, upper: Bound<&Key>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

/// Replay `undo` backwards over `stores`.
pub(crate) fn apply_undo(stores: &mut BTreeMap<String, StoreData>, undo: Vec<Undo>) {
    for change in undo.into_iter().rev() {
        let name = change.store().to_string();
        if let Some(data) = stores.get_mut(&name) {
            data.revert_one(change);
        }
    }
}

/// Compare two entries along the iteration direction.
pub(crate) fn cmp_dir<T: Ord>(a: &T, b: &T, reverse: bool) -> Ordering {
    if reverse {
        b.cmp(a)
    } else {
        a.cmp(b)
    }
}
