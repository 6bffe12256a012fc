use crate::env::Environment;
use crate::key::{Key, KeyRange};
use crate::query::{Query, Scan};
use crate::request::Request;
use crate::value::Value;

/// Store handle
///
/// Shorthand for issuing requests against one object store. Every call
/// schedules a request on the environment's thread and returns immediately.
#[derive(Debug, Clone)]
pub struct Store {
    /// Environment the requests go through
    env: Environment,
    /// Store name
    name: String,
}

impl Store {
    pub(crate) fn new(env: Environment, name: &str) -> Self {
        Store {
            env,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a value by key
    pub fn get(&self, key: impl Into<Key>) -> Request {
        self.env.get(&self.name, key)
    }

    /// Get values for several keys
    pub fn get_all(&self, keys: Vec<Key>) -> Request {
        self.env.get_all(&self.name, keys)
    }

    /// Put a record whose key is in-line or generated
    pub fn put(&self, value: Value) -> Request {
        self.env.put(&self.name, None, value)
    }

    /// Put a key/value pair
    pub fn put_at(&self, key: impl Into<Key>, value: Value) -> Request {
        self.env.put(&self.name, Some(key.into()), value)
    }

    /// Add a record whose key is in-line or generated
    pub fn add(&self, value: Value) -> Request {
        self.env.add(&self.name, None, value)
    }

    /// Add a key/value pair, failing if the key exists
    pub fn add_at(&self, key: impl Into<Key>, value: Value) -> Request {
        self.env.add(&self.name, Some(key.into()), value)
    }

    /// Delete a key/value pair
    pub fn del(&self, key: impl Into<Key>) -> Request {
        self.env.remove(&self.name, key)
    }

    /// Delete every record in `range`
    pub fn del_range(&self, range: KeyRange) -> Request {
        self.env.remove_range(&self.name, range)
    }

    /// Delete every record
    pub fn clear(&self) -> Request {
        self.env.clear(&self.name)
    }

    /// Count records in `range`
    pub fn count(&self, range: KeyRange) -> Request {
        self.env.count(&self.name, range)
    }

    pub fn keys(&self, range: KeyRange) -> Request {
        self.env.keys(&self.name, range)
    }

    pub fn values(&self, range: KeyRange) -> Request {
        self.env.values(&self.name, range)
    }

    /// Scan of this store by primary key, to build a query from
    pub fn scan(&self) -> Scan {
        Scan::new(self.name.clone())
    }

    /// Scan of one of this store's indexes
    pub fn index(&self, index: &str) -> Scan {
        Scan::index(self.name.clone(), index)
    }

    pub fn query(&self, query: Query) -> Request {
        self.env.query(query)
    }
}
