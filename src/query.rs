use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use log::{debug, trace};

use crate::backend::{CursorDesc, CursorProvider, Output, TxHandle};
use crate::constants::CursorFlags;
use crate::cursor::AbstractCursor;
use crate::error::{Error, Result};
use crate::join::{JoinCursor, JoinPosition, MergeStrategy};
use crate::key::{Key, KeyRange};
use crate::request::Request;
use crate::value::Value;

/// What a query resolves with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// Primary keys of the matching records
    #[default]
    Keys,
    /// Values seen by the first scan
    Values,
    /// Number of matches
    Count,
}

/// One cursor taking part in a query
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    desc: CursorDesc,
}

impl Scan {
    /// Scan every record of `store` by primary key.
    pub fn new(store: impl Into<String>) -> Self {
        Scan {
            desc: CursorDesc::new(store),
        }
    }

    /// Scan `store` through one of its indexes.
    pub fn index(store: impl Into<String>, index: impl Into<String>) -> Self {
        let mut scan = Scan::new(store);
        scan.desc.index = Some(index.into());
        scan
    }

    /// Restrict the scan to one key.
    pub fn where_eq(mut self, key: impl Into<Key>) -> Self {
        self.desc.range = KeyRange::only(key);
        self
    }

    pub fn where_range(mut self, range: KeyRange) -> Self {
        self.desc.range = range;
        self
    }

    pub fn reverse(mut self) -> Self {
        self.desc.flags |= CursorFlags::REVERSE;
        self
    }

    pub fn unique(mut self) -> Self {
        self.desc.flags |= CursorFlags::UNIQUE;
        self
    }

    pub fn key_only(mut self) -> Self {
        self.desc.flags |= CursorFlags::KEY_ONLY;
        self
    }

    pub fn desc(&self) -> &CursorDesc {
        &self.desc
    }

    pub fn store(&self) -> &str {
        &self.desc.store
    }
}

/// A read-only query over one or more joined scans
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    scans: Vec<Scan>,
    strategy: MergeStrategy,
    offset: usize,
    limit: Option<usize>,
    projection: Projection,
}

impl Query {
    pub fn new(scan: Scan) -> Self {
        Query {
            scans: vec![scan],
            strategy: MergeStrategy::PrimaryKey,
            offset: 0,
            limit: None,
            projection: Projection::default(),
        }
    }

    /// Add a scan joined on primary key with the others.
    pub fn join(mut self, scan: Scan) -> Self {
        self.scans.push(scan);
        self
    }

    pub fn strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Skip the first `n` matches.
    pub fn offset(mut self, n: usize) -> Self {
        self.offset = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn scans(&self) -> &[Scan] {
        &self.scans
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    /// Stores the query reads, sorted and without duplicates.
    pub fn scope(&self) -> Vec<String> {
        let stores: BTreeSet<&str> = self.scans.iter().map(Scan::store).collect();
        stores.into_iter().map(str::to_string).collect()
    }

    /// Check the query before it is scheduled.
    pub fn validate(&self) -> Result<()> {
        if self.limit == Some(0) {
            return Err(Error::InvalidArgument("limit must be positive".into()));
        }
        if let Some(scan) = self.scans.iter().find(|s| s.store().is_empty()) {
            return Err(Error::InvalidArgument(format!("scan {:?} has no store", scan.desc)));
        }
        if self.projection == Projection::Values && self.scans[0].desc.is_key_only() {
            return Err(Error::InvalidArgument(
                "values requested from a key-only scan".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Collected {
    skipped: usize,
    keys: Vec<Key>,
    values: Vec<Value>,
    count: usize,
}

/// Drives one query inside an open transaction and settles `req`.
struct QueryRun {
    query: Query,
    req: Request,
    label: String,
    collected: RefCell<Collected>,
    /// Released once the run settles
    join: RefCell<Option<JoinCursor>>,
}

impl QueryRun {
    fn on_next(&self, position: Option<&JoinPosition>) {
        let Some(position) = position else {
            return self.finish(None);
        };
        let full = {
            let mut c = self.collected.borrow_mut();
            if c.skipped < self.query.offset {
                c.skipped += 1;
            } else {
                c.count += 1;
                match self.query.projection {
                    Projection::Keys => c.keys.push(position.primary_key.clone()),
                    Projection::Values => {
                        if let Some(value) = position.members.first().and_then(|m| m.value.clone()) {
                            c.values.push(value);
                        }
                    }
                    Projection::Count => {}
                }
            }
            self.query.limit.map_or(false, |limit| c.count >= limit)
        };
        if full {
            trace!("{} reached its limit", self.label);
            return self.finish(None);
        }
        let join = self.join.borrow().clone();
        if let Some(join) = join {
            if let Err(e) = join.continue_() {
                self.finish(Some(e));
            }
        }
    }

    fn finish(&self, err: Option<Error>) {
        let join = self.join.borrow_mut().take();
        if let Some(join) = join {
            join.exit();
        }
        if !self.req.is_pending() {
            return;
        }
        let outcome = match err {
            Some(e) => Err(e),
            None => {
                let c = std::mem::take(&mut *self.collected.borrow_mut());
                debug!("{} settled with {} matches", self.label, c.count);
                Ok(match self.query.projection {
                    Projection::Keys => Output::Keys(c.keys),
                    Projection::Values => Output::Values(c.values),
                    Projection::Count => Output::Count(c.count),
                })
            }
        };
        self.req.set_db_value(outcome);
    }
}

/// Open the query's cursors in `tx`; `req` settles with the projected rows.
pub(crate) fn start(
    query: Query,
    provider: Rc<dyn CursorProvider>,
    tx: &TxHandle,
    label: &str,
    req: Request,
) {
    let cursors = query
        .scans
        .iter()
        .enumerate()
        .map(|(i, scan)| {
            AbstractCursor::new(provider.clone(), scan.desc.clone(), format!("{}C{}", label, i))
        })
        .collect();
    let join = match JoinCursor::new(cursors, query.strategy) {
        Ok(join) => join,
        Err(e) => return req.set_db_value(Err(e)),
    };

    let run = Rc::new(QueryRun {
        query,
        req,
        label: label.to_string(),
        collected: RefCell::new(Collected::default()),
        join: RefCell::new(Some(join.clone())),
    });
    let next = run.clone();
    join.set_on_next(move |position| next.on_next(position));
    let fail = run.clone();
    join.set_on_fail(move |err| fail.finish(Some(err.clone())));

    trace!("{} open {} scans", label, join.cursors().len());
    if let Err(e) = join.open(tx) {
        run.finish(Some(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_is_sorted_union() {
        let q = Query::new(Scan::index("books", "by_author").where_eq("ann"))
            .join(Scan::new("authors"))
            .join(Scan::index("books", "by_year"));
        assert_eq!(q.scope(), vec!["authors".to_string(), "books".to_string()]);
    }

    #[test]
    fn test_scan_builders() {
        let scan = Scan::index("books", "by_year")
            .where_range(KeyRange::lower_bound(2000, false))
            .reverse()
            .unique();
        assert!(scan.desc().is_index());
        assert!(scan.desc().is_reverse());
        assert!(scan.desc().is_unique());
        assert!(!scan.desc().is_key_only());
        assert!(scan.desc().range.contains(&Key::from(2001)));
        assert!(!scan.desc().range.contains(&Key::from(1999)));
    }

    #[test]
    fn test_validate() {
        assert!(Query::new(Scan::new("a")).validate().is_ok());
        assert!(Query::new(Scan::new("a")).limit(0).validate().is_err());
        assert!(Query::new(Scan::new("")).validate().is_err());
        assert!(Query::new(Scan::new("a").key_only())
            .project(Projection::Values)
            .validate()
            .is_err());
    }
}
