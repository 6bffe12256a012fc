//! Merge join over several forward-only cursors.
//!
//! Every member cursor yields positions ordered by primary key (an index
//! cursor restricted to one index value does, as does a primary cursor).
//! The join proceeds in rounds: once every member has reported, the
//! furthest primary key along the iteration direction is the target. If all
//! members sit on it, the position is a match; otherwise only the members
//! behind the target are fast-forwarded to it and the round repeats. The
//! first member to run out ends the join.
//!
//! On a match, a member without the `UNIQUE` flag is stepped forward while
//! it keeps reporting the matched key, and every combination of the
//! collected duplicates is reported as its own match. Members then already
//! sit past the match, so the next round starts without moving them again.
//!
//! Results are produced one at a time: after each reported match the
//! consumer calls [`JoinCursor::continue_`] to ask for the next one. A join
//! restarted partway through such a group reopens its members at the start
//! of the group and drops the combinations already reported.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use log::trace;

use crate::backend::{CursorPosition, Resume, TxHandle};
use crate::cursor::AbstractCursor;
use crate::error::{Error, Result};
use crate::key::Key;

/// Which merge algorithm to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Members may be primary cursors or index cursors
    PrimaryKey,
    /// Zigzag over index cursors only
    SecondaryKey,
}

/// One joined result
#[derive(Debug, Clone, PartialEq)]
pub struct JoinPosition {
    pub primary_key: Key,
    /// Position of each member, in member order
    pub members: Vec<CursorPosition>,
}

/// Receives each match, `None` once the join is exhausted
pub type JoinNext = Box<dyn FnMut(Option<&JoinPosition>)>;

/// Receives the failure that ended the join
pub type JoinFail = Box<dyn FnMut(&Error)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    /// Waiting for members to reach a common key
    Seeking,
    /// Collecting duplicate runs of non-unique members
    Collecting,
    /// Matches ready for the consumer
    Matched,
}

#[derive(Debug, Default, Clone)]
struct Member {
    position: Option<CursorPosition>,
    arrived: bool,
    ended: bool,
}

struct JoinState {
    phase: Phase,
    members: Vec<Member>,
    match_key: Option<Key>,
    runs: Vec<Vec<CursorPosition>>,
    ready: VecDeque<JoinPosition>,
    last_match: Option<JoinPosition>,
    /// First combination of the latest match group
    group_head: Option<JoinPosition>,
    /// Combinations of that group already reported
    delivered: usize,
    /// Combinations to drop when the group is found again after a restart
    skip: usize,
    want_next: bool,
    driving: bool,
    done: bool,
    end_reported: bool,
    exited: bool,
    count: u64,
}

enum Action {
    Wait,
    Move(Vec<(usize, Option<Key>)>),
    Report(Option<JoinPosition>),
    Fail(Error),
}

struct JoinInner {
    cursors: Vec<AbstractCursor>,
    strategy: MergeStrategy,
    reverse: bool,
    label: String,
    state: RefCell<JoinState>,
    on_next: RefCell<Option<JoinNext>>,
    on_fail: RefCell<Option<JoinFail>>,
}

/// Joins member cursors on their primary keys
#[derive(Clone)]
pub struct JoinCursor {
    inner: Rc<JoinInner>,
}

impl JoinCursor {
    pub fn new(cursors: Vec<AbstractCursor>, strategy: MergeStrategy) -> Result<Self> {
        let first = cursors
            .first()
            .ok_or_else(|| Error::InvalidArgument("join needs at least one cursor".into()))?;
        let reverse = first.is_reverse();
        if cursors.iter().any(|c| c.is_reverse() != reverse) {
            return Err(Error::InvalidArgument(
                "joined cursors must iterate in the same direction".into(),
            ));
        }
        if strategy == MergeStrategy::SecondaryKey {
            if let Some(c) = cursors.iter().find(|c| !c.is_index_cursor()) {
                return Err(Error::InvalidArgument(format!(
                    "secondary key merge needs index cursors, {} is not",
                    c.label()
                )));
            }
        }
        let label = cursors
            .iter()
            .map(|c| c.label().to_string())
            .collect::<Vec<_>>()
            .join("&");
        let n = cursors.len();
        Ok(JoinCursor {
            inner: Rc::new(JoinInner {
                cursors,
                strategy,
                reverse,
                label,
                state: RefCell::new(JoinState {
                    phase: Phase::Closed,
                    members: vec![Member::default(); n],
                    match_key: None,
                    runs: vec![Vec::new(); n],
                    ready: VecDeque::new(),
                    last_match: None,
                    group_head: None,
                    delivered: 0,
                    skip: 0,
                    want_next: false,
                    driving: false,
                    done: false,
                    end_reported: false,
                    exited: false,
                    count: 0,
                }),
                on_next: RefCell::new(None),
                on_fail: RefCell::new(None),
            }),
        })
    }

    pub fn set_on_next(&self, cb: impl FnMut(Option<&JoinPosition>) + 'static) {
        *self.inner.on_next.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_on_fail(&self, cb: impl FnMut(&Error) + 'static) {
        *self.inner.on_fail.borrow_mut() = Some(Box::new(cb));
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.inner.strategy
    }

    pub fn cursors(&self) -> &[AbstractCursor] {
        &self.inner.cursors
    }

    /// Matches reported so far.
    pub fn count(&self) -> u64 {
        self.inner.state.borrow().count
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.borrow().done
    }

    pub fn is_exited(&self) -> bool {
        self.inner.state.borrow().exited
    }

    /// Open every member in `tx` and start looking for the first match.
    pub fn open(&self, tx: &TxHandle) -> Result<()> {
        self.open_from(tx, None, 0)
    }

    /// Reopen in a new transaction, continuing after the last reported match.
    pub fn restart(&self, tx: &TxHandle) -> Result<()> {
        let (from, skip) = {
            let st = self.inner.state.borrow();
            let partial = !st.ready.is_empty() || st.skip > 0;
            match &st.group_head {
                Some(head) if partial => (Some((head.clone(), true)), st.delivered),
                _ => (st.last_match.clone().map(|m| (m, false)), 0),
            }
        };
        self.open_from(tx, from, skip)
    }

    /// Open every member at its position in `from`, inclusive when the flag
    /// says so.
    fn open_from(
        &self,
        tx: &TxHandle,
        from: Option<(JoinPosition, bool)>,
        skip: usize,
    ) -> Result<()> {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.phase != Phase::Closed && !st.done && !st.exited {
                return Err(Error::invalid_op(format!("{} is already open", self.inner.label)));
            }
            st.phase = Phase::Seeking;
            st.members.iter_mut().for_each(|m| *m = Member::default());
            st.runs.iter_mut().for_each(Vec::clear);
            st.ready.clear();
            st.match_key = None;
            if from.is_none() {
                st.group_head = None;
                st.delivered = 0;
            }
            st.skip = skip;
            st.want_next = true;
            st.done = false;
            st.end_reported = false;
            st.exited = false;
        }
        trace!("{} open {:?}", self.inner.label, self.inner.strategy);

        for (i, cursor) in self.inner.cursors.iter().enumerate() {
            let join = Rc::downgrade(&self.inner);
            cursor.set_on_next(move |position| {
                if let Some(inner) = join.upgrade() {
                    JoinCursor { inner }.on_member(i, position);
                }
            });
            let join = Rc::downgrade(&self.inner);
            cursor.set_on_fail(move |err| {
                if let Some(inner) = join.upgrade() {
                    JoinCursor { inner }.fail(err.clone());
                }
            });

            let resume = from.as_ref().and_then(|(m, inclusive)| {
                m.members.get(i).map(|p| Resume {
                    key: p.key.clone(),
                    primary_key: Some(p.primary_key.clone()),
                    inclusive: *inclusive,
                })
            });
            let opened = if cursor.is_exited() || cursor.count() > 0 {
                cursor.reopen(tx, resume)
            } else {
                cursor.open(tx, resume)
            };
            if let Err(e) = opened {
                self.fail(e.clone());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Ask for the next match after one was reported.
    pub fn continue_(&self) -> Result<()> {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.exited || st.end_reported || st.phase == Phase::Closed {
                return Err(Error::invalid_op(format!(
                    "{} has no live position",
                    self.inner.label
                )));
            }
            if st.want_next {
                return Err(Error::invalid_op(format!(
                    "{} is already looking for the next match",
                    self.inner.label
                )));
            }
            st.want_next = true;
        }
        self.drive();
        Ok(())
    }

    /// Stop the join and release every member.
    pub fn exit(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.exited {
                return;
            }
            st.exited = true;
            st.want_next = false;
        }
        trace!("{} exit after {} matches", self.inner.label, self.count());
        for cursor in &self.inner.cursors {
            cursor.exit();
        }
    }

    /// Resume points of every member, for reopening in a later transaction.
    pub fn resume_positions(&self) -> Vec<Option<Resume>> {
        self.inner
            .cursors
            .iter()
            .map(AbstractCursor::resume_position)
            .collect()
    }

    fn on_member(&self, i: usize, position: Option<&CursorPosition>) {
        let step_again = {
            let mut st = self.inner.state.borrow_mut();
            if st.done || st.exited {
                return;
            }
            let phase = st.phase;
            match phase {
                Phase::Collecting => {
                    let duplicate = match (position, &st.match_key) {
                        (Some(p), Some(key)) => p.primary_key == *key,
                        _ => false,
                    };
                    if duplicate {
                        if let Some(p) = position {
                            st.runs[i].push(p.clone());
                        }
                        true
                    } else {
                        self.arrive(&mut st, i, position);
                        false
                    }
                }
                _ => {
                    self.arrive(&mut st, i, position);
                    false
                }
            }
        };
        if step_again {
            if let Err(e) = self.inner.cursors[i].continue_effective_key(None) {
                self.fail(e);
                return;
            }
        }
        self.drive();
    }

    fn arrive(&self, st: &mut JoinState, i: usize, position: Option<&CursorPosition>) {
        let member = &mut st.members[i];
        member.arrived = true;
        member.ended = position.is_none();
        member.position = position.cloned();
    }

    fn is_behind(&self, key: &Key, target: &Key) -> bool {
        if self.inner.reverse {
            key > target
        } else {
            key < target
        }
    }

    fn decide(&self, st: &mut JoinState) -> Action {
        if st.exited {
            return Action::Wait;
        }
        if st.done {
            if st.want_next && !st.end_reported {
                st.want_next = false;
                st.end_reported = true;
                return Action::Report(None);
            }
            return Action::Wait;
        }
        match st.phase {
            Phase::Closed => Action::Wait,
            Phase::Seeking => {
                if st.members.iter().any(|m| !m.arrived) {
                    return Action::Wait;
                }
                if st.members.iter().any(|m| m.ended) {
                    st.done = true;
                    return self.decide(st);
                }
                let keys: Vec<Key> = st
                    .members
                    .iter()
                    .filter_map(|m| m.position.as_ref().map(|p| p.primary_key.clone()))
                    .collect();
                let target = match keys.split_first() {
                    Some((first, rest)) => rest.iter().fold(first.clone(), |acc, k| {
                        Key::max_by_direction(&acc, k, self.inner.reverse)
                    }),
                    None => {
                        return Action::Fail(Error::invalid_state(format!(
                            "{} has members without positions",
                            self.inner.label
                        )))
                    }
                };

                if keys.iter().all(|k| *k == target) {
                    trace!("{} match at {}", self.inner.label, target);
                    for (i, m) in st.members.iter().enumerate() {
                        st.runs[i] = m.position.iter().cloned().collect();
                    }
                    let mut steps = Vec::new();
                    for (i, cursor) in self.inner.cursors.iter().enumerate() {
                        if !cursor.desc().is_unique() {
                            st.members[i].arrived = false;
                            steps.push((i, None));
                        }
                    }
                    st.match_key = Some(target);
                    st.phase = Phase::Collecting;
                    if steps.is_empty() {
                        return self.decide(st);
                    }
                    return Action::Move(steps);
                }

                let mut seeks = Vec::new();
                for (i, key) in keys.iter().enumerate() {
                    if self.is_behind(key, &target) {
                        st.members[i].arrived = false;
                        seeks.push((i, Some(target.clone())));
                    }
                }
                trace!("{} seek {} members to {}", self.inner.label, seeks.len(), target);
                Action::Move(seeks)
            }
            Phase::Collecting => {
                if st.members.iter().any(|m| !m.arrived) {
                    return Action::Wait;
                }
                let primary_key = match st.match_key.take() {
                    Some(k) => k,
                    None => {
                        return Action::Fail(Error::invalid_state("match without a key"));
                    }
                };
                let runs = std::mem::replace(&mut st.runs, vec![Vec::new(); st.members.len()]);
                let skip = match &st.group_head {
                    Some(head) if head.primary_key == primary_key => st.skip,
                    _ => 0,
                };
                st.skip = 0;
                for members in cross_product(&runs) {
                    st.ready.push_back(JoinPosition {
                        primary_key: primary_key.clone(),
                        members,
                    });
                }
                st.group_head = st.ready.front().cloned();
                let dropped = skip.min(st.ready.len());
                st.ready.drain(..dropped);
                st.delivered = dropped;
                st.phase = Phase::Matched;
                self.decide(st)
            }
            Phase::Matched => {
                if !st.want_next {
                    return Action::Wait;
                }
                if let Some(m) = st.ready.pop_front() {
                    st.want_next = false;
                    st.count += 1;
                    st.delivered += 1;
                    st.last_match = Some(m.clone());
                    return Action::Report(Some(m));
                }
                st.phase = Phase::Seeking;
                let mut steps = Vec::new();
                for (i, cursor) in self.inner.cursors.iter().enumerate() {
                    if cursor.desc().is_unique() {
                        st.members[i].arrived = false;
                        steps.push((i, None));
                    }
                }
                if steps.is_empty() {
                    return self.decide(st);
                }
                Action::Move(steps)
            }
        }
    }

    fn drive(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.driving {
                return;
            }
            st.driving = true;
        }
        loop {
            let action = {
                let mut st = self.inner.state.borrow_mut();
                self.decide(&mut st)
            };
            match action {
                Action::Wait => break,
                Action::Move(moves) => {
                    if let Err(e) = self.issue(moves) {
                        self.inner.state.borrow_mut().driving = false;
                        self.fail(e);
                        return;
                    }
                }
                Action::Report(position) => self.report(position.as_ref()),
                Action::Fail(e) => {
                    self.inner.state.borrow_mut().driving = false;
                    self.fail(e);
                    return;
                }
            }
        }
        self.inner.state.borrow_mut().driving = false;
        if self.is_done() {
            for cursor in &self.inner.cursors {
                cursor.exit();
            }
        }
    }

    fn issue(&self, moves: Vec<(usize, Option<Key>)>) -> Result<()> {
        for (i, target) in moves {
            let cursor = &self.inner.cursors[i];
            match target {
                None => cursor.continue_effective_key(None)?,
                Some(key) if cursor.is_index_cursor() => cursor.continue_primary_key(&key)?,
                Some(key) => cursor.continue_effective_key(Some(&key))?,
            }
        }
        Ok(())
    }

    fn report(&self, position: Option<&JoinPosition>) {
        let cb = self.inner.on_next.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb(position);
            let mut slot = self.inner.on_next.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    fn fail(&self, err: Error) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.done && st.end_reported {
                return;
            }
            st.done = true;
            st.end_reported = true;
            st.want_next = false;
        }
        trace!("{} failed: {}", self.inner.label, err);
        for cursor in &self.inner.cursors {
            cursor.exit();
        }
        let cb = self.inner.on_fail.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb(&err);
            let mut slot = self.inner.on_fail.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }
}

/// Every combination of one position per run, last run varying fastest.
fn cross_product(runs: &[Vec<CursorPosition>]) -> Vec<Vec<CursorPosition>> {
    runs.iter().fold(vec![Vec::new()], |acc, run| {
        acc.iter()
            .flat_map(|prefix| {
                run.iter().map(move |p| {
                    let mut combo = prefix.clone();
                    combo.push(p.clone());
                    combo
                })
            })
            .collect()
    })
}

impl fmt::Debug for JoinCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("JoinCursor")
            .field("label", &self.inner.label)
            .field("strategy", &self.inner.strategy)
            .field("phase", &st.phase)
            .field("count", &st.count)
            .field("done", &st.done)
            .finish()
    }
}
