//! ```text
//!            up()           lock()
//!   Idle ──────────▶ Active ──────▶ Locked
//!    ▲                 │              │
//!    │                 │ exit()       │ exit()
//!    │                 ▼              ▼
//!    └──── down() ── Exited ◀─────────┘
//! ```
//!
//! `down()` is accepted from every non-idle state.

use std::fmt;

use log::trace;

use crate::backend::TxHandle;
use crate::error::{Error, Result};
use crate::types::{CompletionType, TxMode};

/// Observable mutex state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    /// No transaction is open
    Idle,
    /// A transaction is open and may take new requests
    Active,
    /// A transaction is open but must not be reused
    Locked,
    /// The open callback returned; the transaction only finishes its own work
    Exited,
}

/// Tracks the native transaction a thread currently holds
#[derive(Default)]
pub struct TxMutex {
    /// Open transaction
    tx: Option<TxHandle>,
    /// Store names in scope
    scope: Vec<String>,
    /// Access mode of the open transaction
    mode: Option<TxMode>,
    /// Transactions completed so far
    tx_count: u64,
    locked: bool,
    exited: bool,
    /// How the last transaction settled
    last_completion: Option<CompletionType>,
}

impl TxMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexState {
        if self.tx.is_none() {
            MutexState::Idle
        } else if self.exited {
            MutexState::Exited
        } else if self.locked {
            MutexState::Locked
        } else {
            MutexState::Active
        }
    }

    /// Record a freshly opened transaction.
    pub fn up(&mut self, tx: TxHandle, scope: &[String], mode: TxMode) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::invalid_state(format!(
                "transaction {} still open",
                self.tx_count
            )));
        }
        trace!("mutex up: tx #{} {:?} {}", self.tx_count, scope, mode);
        self.tx = Some(tx);
        self.scope = scope.to_vec();
        self.mode = Some(mode);
        self.locked = false;
        self.exited = false;
        Ok(())
    }

    /// Keep the transaction open but stop handing it to new requests.
    pub fn lock(&mut self) -> Result<()> {
        if self.tx.is_none() {
            return Err(Error::invalid_state("no transaction to lock"));
        }
        self.locked = true;
        Ok(())
    }

    /// Mark the open callback as returned.
    pub fn exit(&mut self) {
        if self.tx.is_some() {
            self.exited = true;
        }
    }

    /// Record that the native transaction settled.
    pub fn down(&mut self, completion: CompletionType) -> Result<()> {
        if self.tx.is_none() {
            return Err(Error::invalid_state("no transaction to release"));
        }
        trace!("mutex down: tx #{} {}", self.tx_count, completion);
        self.tx = None;
        self.scope.clear();
        self.mode = None;
        self.locked = false;
        self.exited = false;
        self.tx_count += 1;
        self.last_completion = Some(completion);
        Ok(())
    }

    /// Returns true while a native transaction is open.
    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Returns true when the open transaction may take new requests.
    pub fn is_active_and_available(&self) -> bool {
        self.state() == MutexState::Active
    }

    /// The open transaction, only when available for new requests.
    pub fn tx(&self) -> Option<&TxHandle> {
        if self.is_active_and_available() {
            self.tx.as_ref()
        } else {
            None
        }
    }

    /// The open transaction regardless of lock state.
    pub fn current(&self) -> Option<&TxHandle> {
        self.tx.as_ref()
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    pub fn mode(&self) -> Option<TxMode> {
        self.mode
    }

    pub fn tx_count(&self) -> u64 {
        self.tx_count
    }

    pub fn last_completion(&self) -> Option<CompletionType> {
        self.last_completion
    }
}

impl fmt::Debug for TxMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxMutex")
            .field("state", &self.state())
            .field("scope", &self.scope)
            .field("mode", &self.mode)
            .field("tx_count", &self.tx_count)
            .finish()
    }
}
