use std::fmt;

/// Access mode of a native transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

impl TxMode {
    /// Returns true if a transaction opened in `self` may serve a request needing `needed`.
    pub fn covers(self, needed: TxMode) -> bool {
        self == TxMode::ReadWrite || needed == TxMode::ReadOnly
    }
}

impl fmt::Display for TxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxMode::ReadOnly => write!(f, "readonly"),
            TxMode::ReadWrite => write!(f, "readwrite"),
        }
    }
}

/// How a native transaction settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionType {
    Complete,
    Abort,
    Error,
}

impl fmt::Display for CompletionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionType::Complete => write!(f, "complete"),
            CompletionType::Abort => write!(f, "abort"),
            CompletionType::Error => write!(f, "error"),
        }
    }
}

/// Operation kind carried by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Add,
    AddAll,
    Put,
    PutAll,
    Get,
    GetAll,
    Keys,
    Values,
    Count,
    Clear,
    Remove,
    RemoveRange,
    Query,
}

impl Method {
    /// Returns true if the method writes to the store.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Method::Add
                | Method::AddAll
                | Method::Put
                | Method::PutAll
                | Method::Clear
                | Method::Remove
                | Method::RemoveRange
        )
    }

    pub fn mode(self) -> TxMode {
        if self.is_write() {
            TxMode::ReadWrite
        } else {
            TxMode::ReadOnly
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Add => "ADD",
            Method::AddAll => "ADD_ALL",
            Method::Put => "PUT",
            Method::PutAll => "PUT_ALL",
            Method::Get => "GET",
            Method::GetAll => "GET_ALL",
            Method::Keys => "KEYS",
            Method::Values => "VALUES",
            Method::Count => "COUNT",
            Method::Clear => "CLEAR",
            Method::Remove => "REMOVE",
            Method::RemoveRange => "REMOVE_RANGE",
            Method::Query => "QUERY",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction reuse policy shared by serial and parallel threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxPolicy {
    /// Every request opens its own transaction
    #[default]
    Single,
    /// Like `Single`, and the transaction is locked against joining
    Atomic,
    /// Reuse only when scope and mode match exactly
    Repeat,
    /// Reuse when the scope is a subset and the mode is covered
    Multi,
    /// Reuse whenever a transaction is available
    All,
}

impl TxPolicy {
    /// Decide whether a request for `scope`/`mode` may join a transaction
    /// opened for `active_scope`/`active_mode`.
    pub fn reuses(
        self,
        active_scope: &[String],
        active_mode: TxMode,
        scope: &[String],
        mode: TxMode,
    ) -> bool {
        match self {
            TxPolicy::Single | TxPolicy::Atomic => false,
            TxPolicy::Repeat => {
                active_mode == mode
                    && active_scope.len() == scope.len()
                    && scope.iter().all(|s| active_scope.contains(s))
            }
            TxPolicy::Multi => {
                active_mode.covers(mode) && scope.iter().all(|s| active_scope.contains(s))
            }
            TxPolicy::All => true,
        }
    }
}

/// Resolution state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Pending,
    Resolved,
    Rejected,
}
