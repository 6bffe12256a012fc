use log::warn;

use crate::backend::TxHandle;
use crate::error::{Error, Result};
use crate::types::{CompletionType, TxMode, TxPolicy};

/// Work run inside an open transaction; receives the handle and the
/// transaction label.
pub type Work = Box<dyn FnOnce(&TxHandle, &str)>;

/// Called once the transaction the work ran in has settled
pub type CompletionHandler = Box<dyn FnOnce(CompletionType, Option<&Error>) -> Result<()>>;

/// Work waiting for its turn
pub struct QueuedTask {
    pub work: Work,
    pub scope: Vec<String>,
    pub mode: TxMode,
    pub on_completed: Option<CompletionHandler>,
}

/// Decides whether a request may join the open transaction
pub trait ReuseTx {
    fn reused_tx(
        &self,
        active_scope: &[String],
        active_mode: TxMode,
        scope: &[String],
        mode: TxMode,
    ) -> bool;

    /// Lock every transaction right after it opens.
    fn locks_tx(&self) -> bool {
        false
    }
}

impl ReuseTx for TxPolicy {
    fn reused_tx(
        &self,
        active_scope: &[String],
        active_mode: TxMode,
        scope: &[String],
        mode: TxMode,
    ) -> bool {
        self.reuses(active_scope, active_mode, scope, mode)
    }

    fn locks_tx(&self) -> bool {
        *self == TxPolicy::Atomic
    }
}

/// Common interface of serial and parallel threads
pub trait TxThread {
    /// Run `work` in a transaction over `scope`. `on_completed` fires after
    /// the transaction the work ran in settles.
    fn run(
        &self,
        work: Work,
        scope: &[String],
        mode: TxMode,
        on_completed: Option<CompletionHandler>,
    ) -> Result<()>;

    fn name(&self) -> &str;

    /// Number of the transaction the next or current work runs in.
    fn tx_no(&self) -> u64;

    /// Tasks waiting for a transaction.
    fn queue_depth(&self) -> usize {
        0
    }

    /// Returns true while a transaction is open or requested.
    fn is_active(&self) -> bool;

    /// Stop handing the open transaction to new requests.
    fn lock(&self) -> Result<()>;
}

pub(crate) fn validate_scope(scope: &[String]) -> Result<()> {
    if scope.is_empty() {
        return Err(Error::InvalidArgument("transaction scope is empty".into()));
    }
    if let Some(name) = scope.iter().find(|s| s.is_empty()) {
        return Err(Error::InvalidArgument(format!("invalid store name {:?}", name)));
    }
    Ok(())
}

/// Run completion handlers in order. A failing handler never stalls the
/// thread: the failure is logged, or panics when `debug` is set.
pub(crate) fn fire_completion_handlers(
    label: &str,
    handlers: Vec<CompletionHandler>,
    completion: CompletionType,
    err: Option<&Error>,
    debug: bool,
) {
    for handler in handlers {
        if let Err(e) = handler(completion, err) {
            if debug {
                panic!("{} completion handler failed: {}", label, e);
            }
            warn!("{} completion handler failed: {}", label, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_policy_reuse_rules() {
        let active = names(&["a", "b"]);
        let rw = TxMode::ReadWrite;
        let ro = TxMode::ReadOnly;

        assert!(!TxPolicy::Single.reused_tx(&active, rw, &names(&["a"]), ro));
        assert!(!TxPolicy::Atomic.reused_tx(&active, rw, &active, rw));

        assert!(TxPolicy::Repeat.reused_tx(&active, rw, &names(&["b", "a"]), rw));
        assert!(!TxPolicy::Repeat.reused_tx(&active, rw, &names(&["a"]), rw));
        assert!(!TxPolicy::Repeat.reused_tx(&active, rw, &active, ro));

        assert!(TxPolicy::Multi.reused_tx(&active, rw, &names(&["a"]), ro));
        assert!(!TxPolicy::Multi.reused_tx(&active, ro, &names(&["a"]), rw));
        assert!(!TxPolicy::Multi.reused_tx(&active, rw, &names(&["c"]), ro));

        assert!(TxPolicy::All.reused_tx(&active, ro, &names(&["z"]), rw));
    }

    #[test]
    fn test_atomic_locks() {
        assert!(TxPolicy::Atomic.locks_tx());
        assert!(!TxPolicy::Multi.locks_tx());
    }

    #[test]
    fn test_validate_scope() {
        assert!(validate_scope(&[]).is_err());
        assert!(validate_scope(&names(&[""])).is_err());
        assert!(validate_scope(&names(&["s"])).is_ok());
    }

    #[test]
    fn test_failing_handler_is_swallowed() {
        let handlers: Vec<CompletionHandler> = vec![
            Box::new(|_, _| Err(Error::Backend("boom".into()))),
            Box::new(|_, _| Ok(())),
        ];
        fire_completion_handlers("T0T0", handlers, CompletionType::Complete, None, false);
    }

    #[test]
    #[should_panic(expected = "completion handler failed")]
    fn test_failing_handler_panics_in_debug() {
        let handlers: Vec<CompletionHandler> =
            vec![Box::new(|_, _| Err(Error::Backend("boom".into())))];
        fire_completion_handlers("T0T0", handlers, CompletionType::Complete, None, true);
    }
}
