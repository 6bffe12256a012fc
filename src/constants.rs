use bitflags::bitflags;

// Cursor direction and projection flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CursorFlags: u32 {
        /// Iterate in descending key order
        const REVERSE = 0x01;
        /// Skip duplicate effective keys
        const UNIQUE = 0x02;
        /// Do not load record values
        const KEY_ONLY = 0x04;
    }
}

// Native transaction state flags used by the in-memory back end
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxFlags: u32 {
        const RDONLY = 0x01;
        const FINISHED = 0x02;
        const ERROR = 0x04;
        const ABORTED = 0x08;
        const DIRTY = 0x10;
    }
}

/// Thread name used in request labels when none is configured
pub const DEFAULT_THREAD_NAME: &str = "T0";
/// Upper bound accepted by `Options::set_max_tx`
pub const MAX_TX_LIMIT: usize = 1 << 20;
/// Steps a cursor may be advanced in one call
pub const MAX_ADVANCE: u32 = u32::MAX >> 1;
