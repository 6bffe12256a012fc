// src/lib.rs
pub mod backend;
pub mod constants;
pub mod cursor;
pub mod database;
pub mod env;
pub mod error;
pub mod join;
pub mod key;
pub mod memory;
pub mod parallel;
pub mod query;
pub mod request;
pub mod serial;
pub mod thread;
pub mod transaction;
pub mod types;
pub mod value;

pub use backend::{
    Connection, CursorDesc, CursorPosition, CursorProvider, Executor, NativeTx, Operation, Output,
    PhysicalCursor, Resume, TxHandle,
};
pub use constants::{CursorFlags, TxFlags};
pub use cursor::AbstractCursor;
pub use database::Store;
pub use env::{Environment, Options, ThreadKind};
pub use error::{Error, Result};
pub use join::{JoinCursor, JoinPosition, MergeStrategy};
pub use key::{Key, KeyRange};
pub use query::{Projection, Query, Scan};
pub use request::Request;
pub use thread::TxThread;
pub use types::{CompletionType, Method, ReadyState, TxMode, TxPolicy};
pub use value::Value;

// Request -> Thread -> Mutex -> back end
