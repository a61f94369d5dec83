//! RevFS Core Library
//!
//! Versioned tree storage for RevFS including:
//! - Node identity scheme (node ids, node-version ids, ancestry)
//! - Revision store with revision properties and changed-path lists
//! - Node store with forward delta chains
//! - Transactions with optimistic commit and out-of-date checks
//! - Dump stream parsing, dumping and loading
//! - In-memory and SQLite (WAL mode) storage backends

pub mod cancel;
pub mod config;
pub mod delta;
pub mod dump;
pub mod dump_format;
pub mod dump_parser;
pub mod error;
pub mod id;
pub mod load;
pub mod node_store;
pub mod object;
pub mod path;
pub mod properties;
pub mod repository;
pub mod sqlite_backend;
pub mod storage;
pub mod transaction;

/// Revision number; revision 0 is the empty initial revision
pub type Revnum = u64;

pub use cancel::CancelFlag;
pub use config::RepositoryConfig;
pub use dump::{dump_repository, DumpOptions, DumpStats};
pub use dump_parser::{parse_dump, DumpEvent, DumpParser, DumpVisitor};
pub use error::{FsError, Result};
pub use id::{is_ancestor, NodeId, NodeVersionId};
pub use load::{load_dump, LoadOptions, LoadStats, UuidAction};
pub use object::{ChangeAction, ChangedPath, CopySource, NodeKind, NodeRevision, Revision};
pub use properties::{svn_props, PropertyMap};
pub use repository::Repository;
pub use storage::{Backend, CommitBatch, MemoryBackend, StagedWrites};
pub use transaction::{CommitOutcome, PropTarget, Transaction, TxnState};
