//! Data replication core of a replica-set database node: initial sync,
//! steady oplog tailing with batched application, and the rollback
//! decision, all orchestrated as completion callbacks on a shared executor.

mod config;
mod error;
pub mod executor;
pub mod net;
mod ns;
pub mod repl;
mod time_helper;

pub const ADMIN_DB_NAME: &str = "admin";
pub const OPLOG_DB: &str = "local";
pub const OPLOG_COLL: &str = "oplog.rs";

// oplog relative keys.
pub const TIMESTAMP_KEY: &str = "ts";
pub const NAMESPACE_KEY: &str = "ns";
pub const OBJ2_KEY: &str = "o2";
pub const ID_KEY: &str = "_id";

pub use config::{FailPoint, FindCommonPointFn, ReplConfig, ReplicatorOptions};
pub use error::{ReplError, Result};
pub use ns::Namespace;
pub use repl::applier::{ApplierFn, Operations};
pub use repl::coord::{MemberState, OpTime, ReplicationCoordinator};
pub use repl::replicator::{Replicator, ReplicatorState, ReplicatorStats};
pub use repl::storage::StorageInterface;
