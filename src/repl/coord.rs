use bson::Timestamp;
use std::time::Instant;

/// A totally ordered position in the oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpTime {
    pub ts: Timestamp,
    pub term: i64,
}

impl OpTime {
    pub fn new(ts: Timestamp, term: i64) -> OpTime {
        OpTime { ts, term }
    }
}

/// Replica member states the core can ask the coordinator to move to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Startup,
    Primary,
    Secondary,
    Recovering,
    Rollback,
}

/// The node-level coordinator: publishes our progress and picks sync
/// sources.  Implemented elsewhere in the node; the core only consumes it.
pub trait ReplicationCoordinator: Send + Sync {
    fn set_my_last_optime(&self, optime: OpTime);

    fn get_my_last_optime(&self) -> OpTime;

    /// `None` means no eligible source right now; the caller retries later.
    fn choose_new_sync_source(&self) -> Option<String>;

    fn blacklist_sync_source(&self, host: &str, until: Instant);

    /// Returns false when the transition is refused.
    fn set_follower_mode(&self, state: MemberState) -> bool;
}
