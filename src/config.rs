//! Replicator configuration, express in toml.
//!
//! Basic configuration file example:
//! ```toml
//! # host to replicate from when no coordinator is wired in.
//! sync_source = "localhost:27017"
//! # remote oplog namespace.
//! remote_oplog_ns = "local.oplog.rs"
//! # wait between failed initial sync attempts, in milliseconds.
//! initial_sync_retry_wait_ms = 1000
//! # wait before re-asking for a sync source, in milliseconds.
//! sync_source_retry_wait_ms = 500
//! ```

use crate::ns::Namespace;
use crate::repl::applier::ApplierFn;
use bson::Timestamp;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Replicator configuration as read from a config file.
#[derive(Deserialize, Debug, Clone)]
pub struct ReplConfig {
    /// host to replicate from, used when no coordinator chooses one.
    #[serde(default)]
    pub sync_source: Option<String>,
    /// namespace of the source oplog.
    #[serde(default = "default_oplog_ns")]
    pub remote_oplog_ns: String,
    /// wait between failed initial sync attempts.
    #[serde(default = "default_initial_sync_retry_wait_ms")]
    pub initial_sync_retry_wait_ms: u64,
    /// wait before re-asking the coordinator for a sync source.
    #[serde(default = "default_sync_source_retry_wait_ms")]
    pub sync_source_retry_wait_ms: u64,
    /// how long a source stays blacklisted after its oplog no longer
    /// contains our start position.
    #[serde(default = "default_blacklist_oplog_start_missing_ms")]
    pub blacklist_oplog_start_missing_ms: u64,
    /// how long a source stays blacklisted after a network error.
    #[serde(default = "default_blacklist_network_error_ms")]
    pub blacklist_network_error_ms: u64,
    /// byte cap of the in-memory oplog buffer.
    #[serde(default = "default_oplog_buffer_max_bytes")]
    pub oplog_buffer_max_bytes: usize,
}

fn default_oplog_ns() -> String {
    "local.oplog.rs".to_string()
}

fn default_initial_sync_retry_wait_ms() -> u64 {
    1000
}

fn default_sync_source_retry_wait_ms() -> u64 {
    500
}

fn default_blacklist_oplog_start_missing_ms() -> u64 {
    10 * 60 * 1000
}

fn default_blacklist_network_error_ms() -> u64 {
    10 * 1000
}

fn default_oplog_buffer_max_bytes() -> usize {
    256 * 1024 * 1024
}

impl Default for ReplConfig {
    fn default() -> Self {
        ReplConfig {
            sync_source: None,
            remote_oplog_ns: default_oplog_ns(),
            initial_sync_retry_wait_ms: default_initial_sync_retry_wait_ms(),
            sync_source_retry_wait_ms: default_sync_source_retry_wait_ms(),
            blacklist_oplog_start_missing_ms: default_blacklist_oplog_start_missing_ms(),
            blacklist_network_error_ms: default_blacklist_network_error_ms(),
            oplog_buffer_max_bytes: default_oplog_buffer_max_bytes(),
        }
    }
}

/// An injectable on/off switch used to force failures in tests.
///
/// Carried by value inside options so two replicators never share one by
/// accident.
#[derive(Clone, Debug, Default)]
pub struct FailPoint {
    enabled: Arc<AtomicBool>,
}

impl FailPoint {
    pub fn new() -> FailPoint {
        FailPoint::default()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Hook used by the rollback decision to locate the newest oplog position
/// shared with `source`.  `None` means no common point exists.
pub type FindCommonPointFn =
    Arc<dyn Fn(&str, Timestamp) -> Option<Timestamp> + Send + Sync>;

/// Runtime options of a [`Replicator`](crate::Replicator).
///
/// Built from a [`ReplConfig`] plus the pieces that cannot live in a config
/// file (the applier function and the test hooks).
#[derive(Clone)]
pub struct ReplicatorOptions {
    pub sync_source: Option<String>,
    pub remote_oplog_ns: Namespace,
    /// where to start tailing when there is no coordinator to ask.
    pub start_timestamp: Timestamp,
    pub applier_fn: ApplierFn,
    pub initial_sync_retry_wait: Duration,
    pub sync_source_retry_wait: Duration,
    pub blacklist_oplog_start_missing_penalty: Duration,
    pub blacklist_network_error_penalty: Duration,
    pub oplog_buffer_max_bytes: usize,
    /// when enabled, every initial sync attempt fails as if no source
    /// were available.
    pub fail_initial_sync_with_bad_host: FailPoint,
    /// rollback common-point lookup; `None` uses the built-in stub that
    /// never finds one.
    pub find_common_point: Option<FindCommonPointFn>,
}

impl ReplicatorOptions {
    pub fn new(applier_fn: ApplierFn) -> ReplicatorOptions {
        ReplicatorOptions::from_config(&ReplConfig::default(), applier_fn)
    }

    pub fn from_config(conf: &ReplConfig, applier_fn: ApplierFn) -> ReplicatorOptions {
        ReplicatorOptions {
            sync_source: conf.sync_source.clone(),
            remote_oplog_ns: Namespace::parse(&conf.remote_oplog_ns)
                .unwrap_or_else(|_| Namespace::new("local", "oplog.rs")),
            start_timestamp: Timestamp {
                time: 0,
                increment: 0,
            },
            applier_fn,
            initial_sync_retry_wait: Duration::from_millis(conf.initial_sync_retry_wait_ms),
            sync_source_retry_wait: Duration::from_millis(conf.sync_source_retry_wait_ms),
            blacklist_oplog_start_missing_penalty: Duration::from_millis(
                conf.blacklist_oplog_start_missing_ms,
            ),
            blacklist_network_error_penalty: Duration::from_millis(
                conf.blacklist_network_error_ms,
            ),
            oplog_buffer_max_bytes: conf.oplog_buffer_max_bytes,
            fail_initial_sync_with_bad_host: FailPoint::new(),
            find_common_point: None,
        }
    }
}
