//! Controller-wide tunable floors and caps
//!
//! Compile-time defaults; most of these seed the corresponding
//! [`crate::config::ControllerConfig`] fields and can be overridden there.

use std::time::Duration;

/// Maximum concurrently active RPC workers per agent run.
pub const AGENT_THREAD_CAP: usize = 10;

/// Per-target RPC deadline.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Watchdog poll interval between slot-table scans.
pub const WDOG_POLL: Duration = Duration::from_secs(2);

/// Grace added to a slot deadline before the watchdog declares the worker
/// vanished and marks the slot non-responding itself.
pub const WDOG_GRACE: Duration = Duration::from_secs(2);

/// Minimum wait between dispatches of the same retried request.
pub const RETRY_MIN_WAIT: Duration = Duration::from_secs(10);

/// Worker daemons are asked to re-register at most every this many sweeps.
pub const MAX_REG_FREQUENCY: u32 = 20;

/// Nodes pinged per liveness sweep when the config does not say otherwise.
pub const DEFAULT_TREE_WIDTH: usize = 50;

/// Seconds without any response before a node is marked down.
pub const DEFAULT_SLURMD_TIMEOUT: u64 = 300;

/// Width of the feature-alternative bitmap; expressions may not name more
/// mutually-exclusive alternatives than this.
pub const MAX_FEATURES: usize = 32;

/// First id handed out by the job id sequence.
pub const FIRST_JOB_ID: u32 = 1;

/// Ids at or above this value are reserved for no-allocate requests; the
/// sequence wraps back to [`FIRST_JOB_ID`] below it.
pub const MIN_NOALLOC_JOB_ID: u32 = 0xFFFF_0000;

/// Hard cap on a job's computed end time: start plus one year.
pub const MAX_JOB_RUN_SECS: i64 = 365 * 24 * 3600;

/// Burst-buffer stage-in is attempted only for jobs whose projected start
/// lies within this horizon.
pub const STAGE_IN_HORIZON_SECS: i64 = 10 * 3600;

/// Checkpoint timeout queue scan interval.
pub const CKPT_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Default wait before a checkpoint operation falls back to its signal.
pub const CKPT_DEFAULT_WAIT: Duration = Duration::from_secs(10 * 60);
