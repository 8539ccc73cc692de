//! gridctld — central controller for the grid cluster resource manager
//!
//! The controller accepts job submissions, selects nodes for them, launches
//! them, watches them, and terminates them. Every one of those actions fans
//! out an RPC to a set of worker daemons through the [`agent`] module, which
//! bounds parallelism, applies per-target deadlines, classifies failures,
//! and feeds outcomes back into the authoritative tables under the
//! [`state::locks`] discipline.
//!
//! Core subsystems:
//! - [`agent`] — parallel RPC dispatch, watchdog, retry queue
//! - [`select`] — feature-aware, weight-ordered node selection
//! - [`kill`] — deallocation, re-kill, epilog completion
//! - [`state`] — node/job/partition tables and the lock domain
//! - [`ckpt`] — per-step checkpoint state machine
//! - [`ping`] — node liveness sweeps

pub mod agent;
pub mod bitmap;
pub mod ckpt;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod hostlist;
pub mod kill;
pub mod ping;
pub mod plugins;
pub mod rpc;
pub mod sackd;
pub mod sched;
pub mod select;
pub mod srun;
pub mod state;
pub mod stats;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::{ControllerError, ControllerResult};
