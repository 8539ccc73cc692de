//! Node selection
//!
//! Answers three questions for a job: which nodes now, could it ever run,
//! and could it run if busy nodes were free. The pipeline gates on
//! partition policy, builds configuration node-sets, resolves sharing,
//! pre-accumulates counted features, then accumulates sets in weight order
//! per feature alternative until the back-end accepts a placement.

pub mod backend;
pub mod feature;
pub mod nodeset;

pub use backend::{LinearBackend, SelectBackend, SelectContext};
pub use feature::{FeatureList, FeatureOp, FeatureTerm};
pub use nodeset::{build_node_sets, union_of, NodeSet};

use crate::bitmap::Bitmap;
use crate::constants::MAX_JOB_RUN_SECS;
use crate::error::{ControllerError, ControllerResult};
use crate::state::job::{Job, WaitReason};
use crate::state::node::{ConfigRegistry, NodeTable};
use crate::state::partition::{Partition, PartitionTable, SharedPolicy};
use chrono::{Duration, Utc};
use tracing::{debug, info};

/// Selector knobs derived from controller configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOptions {
    pub fast_schedule: bool,
    pub consumable_resources: bool,
}

/// Pick nodes for a job.
///
/// With `test_only` nothing is committed and the read snapshot is left
/// untouched; otherwise the job transitions to RUNNING with its allocation
/// recorded and every chosen node marked allocated.
pub fn select_nodes(
    job: &mut Job,
    cfg: &ConfigRegistry,
    parts: &PartitionTable,
    nodes: &mut NodeTable,
    backend: &dyn SelectBackend,
    opts: SelectOptions,
    test_only: bool,
) -> ControllerResult<Bitmap> {
    let part = parts
        .get(&job.partition)
        .ok_or_else(|| ControllerError::InvalidPartitionName(job.partition.clone()))?
        .clone();

    partition_gate(job, &part)?;

    let details = job
        .details
        .clone()
        .ok_or_else(|| ControllerError::Internal(format!("job {} has no details", job.job_id)))?;

    let sets = build_node_sets(&details, &part, cfg, nodes, opts.fast_schedule).inspect_err(|_| {
        set_wait_reason(job, WaitReason::BadConstraints);
    })?;
    let width = nodes.len();

    // Required nodes must lie inside the union of the surviving sets.
    if let Some(req) = &details.req_node_bitmap {
        if !req.is_subset_of(&union_of(&sets, width)) {
            set_wait_reason(job, WaitReason::BadConstraints);
            return Err(ControllerError::RequestedNodeConfigUnavailable);
        }
    }

    let shared = resolve_shared(opts.consumable_resources, part.shared, details.shared);

    let ctx = SelectContext {
        nodes,
        cfg,
        fast_schedule: opts.fast_schedule,
    };

    // Counted features accumulate first, each count narrowing the pool to
    // nodes carrying that feature and claiming distinct nodes.
    let mut required = details.req_node_bitmap.clone();
    let count_requests: Vec<(String, u32)> = details
        .feature_list
        .as_ref()
        .map(|l| {
            l.count_requests()
                .into_iter()
                .map(|(n, c)| (n.to_string(), c))
                .collect()
        })
        .unwrap_or_default();

    for (fname, count) in &count_requests {
        let mut pool = Bitmap::new(width);
        for set in &sets {
            if set.features.iter().any(|f| f == fname) {
                pool.or_with(&set.bitmap);
            }
        }
        pool.and_with(&ctx.nodes.avail);
        if let Some(acc) = &required {
            pool.and_not(acc);
        }
        let mut cand = pool;
        if !backend.job_test(&ctx, job, &mut cand, *count, *count, 0, None) {
            debug!(job_id = job.job_id, feature = %fname, "feature count unsatisfiable");
            set_wait_reason(job, WaitReason::Resources);
            return Err(ControllerError::NodesBusy);
        }
        info!(
            job_id = job.job_id,
            feature = %fname,
            nodes = %ctx.nodes.bitmap_to_expr(&cand),
            "accumulated counted feature"
        );
        match &mut required {
            Some(acc) => acc.or_with(&cand),
            None => required = Some(cand),
        }
    }

    let (picked, alt_bits) = match pick_best_nodes(
        &sets,
        job,
        &ctx,
        backend,
        &details,
        required.as_ref(),
        shared,
        opts.consumable_resources,
    ) {
        Ok(picked) => picked,
        Err(feasibility) => {
            let err = feasibility.into_error();
            match &err {
                ControllerError::NodesBusy => set_wait_reason(job, WaitReason::Resources),
                _ => set_wait_reason(job, WaitReason::BadConstraints),
            }
            return Err(err);
        }
    };

    if let Some(details) = &mut job.details {
        details.feature_alt_bits = alt_bits;
    }
    if test_only {
        return Ok(picked);
    }

    commit(job, &part, cfg, nodes, backend, opts, shared, picked)
}

fn set_wait_reason(job: &mut Job, reason: WaitReason) {
    if let Some(details) = &mut job.details {
        details.wait_reason = reason;
    }
}

/// Partition policy gate. Policy rejections for a non-privileged user drop
/// the job's priority to 1 so it tails the queue; an administrator may
/// widen the partition later.
fn partition_gate(job: &mut Job, part: &Partition) -> ControllerResult<()> {
    if !part.state_up {
        set_wait_reason(job, WaitReason::PartitionDown);
        return Err(ControllerError::RequestedPartConfigUnavailable);
    }
    if job.priority == 0 {
        set_wait_reason(job, WaitReason::Held);
        return Err(ControllerError::JobHeld);
    }

    let super_user = job.user_id == 0;
    if part.root_only && !super_user {
        return Err(ControllerError::AccessDenied { uid: job.user_id });
    }
    if !part.allows_groups(&job.groups) && !super_user {
        return Err(ControllerError::JobMissingRequiredPartitionGroup);
    }
    if super_user {
        return Ok(());
    }

    let mut reason = None;
    if let Some(max_time) = part.max_time {
        if job.time_limit.map(|t| t > max_time).unwrap_or(true) {
            reason = Some(WaitReason::PartitionTimeLimit);
        }
    }
    if let Some(details) = &job.details {
        if details.min_nodes > part.max_nodes {
            reason = Some(WaitReason::PartitionNodeLimit);
        }
    }
    if let Some(reason) = reason {
        if job.priority > 1 {
            info!(
                job_id = job.job_id,
                "request exceeds partition policy, dropping priority to 1"
            );
            job.priority = 1;
        }
        set_wait_reason(job, reason);
        return Err(ControllerError::RequestedPartConfigUnavailable);
    }
    Ok(())
}

/// Sharing truth table over consumable-resources, partition policy, and the
/// user's request.
fn resolve_shared(consumable: bool, policy: SharedPolicy, user_req: Option<bool>) -> bool {
    if consumable {
        // Per-CPU accounting: only an explicit "no" or a no-share
        // partition forces whole nodes.
        !(policy == SharedPolicy::No
            || policy == SharedPolicy::Exclusive
            || user_req == Some(false))
    } else {
        match policy {
            SharedPolicy::Force => true,
            SharedPolicy::No | SharedPolicy::Exclusive => false,
            SharedPolicy::Yes => user_req == Some(true),
        }
    }
}

/// Why the main loop produced nothing.
struct Feasibility {
    /// Some arrangement of currently-available nodes would satisfy.
    runnable_avail: bool,
    /// Some arrangement across all configured nodes would satisfy.
    runnable_ever: bool,
}

impl Feasibility {
    fn into_error(self) -> ControllerError {
        match (self.runnable_avail, self.runnable_ever) {
            (false, false) => ControllerError::RequestedNodeConfigUnavailable,
            (true, false) => ControllerError::RequestedPartConfigUnavailable,
            _ => ControllerError::NodesBusy,
        }
    }
}

/// Nodes running at most `max_jobs` jobs.
fn load_mask(nodes: &NodeTable, max_jobs: u32) -> Bitmap {
    let mut mask = Bitmap::new(nodes.len());
    for (idx, node) in nodes.iter() {
        if node.run_job_cnt <= max_jobs {
            mask.set(idx);
        }
    }
    mask
}

/// Accumulate node-sets per feature alternative, in weight order, testing
/// the back-end after each accumulation; sharing uses a load-stepped retry
/// ladder from unloaded nodes upward.
#[allow(clippy::too_many_arguments)]
fn pick_best_nodes(
    sets: &[NodeSet],
    job: &Job,
    ctx: &SelectContext<'_>,
    backend: &dyn SelectBackend,
    details: &crate::state::job::JobDetails,
    required: Option<&Bitmap>,
    shared: bool,
    consumable: bool,
) -> Result<(Bitmap, u32), Feasibility> {
    let width = ctx.nodes.len();
    let min_nodes = details
        .min_nodes
        .max(required.map(|r| r.count() as u32).unwrap_or(0))
        .max(1);
    let max_nodes = if details.max_nodes == 0 {
        u32::MAX
    } else {
        details.max_nodes.max(min_nodes)
    };
    let num_procs = details.num_procs;

    // The usable mask per the sharing decision: shareable nodes, idle
    // nodes, or the back-end's partially-idle set.
    let usable = if shared {
        let base = if consumable {
            backend.partially_idle(ctx)
        } else {
            None
        };
        match base {
            Some(partial) => Bitmap::intersection(&ctx.nodes.avail, &partial),
            None => Bitmap::intersection(&ctx.nodes.avail, &ctx.nodes.share),
        }
    } else {
        Bitmap::intersection(&ctx.nodes.avail, &ctx.nodes.idle)
    };

    let alt_bits: u32 = sets.iter().fold(0, |acc, s| acc | s.feature_bits);
    let mut runnable_avail = false;

    for alt in 0..crate::constants::MAX_FEATURES as u32 {
        let mask = 1u32 << alt;
        if alt_bits & mask == 0 {
            if alt_bits >> alt == 0 {
                break;
            }
            continue;
        }

        let mut accumulated = Bitmap::new(width);
        let mut avail_union = Bitmap::new(width);
        for set in sets {
            if set.feature_bits & mask == 0 {
                continue;
            }
            let add = Bitmap::intersection(&set.bitmap, &usable);
            avail_union.or_with(&Bitmap::intersection(&set.bitmap, &ctx.nodes.avail));
            accumulated.or_with(&add);

            if !thresholds_met(ctx, &accumulated, min_nodes, num_procs, required) {
                continue;
            }
            if shared {
                // Load-stepped: retry placement on progressively more
                // loaded nodes.
                for load in [0u32, 1, 2] {
                    let mut cand =
                        Bitmap::intersection(&accumulated, &load_mask(ctx.nodes, load));
                    if !thresholds_met(ctx, &cand, min_nodes, num_procs, required) {
                        continue;
                    }
                    if backend.job_test(ctx, job, &mut cand, min_nodes, max_nodes, num_procs, required)
                    {
                        return Ok((cand, mask));
                    }
                }
            } else {
                let mut cand = accumulated.clone();
                if backend.job_test(ctx, job, &mut cand, min_nodes, max_nodes, num_procs, required)
                {
                    return Ok((cand, mask));
                }
            }
        }

        // The alternative failed on usable nodes; probe whether merely
        // available nodes would have sufficed.
        if !runnable_avail && thresholds_met(ctx, &avail_union, min_nodes, num_procs, required) {
            let mut cand = avail_union.clone();
            if backend.job_test(ctx, job, &mut cand, min_nodes, max_nodes, num_procs, required) {
                runnable_avail = true;
            }
        }
    }

    // Probe the full configuration, ignoring current node state.
    let mut ever = union_of(sets, width);
    let runnable_ever = thresholds_met(ctx, &ever, min_nodes, num_procs, required)
        && backend.job_test(ctx, job, &mut ever, min_nodes, max_nodes, num_procs, required);

    Err(Feasibility {
        runnable_avail,
        runnable_ever,
    })
}

fn thresholds_met(
    ctx: &SelectContext<'_>,
    candidates: &Bitmap,
    min_nodes: u32,
    num_procs: u32,
    required: Option<&Bitmap>,
) -> bool {
    if (candidates.count() as u32) < min_nodes {
        return false;
    }
    if ctx.total_cpus(candidates) < num_procs {
        return false;
    }
    required.map(|r| r.is_subset_of(candidates)).unwrap_or(true)
}

/// Commit an allocation: back-end begin, node list string, CPU run-length
/// layout, address vector, RUNNING transition, and start/end times.
#[allow(clippy::too_many_arguments)]
fn commit(
    job: &mut Job,
    part: &Partition,
    cfg: &ConfigRegistry,
    nodes: &mut NodeTable,
    backend: &dyn SelectBackend,
    opts: SelectOptions,
    shared: bool,
    picked: Bitmap,
) -> ControllerResult<Bitmap> {
    backend.job_begin(job)?;

    job.nodes = nodes.bitmap_to_expr(&picked);
    job.node_cnt = picked.count() as u32;

    // Run-length encode the per-node CPU layout in node index order.
    job.cpus_per_node.clear();
    job.cpu_count_reps.clear();
    job.node_addrs.clear();
    {
        let ctx = SelectContext {
            nodes,
            cfg,
            fast_schedule: opts.fast_schedule,
        };
        for idx in picked.iter_ones() {
            let cpus = ctx.node_cpus(idx);
            match job.cpus_per_node.last() {
                Some(&last) if last == cpus => {
                    if let Some(reps) = job.cpu_count_reps.last_mut() {
                        *reps += 1;
                    }
                }
                _ => {
                    job.cpus_per_node.push(cpus);
                    job.cpu_count_reps.push(1);
                }
            }
            if let Some(node) = ctx.nodes.get(idx) {
                job.node_addrs.push(node.addr);
            }
        }
    }

    let now = Utc::now();
    job.state = crate::state::job::JobState::Running;
    job.start_time = Some(now);
    let limit_minutes = match (job.time_limit, part.max_time) {
        (Some(t), _) => Some(t),
        (None, Some(p)) => Some(p),
        (None, None) => None,
    };
    job.end_time = Some(match limit_minutes {
        Some(minutes) => {
            let end = now + Duration::minutes(i64::from(minutes));
            let cap = now + Duration::seconds(MAX_JOB_RUN_SECS);
            end.min(cap)
        }
        None => now + Duration::seconds(MAX_JOB_RUN_SECS),
    });
    set_wait_reason(job, WaitReason::None);

    for idx in picked.iter_ones() {
        nodes.make_node_alloc(idx, shared);
    }
    job.node_bitmap = picked.clone();
    job.shared = shared;

    info!(
        job_id = job.job_id,
        nodes = %job.nodes,
        cpus = ?job.cpus_per_node,
        "job allocated"
    );
    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharing_truth_table() {
        use SharedPolicy::*;
        // consumable off
        assert!(resolve_shared(false, Force, None));
        assert!(resolve_shared(false, Force, Some(false)));
        assert!(!resolve_shared(false, No, Some(true)));
        assert!(resolve_shared(false, Yes, Some(true)));
        assert!(!resolve_shared(false, Yes, None));
        assert!(!resolve_shared(false, Yes, Some(false)));
        assert!(!resolve_shared(false, Exclusive, Some(true)));
        // consumable on
        assert!(!resolve_shared(true, No, Some(true)));
        assert!(!resolve_shared(true, Yes, Some(false)));
        assert!(resolve_shared(true, Yes, None));
        assert!(resolve_shared(true, Force, Some(true)));
    }

    #[test]
    fn feasibility_error_mapping() {
        assert!(matches!(
            Feasibility {
                runnable_avail: false,
                runnable_ever: false
            }
            .into_error(),
            ControllerError::RequestedNodeConfigUnavailable
        ));
        assert!(matches!(
            Feasibility {
                runnable_avail: true,
                runnable_ever: false
            }
            .into_error(),
            ControllerError::RequestedPartConfigUnavailable
        ));
        assert!(matches!(
            Feasibility {
                runnable_avail: true,
                runnable_ever: true
            }
            .into_error(),
            ControllerError::NodesBusy
        ));
    }
}
