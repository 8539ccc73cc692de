//! Placement back-end seam
//!
//! The selector accumulates candidate nodes and asks the loaded back-end to
//! carve an actual allocation out of them. [`LinearBackend`] is the stock
//! whole-node allocator: best-fit consecutive runs, no CPU slicing.

use crate::bitmap::Bitmap;
use crate::error::ControllerResult;
use crate::state::job::Job;
use crate::state::node::{ConfigRegistry, NodeTable};

/// Read view handed to back-end calls.
pub struct SelectContext<'a> {
    pub nodes: &'a NodeTable,
    pub cfg: &'a ConfigRegistry,
    /// Declared capacities drive placement instead of observed ones.
    pub fast_schedule: bool,
}

impl SelectContext<'_> {
    /// CPUs the scheduler may count for a node.
    pub fn node_cpus(&self, idx: usize) -> u32 {
        let Some(node) = self.nodes.get(idx) else {
            return 0;
        };
        if self.fast_schedule {
            self.cfg
                .records
                .get(node.config_idx)
                .map(|r| r.cpus)
                .unwrap_or(node.cpus)
        } else {
            node.cpus
        }
    }

    /// Total schedulable CPUs across a bitmap.
    pub fn total_cpus(&self, bitmap: &Bitmap) -> u32 {
        bitmap.iter_ones().map(|i| self.node_cpus(i)).sum()
    }
}

/// Placement plugin interface.
///
/// Dispatch may hand a back-end a job that is already complete (races on
/// the deallocate path are expected); implementations must tolerate that.
pub trait SelectBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Carve an allocation for the job out of `candidates`.
    ///
    /// On success `candidates` is pruned to exactly the chosen nodes and
    /// true is returned; on failure `candidates` is left meaningless and
    /// false is returned. `required` nodes must appear in any solution.
    fn job_test(
        &self,
        ctx: &SelectContext<'_>,
        job: &Job,
        candidates: &mut Bitmap,
        min_nodes: u32,
        max_nodes: u32,
        num_procs: u32,
        required: Option<&Bitmap>,
    ) -> bool;

    /// The job's allocation was committed.
    fn job_begin(&self, job: &Job) -> ControllerResult<()>;

    /// The job is terminating; release back-end bookkeeping.
    fn job_fini(&self, job: &Job) -> ControllerResult<()>;

    /// Nodes with spare CPU slices despite running jobs. `None` when the
    /// back-end does whole-node allocation only.
    fn partially_idle(&self, ctx: &SelectContext<'_>) -> Option<Bitmap>;
}

/// Whole-node best-fit allocator.
#[derive(Debug, Default)]
pub struct LinearBackend;

impl LinearBackend {
    pub fn new() -> Self {
        LinearBackend
    }

    /// Pick `want` nodes from `candidates`, required nodes first, then the
    /// contiguous run leaving the smallest surplus, then lowest indices.
    /// A contiguous job accepts the run or nothing.
    fn pick(
        candidates: &Bitmap,
        want: usize,
        required: Option<&Bitmap>,
        contiguous: bool,
    ) -> Option<Bitmap> {
        let mut chosen = Bitmap::new(candidates.len());
        let mut remaining = want;

        if let Some(req) = required {
            if !req.is_subset_of(candidates) {
                return None;
            }
            chosen.or_with(req);
            let have = chosen.count();
            if have >= want {
                return Some(chosen);
            }
            remaining = want - have;
        }

        let mut pool = candidates.clone();
        pool.and_not(&chosen);
        if pool.count() < remaining {
            return None;
        }

        // Consecutive preference: the tightest run that fits the remainder.
        if let Some(run) = pool.best_fit_run(remaining) {
            for idx in run {
                chosen.set(idx);
            }
            return Some(chosen);
        }
        if contiguous {
            return None;
        }

        // No single run is large enough; fill from the lowest indices.
        for idx in pool.iter_ones() {
            if remaining == 0 {
                break;
            }
            chosen.set(idx);
            remaining -= 1;
        }
        if remaining == 0 {
            Some(chosen)
        } else {
            None
        }
    }
}

impl SelectBackend for LinearBackend {
    fn name(&self) -> &'static str {
        "select/linear"
    }

    fn job_test(
        &self,
        ctx: &SelectContext<'_>,
        job: &Job,
        candidates: &mut Bitmap,
        min_nodes: u32,
        max_nodes: u32,
        num_procs: u32,
        required: Option<&Bitmap>,
    ) -> bool {
        let contiguous = job
            .details
            .as_ref()
            .map(|d| d.contiguous)
            .unwrap_or(false);
        let usable = candidates.count();
        let floor = (min_nodes.max(1) as usize)
            .max(required.map(|r| r.count()).unwrap_or(0));
        let ceil = (max_nodes as usize).max(floor).min(usable.max(floor));

        for want in floor..=ceil {
            if want > usable {
                break;
            }
            let Some(chosen) = Self::pick(candidates, want, required, contiguous) else {
                continue;
            };
            if ctx.total_cpus(&chosen) >= num_procs {
                *candidates = chosen;
                return true;
            }
        }
        false
    }

    fn job_begin(&self, _job: &Job) -> ControllerResult<()> {
        Ok(())
    }

    fn job_fini(&self, _job: &Job) -> ControllerResult<()> {
        Ok(())
    }

    fn partially_idle(&self, _ctx: &SelectContext<'_>) -> Option<Bitmap> {
        None
    }
}
