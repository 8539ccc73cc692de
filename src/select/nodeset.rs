//! Node-set construction
//!
//! A node-set is a configuration-equivalence class of candidate nodes:
//! one configuration record intersected with the job's partition and the
//! inverse of its excluded nodes, carrying the record's capacity, weight,
//! and the feature bits the job's expression grants it.

use crate::bitmap::Bitmap;
use crate::error::{ControllerError, ControllerResult};
use crate::state::job::JobDetails;
use crate::state::node::{ConfigRegistry, NodeTable};
use crate::state::partition::Partition;

/// One configuration-equivalence class of candidate nodes.
#[derive(Debug, Clone)]
pub struct NodeSet {
    pub bitmap: Bitmap,
    pub node_cnt: usize,
    pub cpus_per_node: u32,
    pub real_memory: u64,
    pub weight: u32,
    pub features: Vec<String>,
    /// Feature alternatives this set satisfies, from the job's expression.
    pub feature_bits: u32,
}

/// Build the candidate node-sets for a job.
///
/// Under fast-schedule, whole configurations failing the request's minima
/// are pruned on declared values; otherwise a superset is kept and each
/// node is filtered on its observed capacity. Sets whose feature evaluation
/// comes back empty, and sets left without nodes, are discarded.
pub fn build_node_sets(
    details: &JobDetails,
    part: &Partition,
    cfg: &ConfigRegistry,
    nodes: &NodeTable,
    fast_schedule: bool,
) -> ControllerResult<Vec<NodeSet>> {
    let mut sets = Vec::new();

    for record in &cfg.records {
        let config_filter = details.min_procs > record.cpus
            || details.min_memory > record.real_memory
            || details.min_tmp_disk > record.tmp_disk;

        // Nodes can register with more resources than declared; slow
        // scheduling keeps the superset and checks each node's observed
        // capacity instead.
        let check_node_config = if fast_schedule {
            if config_filter {
                continue;
            }
            false
        } else {
            config_filter
        };

        let mut bitmap = record.nodes.clone();
        bitmap.and_with(&part.nodes);
        if let Some(exc) = &details.exc_node_bitmap {
            bitmap.and_not(exc);
        }

        if check_node_config && bitmap.any() {
            let keep: Vec<usize> = bitmap
                .iter_ones()
                .filter(|&i| {
                    nodes.get(i).is_some_and(|n| {
                        n.cpus >= details.min_procs
                            && n.real_memory >= details.min_memory
                            && n.tmp_disk >= details.min_tmp_disk
                    })
                })
                .collect();
            bitmap = Bitmap::from_indices(bitmap.len(), &keep);
        }

        if bitmap.is_clear() {
            continue;
        }

        let feature_bits = match &details.feature_list {
            Some(list) => list.matching_alternatives(&record.features),
            None => 1,
        };
        if feature_bits == 0 {
            continue;
        }

        sets.push(NodeSet {
            node_cnt: bitmap.count(),
            bitmap,
            cpus_per_node: record.cpus,
            real_memory: record.real_memory,
            weight: record.weight,
            features: record.features.clone(),
            feature_bits,
        });
    }

    if sets.is_empty() {
        return Err(ControllerError::RequestedNodeConfigUnavailable);
    }
    // Weight order must be stable across identical inputs; ties keep
    // configuration order.
    sets.sort_by_key(|s| s.weight);
    Ok(sets)
}

/// Union of every set's nodes.
pub fn union_of(sets: &[NodeSet], width: usize) -> Bitmap {
    let mut all = Bitmap::new(width);
    for set in sets {
        all.or_with(&set.bitmap);
    }
    all
}
