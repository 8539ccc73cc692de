//! Job steps

use crate::bitmap::Bitmap;
use serde::{Deserialize, Serialize};

/// A child activity of a running job. Checkpoint bookkeeping for a step
/// lives in the checkpoint manager, outside the domain locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the owning job.
    pub step_id: u32,
    /// Subset of the job's allocation.
    pub node_bitmap: Bitmap,
    pub node_list: String,
    pub num_tasks: u32,
    /// Distribute tasks round-robin across nodes instead of block-filling.
    pub cyclic_alloc: bool,
}

impl Step {
    pub fn new(step_id: u32, node_bitmap: Bitmap, node_list: String, num_tasks: u32) -> Self {
        Step {
            step_id,
            node_bitmap,
            node_list,
            num_tasks,
            cyclic_alloc: false,
        }
    }
}
