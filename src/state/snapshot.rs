//! State snapshot streams
//!
//! Jobs and nodes checkpoint as versioned streams of length-prefixed
//! bincode records. Restore is tolerant: a record that fails to decode ends
//! the stream with an "incomplete checkpoint" warning and everything
//! decoded so far is kept. Callers re-derive bitmaps and counters after a
//! restore; the streams carry only the records.

use crate::error::{ControllerError, ControllerResult};
use crate::state::job::Job;
use crate::state::node::Node;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

const SNAPSHOT_MAGIC: u32 = 0x4752_4944; // "GRID"
const JOB_STATE_VERSION: u32 = 1;
const NODE_STATE_VERSION: u32 = 1;

fn pack_records<T: Serialize>(version: u32, records: impl Iterator<Item = T>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    for record in records {
        match bincode::serialize(&record) {
            Ok(body) => {
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(&body);
            }
            Err(e) => warn!(error = %e, "skipping unserializable snapshot record"),
        }
    }
    out
}

fn restore_records<T: DeserializeOwned>(
    buf: &[u8],
    expect_version: u32,
    what: &str,
) -> ControllerResult<Vec<T>> {
    if buf.len() < 8 {
        return Err(ControllerError::Snapshot(format!(
            "{what} snapshot shorter than header"
        )));
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != SNAPSHOT_MAGIC {
        return Err(ControllerError::Snapshot(format!(
            "{what} snapshot has bad magic"
        )));
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != expect_version {
        return Err(ControllerError::Snapshot(format!(
            "{what} snapshot version {version} unsupported"
        )));
    }

    let mut records = Vec::new();
    let mut pos = 8usize;
    while pos < buf.len() {
        if pos + 4 > buf.len() {
            warn!("incomplete checkpoint: truncated {what} length at byte {pos}");
            break;
        }
        let len = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if pos + len > buf.len() {
            warn!("incomplete checkpoint: truncated {what} record at byte {pos}");
            break;
        }
        match bincode::deserialize::<T>(&buf[pos..pos + len]) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(error = %e, "incomplete checkpoint: undecodable {what} record");
                break;
            }
        }
        pos += len;
    }
    Ok(records)
}

/// Serialize every job record.
pub fn pack_jobs<'a>(jobs: impl Iterator<Item = &'a Job>) -> Vec<u8> {
    pack_records(JOB_STATE_VERSION, jobs)
}

/// Decode a job stream, keeping whatever decodes.
pub fn restore_jobs(buf: &[u8]) -> ControllerResult<Vec<Job>> {
    restore_records(buf, JOB_STATE_VERSION, "job_state")
}

/// Serialize every node record.
pub fn pack_nodes<'a>(nodes: impl Iterator<Item = &'a Node>) -> Vec<u8> {
    pack_records(NODE_STATE_VERSION, nodes)
}

/// Decode a node stream, keeping whatever decodes.
pub fn restore_nodes(buf: &[u8]) -> ControllerResult<Vec<Node>> {
    restore_records(buf, NODE_STATE_VERSION, "node_state")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::job::JobState;

    fn sample_jobs() -> Vec<Job> {
        let mut a = Job::new(10, "batch");
        a.state = JobState::Running;
        a.nodes = "n[0-1]".to_string();
        a.node_cnt = 2;
        let mut b = Job::new(11, "debug");
        b.priority = 99;
        vec![a, b]
    }

    #[test]
    fn job_round_trip() {
        let jobs = sample_jobs();
        let buf = pack_jobs(jobs.iter());
        let restored = restore_jobs(&buf).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].job_id, 10);
        assert_eq!(restored[0].state, JobState::Running);
        assert_eq!(restored[1].priority, 99);
    }

    #[test]
    fn truncated_stream_keeps_decoded_prefix() {
        let jobs = sample_jobs();
        let buf = pack_jobs(jobs.iter());
        // Chop the last record in half.
        let cut = buf.len() - 10;
        let restored = restore_jobs(&buf[..cut]).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].job_id, 10);
    }

    #[test]
    fn bad_magic_is_an_error() {
        let mut buf = pack_jobs(sample_jobs().iter());
        buf[0] ^= 0xFF;
        assert!(restore_jobs(&buf).is_err());
    }

    #[test]
    fn node_round_trip() {
        let mut node = Node::new("n0", "127.0.0.1:7000".parse().unwrap());
        node.cpus = 16;
        node.features = vec!["gpu".to_string()];
        let buf = pack_nodes(std::iter::once(&node));
        let restored = restore_nodes(&buf).unwrap();
        assert_eq!(restored[0].cpus, 16);
        assert_eq!(restored[0].features, vec!["gpu".to_string()]);
    }
}
