//! Burst-buffer plugin class
//!
//! Stage-in runs against a filtered, start-time-sorted queue of pending
//! jobs with burst-buffer specs whose projected start is near. The two
//! string transforms are pure so they can run anywhere.

use crate::constants::STAGE_IN_HORIZON_SECS;
use crate::error::ControllerResult;
use crate::plugins::PluginDispatcher;
use crate::state::job::{Job, JobState, JobTable};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Burst-buffer back-end interface.
pub trait BurstBufferPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start staging data in for the queued jobs, best first.
    fn job_try_stage_in(&self, job_ids: &[u32]) -> ControllerResult<()>;

    /// Whether a job's stage-in has finished.
    fn job_test_stage_in(&self, job: &Job) -> ControllerResult<bool>;

    /// Release buffer resources on job completion.
    fn job_teardown(&self, job: &Job) -> ControllerResult<()>;
}

/// Build the stage-in queue and hand it to the loaded plugins.
///
/// Pending jobs with a burst-buffer spec and a projected start within the
/// horizon, sorted by projected start then job id. Returns how many jobs
/// were queued.
pub fn job_try_stage_in(
    jobs: &JobTable,
    dispatcher: &PluginDispatcher<dyn BurstBufferPlugin>,
    now: DateTime<Utc>,
) -> ControllerResult<usize> {
    let horizon = now + chrono::Duration::seconds(STAGE_IN_HORIZON_SECS);
    let mut queue: Vec<(DateTime<Utc>, u32)> = jobs
        .iter()
        .filter(|j| j.state == JobState::Pending)
        .filter(|j| j.burst_buffer.as_deref().is_some_and(|b| !b.is_empty()))
        .filter_map(|j| {
            // Jobs without a projected start are not near enough to stage.
            let start = j.start_time?;
            (start <= horizon).then_some((start, j.job_id))
        })
        .collect();
    queue.sort();
    let ids: Vec<u32> = queue.into_iter().map(|(_, id)| id).collect();
    if ids.is_empty() {
        return Ok(0);
    }
    debug!(jobs = ids.len(), "burst buffer stage-in pass");
    dispatcher.dispatch(|p| p.job_try_stage_in(&ids))?;
    Ok(ids.len())
}

/// Split a heterogeneous job script into the component for one offset.
///
/// Components are delimited by `#BB component` lines; component 0 is the
/// script head. Pure string transform.
pub fn build_het_job_script(script: &str, het_job_offset: u32) -> String {
    let mut component = 0u32;
    let mut out = String::new();
    for line in script.lines() {
        if line.trim_start().starts_with("#BB component") {
            component += 1;
            continue;
        }
        if component == het_job_offset {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Translate a burst-buffer spec into a TRES string, megabytes normalized.
///
/// `capacity=2G,pool=fast` becomes `bb=2048`. Unparsable sizes count as
/// zero. Pure string transform.
pub fn xlate_bb_to_tres_str(burst_buffer: &str) -> String {
    let mut total_mb: u64 = 0;
    for part in burst_buffer.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("capacity") {
            continue;
        }
        let value = value.trim();
        let (digits, suffix) = value.split_at(
            value
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(value.len()),
        );
        let Ok(n) = digits.parse::<u64>() else { continue };
        total_mb += match suffix.to_ascii_uppercase().as_str() {
            "" | "M" | "MB" => n,
            "G" | "GB" => n * 1024,
            "T" | "TB" => n * 1024 * 1024,
            "K" | "KB" => n / 1024,
            _ => 0,
        };
    }
    if total_mb == 0 {
        String::new()
    } else {
        format!("bb={total_mb}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingPlugin {
        staged: Mutex<Vec<Vec<u32>>>,
    }

    impl BurstBufferPlugin for RecordingPlugin {
        fn name(&self) -> &'static str {
            "bb/recording"
        }
        fn job_try_stage_in(&self, job_ids: &[u32]) -> ControllerResult<()> {
            self.staged.lock().push(job_ids.to_vec());
            Ok(())
        }
        fn job_test_stage_in(&self, _job: &Job) -> ControllerResult<bool> {
            Ok(true)
        }
        fn job_teardown(&self, _job: &Job) -> ControllerResult<()> {
            Ok(())
        }
    }

    #[test]
    fn queue_filters_and_sorts_by_projected_start() {
        let now = Utc::now();
        let mut jobs = JobTable::new();

        let mut near = Job::new(1, "batch");
        near.burst_buffer = Some("capacity=1G".to_string());
        near.start_time = Some(now + chrono::Duration::hours(2));
        let mut sooner = Job::new(2, "batch");
        sooner.burst_buffer = Some("capacity=1G".to_string());
        sooner.start_time = Some(now + chrono::Duration::hours(1));
        let mut far = Job::new(3, "batch");
        far.burst_buffer = Some("capacity=1G".to_string());
        far.start_time = Some(now + chrono::Duration::hours(20));
        let mut plain = Job::new(4, "batch");
        plain.start_time = Some(now);

        for job in [near, sooner, far, plain] {
            jobs.insert(job).unwrap();
        }

        let plugin = Arc::new(RecordingPlugin::default());
        let dispatcher: PluginDispatcher<dyn BurstBufferPlugin> =
            PluginDispatcher::new(vec![plugin.clone()]);
        let queued = job_try_stage_in(&jobs, &dispatcher, now).unwrap();
        assert_eq!(queued, 2);
        assert_eq!(plugin.staged.lock()[0], vec![2, 1]);
    }

    #[test]
    fn het_script_components_split() {
        let script = "#!/bin/bash\nhead\n#BB component\nmiddle\n#BB component\ntail\n";
        assert_eq!(build_het_job_script(script, 0), "#!/bin/bash\nhead\n");
        assert_eq!(build_het_job_script(script, 1), "middle\n");
        assert_eq!(build_het_job_script(script, 2), "tail\n");
    }

    #[test]
    fn tres_translation_normalizes_units() {
        assert_eq!(xlate_bb_to_tres_str("capacity=2G,pool=fast"), "bb=2048");
        assert_eq!(xlate_bb_to_tres_str("capacity=512M"), "bb=512");
        assert_eq!(xlate_bb_to_tres_str("capacity=1T"), "bb=1048576");
        assert_eq!(xlate_bb_to_tres_str("pool=fast"), "");
    }
}
