//! Controller configuration
//!
//! TOML-based configuration with environment variable overrides.
//! Loading hierarchy: env > file > defaults. Environment variables use the
//! `GRIDCTLD_` prefix (`GRIDCTLD_SLURMD_TIMEOUT`, `GRIDCTLD_TREE_WIDTH`, …).

use crate::constants;
use crate::error::{ControllerError, ControllerResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runtime-tunable controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Seconds without any response before a node is marked down.
    pub slurmd_timeout: u64,
    /// Per-target RPC deadline, seconds.
    pub command_timeout: u64,
    /// Maximum concurrently active RPC workers per agent run.
    pub agent_thread_cap: usize,
    /// Nodes covered per liveness sweep.
    pub tree_width: usize,
    /// Sweeps between forced re-registration of a given window.
    pub max_reg_frequency: u32,
    /// Seconds between retry-queue checks.
    pub retry_min_wait: u64,
    /// Declared capacities drive placement instead of observed ones.
    pub fast_schedule: bool,
    /// Per-CPU accounting back-end loaded; enables partially-idle sharing.
    pub consumable_resources: bool,
    /// All worker RPCs route through the first allocated node.
    pub front_end: bool,
    /// Default for jobs that do not say whether a node failure kills them.
    pub kill_on_node_fail: bool,
    /// Seconds between scheduler passes absent an explicit wake.
    pub schedule_interval: u64,
    /// Seconds between health-check sweeps; 0 disables them.
    pub health_check_interval: u64,
    /// External mailer program.
    pub mail_prog: PathBuf,
    /// Post-checkpoint hook, run as the job's uid/gid.
    pub ckpt_hook_prog: Option<PathBuf>,
    /// Directory holding job_state / node_state snapshots.
    pub state_save_location: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            slurmd_timeout: constants::DEFAULT_SLURMD_TIMEOUT,
            command_timeout: constants::COMMAND_TIMEOUT.as_secs(),
            agent_thread_cap: constants::AGENT_THREAD_CAP,
            tree_width: constants::DEFAULT_TREE_WIDTH,
            max_reg_frequency: constants::MAX_REG_FREQUENCY,
            retry_min_wait: constants::RETRY_MIN_WAIT.as_secs(),
            fast_schedule: true,
            consumable_resources: false,
            front_end: false,
            kill_on_node_fail: true,
            schedule_interval: 60,
            health_check_interval: 0,
            mail_prog: PathBuf::from("/bin/mail"),
            ckpt_hook_prog: None,
            state_save_location: PathBuf::from("/var/spool/gridctld"),
        }
    }
}

impl ControllerConfig {
    /// Load from an optional file, then apply environment overrides, then
    /// validate.
    pub fn load(path: Option<&Path>) -> ControllerResult<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => ControllerConfig::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file.
    pub fn load_from_file(path: &Path) -> ControllerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ControllerError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| ControllerError::Config(format!("{}: {e}", path.display())))
    }

    /// Apply `GRIDCTLD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> ControllerResult<()> {
        override_u64(&mut self.slurmd_timeout, "GRIDCTLD_SLURMD_TIMEOUT")?;
        override_u64(&mut self.command_timeout, "GRIDCTLD_COMMAND_TIMEOUT")?;
        override_usize(&mut self.agent_thread_cap, "GRIDCTLD_AGENT_THREAD_CAP")?;
        override_usize(&mut self.tree_width, "GRIDCTLD_TREE_WIDTH")?;
        override_u64(&mut self.retry_min_wait, "GRIDCTLD_RETRY_MIN_WAIT")?;
        override_u64(&mut self.schedule_interval, "GRIDCTLD_SCHEDULE_INTERVAL")?;
        override_bool(&mut self.fast_schedule, "GRIDCTLD_FAST_SCHEDULE")?;
        override_bool(&mut self.front_end, "GRIDCTLD_FRONT_END")?;
        Ok(())
    }

    /// Reject configurations the controller cannot run with.
    pub fn validate(&self) -> ControllerResult<()> {
        if self.agent_thread_cap < 1 {
            return Err(ControllerError::Config(
                "agent_thread_cap must be at least 1".to_string(),
            ));
        }
        if self.command_timeout == 0 {
            return Err(ControllerError::Config(
                "command_timeout must be nonzero".to_string(),
            ));
        }
        if self.tree_width == 0 {
            return Err(ControllerError::Config(
                "tree_width must be nonzero".to_string(),
            ));
        }
        if self.slurmd_timeout != 0 && self.slurmd_timeout < 3 * self.command_timeout {
            return Err(ControllerError::Config(
                "slurmd_timeout must be at least three command timeouts".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout)
    }

    pub fn retry_min_wait_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_min_wait)
    }
}

fn override_u64(field: &mut u64, var: &str) -> ControllerResult<()> {
    if let Ok(val) = std::env::var(var) {
        *field = val
            .parse()
            .map_err(|_| ControllerError::Config(format!("{var}={val} is not an integer")))?;
    }
    Ok(())
}

fn override_usize(field: &mut usize, var: &str) -> ControllerResult<()> {
    if let Ok(val) = std::env::var(var) {
        *field = val
            .parse()
            .map_err(|_| ControllerError::Config(format!("{var}={val} is not an integer")))?;
    }
    Ok(())
}

fn override_bool(field: &mut bool, var: &str) -> ControllerResult<()> {
    if let Ok(val) = std::env::var(var) {
        *field = match val.as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => {
                return Err(ControllerError::Config(format!(
                    "{var}={val} is not a boolean"
                )))
            }
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_validate() {
        ControllerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_thread_cap_rejected() {
        let mut config = ControllerConfig::default();
        config.agent_thread_cap = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridctld.toml");
        std::fs::write(&path, "tree_width = 8\nfast_schedule = false\n").unwrap();
        let config = ControllerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.tree_width, 8);
        assert!(!config.fast_schedule);
        // Untouched fields keep defaults.
        assert_eq!(config.slurmd_timeout, constants::DEFAULT_SLURMD_TIMEOUT);
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        std::env::set_var("GRIDCTLD_TREE_WIDTH", "13");
        let mut config = ControllerConfig::default();
        config.apply_env_overrides().unwrap();
        std::env::remove_var("GRIDCTLD_TREE_WIDTH");
        assert_eq!(config.tree_width, 13);
    }

    #[test]
    #[serial]
    fn malformed_env_rejected() {
        std::env::set_var("GRIDCTLD_TREE_WIDTH", "wide");
        let mut config = ControllerConfig::default();
        let result = config.apply_env_overrides();
        std::env::remove_var("GRIDCTLD_TREE_WIDTH");
        assert!(result.is_err());
    }
}
