//! Runtime configuration loading.
//!
//! The expected YAML structure is:
//! ```yaml
//! runner:
//!   battery_default_soc: 0
//! rpc:
//!   max_in_flight: 4
//!   max_payload: 256
//! logger:
//!   block_size: 512
//!   block_overhead: 0
//!   full_block_write: false
//! schedules:
//!   - task_id: 1
//!     validity: always
//!     periodicity: { type: fixed, period_s: 10 }
//!     timeout_s: 5
//!     battery_start: { lower: 20 }
//! ```
//!
//! Every section is optional. Schedules are validated at load time so an
//! invalid table never reaches the task runner.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::data_logger::MIN_TAILROOM;
use crate::rpc::interface::DEFAULT_MAX_PAYLOAD;
use crate::task::schedule::validate_at;
use crate::task::{Periodicity, TaskSchedule};

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Battery state of charge assumed until the first measurement.
    pub battery_default_soc: u8,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            battery_default_soc: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// Client commands that may await a response at once.
    pub max_in_flight: usize,
    /// Payload limit of the loopback interfaces.
    pub max_payload: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggerSettings {
    pub block_size: usize,
    pub block_overhead: usize,
    pub full_block_write: bool,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            block_size: 512,
            block_overhead: 0,
            full_block_write: false,
        }
    }
}

// ── RuntimeConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub runner: RunnerSettings,
    pub rpc: RpcSettings,
    pub logger: LoggerSettings,
    pub schedules: Vec<TaskSchedule>,
}

impl RuntimeConfig {
    /// Parse and validate `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, the YAML is structurally
    /// invalid, or any setting or schedule fails validation.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading runtime configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let config: RuntimeConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration: {}", path.display()))?;

        if config.schedules.is_empty() {
            warn!("No schedules in configuration file, no task will run");
        }
        for (idx, schedule) in config.schedules.iter().enumerate() {
            debug!(
                "  Schedule {}: task {} | {:?} | {:?} | timeout {}s",
                idx, schedule.task_id, schedule.validity, schedule.periodicity, schedule.timeout_s,
            );
        }
        info!(
            "Successfully loaded {} schedule(s), RPC pool {}, block size {}",
            config.schedules.len(),
            config.rpc.max_in_flight,
            config.logger.block_size,
        );
        Ok(config)
    }

    /// Check settings and every schedule.
    pub fn validate(&self) -> Result<()> {
        if self.runner.battery_default_soc > 100 {
            bail!(
                "runner.battery_default_soc {} outside 0..=100",
                self.runner.battery_default_soc
            );
        }
        if self.rpc.max_in_flight == 0 {
            bail!("rpc.max_in_flight must be at least 1");
        }
        if self.logger.block_size <= self.logger.block_overhead + MIN_TAILROOM {
            bail!(
                "logger.block_size {} leaves no room after {} bytes of overhead",
                self.logger.block_size,
                self.logger.block_overhead
            );
        }
        for (idx, schedule) in self.schedules.iter().enumerate() {
            validate_at(schedule, Some(idx)).with_context(|| format!("schedule {}", idx))?;
            if let Periodicity::After { schedule_idx, .. } = schedule.periodicity {
                if schedule_idx >= self.schedules.len() {
                    bail!(
                        "schedule {}: runs after schedule {}, which does not exist",
                        idx,
                        schedule_idx
                    );
                }
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_logger::LoggerMask;
    use crate::task::{BatteryRange, Validity};
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper: write a YAML string to a temp file and return it.
    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn load_full_config() {
        let yaml = r#"
runner:
  battery_default_soc: 50
rpc:
  max_in_flight: 2
logger:
  block_size: 256
  block_overhead: 4
  full_block_write: true
schedules:
  - task_id: 1
    validity: always
    periodicity: { type: fixed, period_s: 10 }
    timeout_s: 5
    battery_start: { lower: 20 }
  - task_id: 2
    validity: active
    periodicity: { type: after, schedule_idx: 0, duration_s: 3 }
    task_logging:
      - { loggers: 5, tdf_mask: 1 }
"#;
        let f = yaml_tempfile(yaml);
        let cfg = RuntimeConfig::load_from_file(f.path()).unwrap();

        assert_eq!(cfg.runner.battery_default_soc, 50);
        assert_eq!(cfg.rpc.max_in_flight, 2);
        assert_eq!(cfg.rpc.max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(cfg.logger.block_size, 256);
        assert!(cfg.logger.full_block_write);
        assert_eq!(cfg.schedules.len(), 2);

        let s0 = &cfg.schedules[0];
        assert_eq!(s0.periodicity, Periodicity::Fixed { period_s: 10 });
        assert_eq!(s0.battery_start, BatteryRange { lower: 20, upper: 0 });
        assert_eq!(s0.timeout_s, 5);

        let s1 = &cfg.schedules[1];
        assert_eq!(s1.validity, Validity::Active);
        assert_eq!(
            s1.task_logging[0].loggers,
            LoggerMask::FLASH | LoggerMask::SERIAL
        );
    }

    #[test]
    fn empty_file_uses_defaults() {
        let f = yaml_tempfile("{}\n");
        let cfg = RuntimeConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.rpc.max_in_flight, 4);
        assert_eq!(cfg.logger.block_size, 512);
    }

    #[test]
    fn invalid_schedule_reports_index() {
        let yaml = r#"
schedules:
  - task_id: 1
    periodicity: { type: lockout, lockout_s: 10 }
  - task_id: 2
    periodicity: { type: fixed, period_s: 0 }
"#;
        let f = yaml_tempfile(yaml);
        let err = RuntimeConfig::load_from_file(f.path()).unwrap_err();
        let chain = format!("{:#}", err);
        assert!(chain.contains("schedule 1"), "{}", chain);
    }

    #[test]
    fn dangling_after_chain_rejected() {
        let yaml = r#"
schedules:
  - task_id: 1
    periodicity: { type: after, schedule_idx: 4, duration_s: 0 }
"#;
        let f = yaml_tempfile(yaml);
        let err = RuntimeConfig::load_from_file(f.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("does not exist"));
    }

    #[test]
    fn bad_settings_rejected() {
        let cases = [
            "runner: { battery_default_soc: 101 }\n",
            "rpc: { max_in_flight: 0 }\n",
            "logger: { block_size: 8, block_overhead: 4 }\n",
        ];
        for yaml in cases {
            let f = yaml_tempfile(yaml);
            assert!(RuntimeConfig::load_from_file(f.path()).is_err(), "{}", yaml);
        }
    }

    #[test]
    fn missing_file_returns_error() {
        let result = RuntimeConfig::load_from_file(Path::new("/nonexistent/path/config.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_yaml_returns_error() {
        let f = yaml_tempfile("this is: not: valid: yaml: content:::");
        assert!(RuntimeConfig::load_from_file(f.path()).is_err());
    }
}
