// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Typed pipeline settings.
//!
//! All configuration is read from one TOML file into [Settings], validated
//! once by [Settings::validate] at process start, and passed by reference
//! into each component's constructor. Nothing downstream re-reads or
//! re-interprets raw configuration.

use std::fs;
use std::path::{Path, PathBuf};

use hifitime::{Duration, Epoch, Unit};
use serde::Deserialize;
use thiserror::Error;

use crate::time::parse_utc;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub paths: PathSettings,
    pub ingest: IngestSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    pub cal: CalSettings,
    /// Known calibrator transits. A group whose window overlaps one of these
    /// is flagged as a calibrator group and solves rather than applies.
    #[serde(default)]
    pub calibrators: Vec<CalibratorWindow>,
    pub tools: ToolSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathSettings {
    /// Directory watched for incoming subband files.
    pub input_dir: PathBuf,
    /// Directory receiving converted visibility sets and images.
    pub output_dir: PathBuf,
    /// Root for per-stage scratch directories.
    pub scratch_dir: PathBuf,
    /// The SQLite state database.
    pub state_db: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestSettings {
    /// Number of subbands expected per complete group.
    pub expected_subbands: usize,
    /// Observation window length in minutes; file timestamps are floored onto
    /// this grid to obtain the group key.
    pub window_minutes: f64,
    /// How often the input directory is re-scanned, in seconds.
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: f64,
}

fn default_poll_interval_s() -> f64 {
    5.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetrySettings {
    /// Maximum number of retryable failures before a group is permanently
    /// failed.
    pub max_retries: u32,
    /// First retry delay in seconds; doubles on each subsequent retry.
    pub initial_delay_s: f64,
    /// Upper bound on the retry delay in seconds.
    pub max_delay_s: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_retries: 3,
            initial_delay_s: 2.0,
            max_delay_s: 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorSettings {
    /// Number of concurrent group workers.
    pub workers: usize,
    /// An in-progress group with no update for this long is presumed
    /// abandoned and swept back through the retry path.
    pub stale_after_s: f64,
    /// How long an idle worker sleeps before polling for pending groups.
    pub idle_wait_s: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            workers: 2,
            stale_after_s: 3600.0,
            idle_wait_s: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalSettings {
    /// Width of the validity window attached to newly-solved calibration
    /// sets, in hours, centred on the solving group's mid-epoch. This is an
    /// operations policy choice; the registry never derives it.
    pub validity_width_hours: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibratorWindow {
    pub name: String,
    /// Transit window start, `YYYY-MM-DDTHH:MM:SS` UTC.
    pub start: String,
    /// Transit window end (exclusive), `YYYY-MM-DDTHH:MM:SS` UTC.
    pub end: String,
}

impl CalibratorWindow {
    /// The parsed transit window. Validation has already checked both
    /// timestamps, so this only fails on an unvalidated struct.
    pub(crate) fn window(&self) -> Result<(Epoch, Epoch), ConfigError> {
        let start = parse_utc(&self.start)
            .map_err(|e| ConfigError::CalibratorTimestamp(self.name.clone(), e.to_string()))?;
        let end = parse_utc(&self.end)
            .map_err(|e| ConfigError::CalibratorTimestamp(self.name.clone(), e.to_string()))?;
        Ok((start, end))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSettings {
    /// Converts a group's subband files into a visibility set.
    pub convert: ToolCommand,
    /// Solves calibration tables from a calibrator group's visibility set.
    pub calibrate_solve: ToolCommand,
    /// Applies an ordered list of calibration tables to a visibility set.
    pub calibrate_apply: ToolCommand,
    /// Images a calibrated visibility set.
    pub image: ToolCommand,
}

/// One external collaborator invocation. `args` entries may contain
/// `{placeholders}` resolved from the stage context at execution time;
/// `outputs` maps produced artifact names to (templated) paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<ToolOutput>,
    /// Exit code the tool uses to signal permanently malformed input. Any
    /// other non-zero exit (or spawn failure) is treated as transient.
    #[serde(default = "default_terminal_exit_code")]
    pub terminal_exit_code: i32,
}

fn default_terminal_exit_code() -> i32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolOutput {
    pub name: String,
    pub path: String,
}

impl Settings {
    /// Read and validate settings from a TOML file.
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        let settings: Settings = toml::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check every field once, up front. Components constructed from a
    /// validated [Settings] never re-check these invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.expected_subbands == 0 {
            return Err(ConfigError::ExpectedSubbandsZero);
        }
        if !self.ingest.window_minutes.is_finite() || self.ingest.window_minutes <= 0.0 {
            return Err(ConfigError::BadWindow(self.ingest.window_minutes));
        }
        if self.ingest.poll_interval_s <= 0.0 {
            return Err(ConfigError::BadPollInterval(self.ingest.poll_interval_s));
        }
        if self.retry.initial_delay_s < 0.0 || self.retry.max_delay_s < self.retry.initial_delay_s {
            return Err(ConfigError::BadRetryDelays {
                initial: self.retry.initial_delay_s,
                max: self.retry.max_delay_s,
            });
        }
        if self.orchestrator.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.orchestrator.stale_after_s <= 0.0 {
            return Err(ConfigError::BadStaleThreshold(self.orchestrator.stale_after_s));
        }
        if !self.cal.validity_width_hours.is_finite() || self.cal.validity_width_hours <= 0.0 {
            return Err(ConfigError::BadValidityWidth(self.cal.validity_width_hours));
        }
        for c in &self.calibrators {
            let (start, end) = c.window()?;
            if start >= end {
                return Err(ConfigError::CalibratorWindowInverted(c.name.clone()));
            }
        }
        Ok(())
    }

    /// The observation window length.
    pub fn window(&self) -> Duration {
        Duration::from_f64(self.ingest.window_minutes, Unit::Minute)
    }

    /// The calibration validity width.
    pub fn validity_width(&self) -> Duration {
        Duration::from_f64(self.cal.validity_width_hours, Unit::Hour)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}': {1}")]
    Read(String, std::io::Error),

    #[error("Couldn't parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("ingest.expected_subbands must be at least 1")]
    ExpectedSubbandsZero,

    #[error("ingest.window_minutes must be positive and finite (got {0})")]
    BadWindow(f64),

    #[error("ingest.poll_interval_s must be positive (got {0})")]
    BadPollInterval(f64),

    #[error("retry delays must satisfy 0 <= initial ({initial}) <= max ({max})")]
    BadRetryDelays { initial: f64, max: f64 },

    #[error("orchestrator.workers must be at least 1")]
    NoWorkers,

    #[error("orchestrator.stale_after_s must be positive (got {0})")]
    BadStaleThreshold(f64),

    #[error("cal.validity_width_hours must be positive and finite (got {0})")]
    BadValidityWidth(f64),

    #[error("calibrator '{0}': {1}")]
    CalibratorTimestamp(String, String),

    #[error("calibrator '{0}': transit window start is not before its end")]
    CalibratorWindowInverted(String),
}
