// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Group assembly: map observed subband files onto time-windowed groups and
//! detect completion.
//!
//! Membership is declared here, at observation time, and persisted in the
//! store; nothing downstream re-derives it by globbing the input directory.
//! Re-observing a file (e.g. after a restart, or when the scanner sees the
//! same directory twice) is a no-op.

mod error;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use hifitime::{Duration, Epoch};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;

pub use error::AssemblerError;

use crate::config::Settings;
use crate::store::{MemberObservation, Store, StoreError};
use crate::time::{format_utc, parse_utc, quantise_to_window};

lazy_static! {
    // Subband files must keep their original names; the timestamp and index
    // in the name are the only metadata the assembler consumes.
    static ref RE_SUBBAND: Regex = Regex::new(
        r"(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})_sb(?P<idx>\d{2})\.hdf5$"
    )
    .unwrap();
}

/// The glob used to bootstrap and scan the input directory.
const SUBBAND_GLOB: &str = "*_sb[0-9][0-9].hdf5";

/// What happened to one observed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// A new member was recorded. `completed` is set when this member filled
    /// the group.
    Recorded { group_key: String, completed: bool },
    /// The same (group, index, path) was already recorded.
    Duplicate { group_key: String },
    /// The file clashed with existing membership and was ignored.
    Anomaly { group_key: String },
}

/// Counters for one directory scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub recorded: usize,
    pub duplicates: usize,
    pub anomalies: usize,
    pub rejected: usize,
    pub completed_groups: usize,
}

pub struct Assembler {
    store: Arc<Store>,
    expected_count: usize,
    window: Duration,
    /// Calibrator transits from configuration, in transit order.
    calibrators: Vec<(String, Epoch, Epoch)>,
}

impl Assembler {
    /// Build from validated settings. Calibrator windows were checked by
    /// [Settings::validate], so a parse failure here is a programming error
    /// and surfaces as such.
    pub fn new(store: Arc<Store>, settings: &Settings) -> Result<Assembler, AssemblerError> {
        let mut calibrators = Vec::with_capacity(settings.calibrators.len());
        for c in &settings.calibrators {
            let (start, end) = c.window()?;
            calibrators.push((c.name.clone(), start, end));
        }
        calibrators.sort_by(|a, b| {
            a.1.as_gpst_seconds().total_cmp(&b.1.as_gpst_seconds())
        });
        Ok(Assembler {
            store,
            expected_count: settings.ingest.expected_subbands,
            window: settings.window(),
            calibrators,
        })
    }

    /// Record one observed file. Unparseable names and timestamps are
    /// rejected without creating any state.
    pub fn observe(&self, path: &Path) -> Result<Observation, AssemblerError> {
        let name = path.display().to_string();
        let caps = RE_SUBBAND
            .captures(&name)
            .ok_or_else(|| AssemblerError::UnrecognisedFilename(name.clone()))?;
        let timestamp = parse_utc(&caps["ts"]).map_err(|source| AssemblerError::BadTimestamp {
            file: name.clone(),
            source,
        })?;
        // The regex guarantees two digits.
        let idx: usize = caps["idx"].parse().unwrap();
        if idx >= self.expected_count {
            return Err(AssemblerError::IndexOutOfRange {
                file: name,
                idx,
                expected: self.expected_count,
            });
        }
        let size_bytes = fs::metadata(path)
            .map_err(|source| AssemblerError::Io {
                file: name.clone(),
                source,
            })?
            .len();

        let window_start = quantise_to_window(timestamp, self.window);
        let group_key = format_utc(window_start);

        let (has_calibrator, calibrators) = self.calibrators_in_window(window_start);
        if self
            .store
            .ensure_group(&group_key, self.expected_count, has_calibrator, &calibrators)?
        {
            info!(
                "New group {group_key} (expecting {} subbands{})",
                self.expected_count,
                if has_calibrator {
                    format!(", calibrators: {}", calibrators.join(", "))
                } else {
                    String::new()
                }
            );
        }

        match self
            .store
            .insert_member(&group_key, idx, &name, size_bytes)?
        {
            MemberObservation::Recorded => {
                debug!("Recorded {name} as {group_key}[{idx}]");
                let completed = self.store.mark_pending_if_complete(&group_key)?;
                if completed {
                    info!("Group {group_key} is complete; queued for processing");
                }
                Ok(Observation::Recorded {
                    group_key,
                    completed,
                })
            }
            MemberObservation::AlreadyRecorded => Ok(Observation::Duplicate { group_key }),
            MemberObservation::IndexOccupied { existing_path } => {
                warn!(
                    "Ignoring {name}: index {idx} of group {group_key} is already held by \
                     {existing_path}"
                );
                Ok(Observation::Anomaly { group_key })
            }
            MemberObservation::PathElsewhere {
                existing_group,
                existing_idx,
            } => {
                warn!(
                    "Ignoring {name}: already recorded as {existing_group}[{existing_idx}]"
                );
                Ok(Observation::Anomaly { group_key })
            }
        }
    }

    /// Observe every subband file currently in `dir`. Used once at startup
    /// (restart recovery) and by the polling scanner thereafter. Files that
    /// fail input validation are counted and logged, never fatal to the scan.
    pub fn scan_directory(&self, dir: &Path) -> Result<ScanStats, AssemblerError> {
        let pattern = dir.join(SUBBAND_GLOB);
        let pattern = pattern.to_string_lossy();
        let mut stats = ScanStats::default();
        for entry in glob::glob(&pattern)? {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping unreadable directory entry: {e}");
                    stats.rejected += 1;
                    continue;
                }
            };
            match self.observe(&path) {
                Ok(Observation::Recorded { completed, .. }) => {
                    stats.recorded += 1;
                    if completed {
                        stats.completed_groups += 1;
                    }
                }
                Ok(Observation::Duplicate { .. }) => stats.duplicates += 1,
                Ok(Observation::Anomaly { .. }) => stats.anomalies += 1,
                Err(AssemblerError::Store(e)) => return Err(AssemblerError::Store(e)),
                Err(e) => {
                    warn!("Rejected input file: {e}");
                    stats.rejected += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Queue a group with partial membership, driven by an external timeout
    /// decision that partial data is acceptable.
    pub fn force_complete(&self, group_key: &str) -> Result<(), StoreError> {
        let result = self.store.force_complete(group_key);
        if result.is_ok() {
            info!("Group {group_key} force-completed with partial membership");
        }
        result
    }

    /// Re-check that a group's recorded members still resolve on disk.
    /// Returns the missing/empty paths; an empty result means the group can
    /// be converted.
    pub fn validate_members(&self, group_key: &str) -> Result<Vec<String>, StoreError> {
        let mut invalid = Vec::new();
        for member in self.store.members(group_key)? {
            match fs::metadata(&member.path) {
                Ok(meta) if meta.len() > 0 => (),
                Ok(_) => invalid.push(member.path),
                Err(_) => invalid.push(member.path),
            }
        }
        Ok(invalid)
    }

    /// Calibrator transits overlapping the window starting at `window_start`.
    fn calibrators_in_window(&self, window_start: Epoch) -> (bool, Vec<String>) {
        let window_end = window_start + self.window;
        let names: Vec<String> = self
            .calibrators
            .iter()
            .filter(|(_, start, end)| *start < window_end && window_start < *end)
            .map(|(name, _, _)| name.clone())
            .collect();
        (!names.is_empty(), names)
    }
}
