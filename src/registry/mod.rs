// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The calibration registry: which calibration tables are valid for a given
//! observation epoch.
//!
//! Tables are registered as named sets sharing one validity window and a
//! fixed application order (delays before bandpass before gains). A
//! registration is only visible once a verification pass has confirmed every
//! table resolves on disk and is discoverable through the epoch lookup; a
//! verification miss rolls the whole set back. Lookups never fall back to
//! "any set": no covering window is a distinct, reported condition.

mod error;
#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hifitime::Epoch;
use itertools::Itertools;
use log::{info, warn};
use strum_macros::{Display, EnumString};
use vec1::Vec1;

pub use error::RegistryError;

use crate::store::{CalSetSummary, CalTableRecord, NewCalTable, Store};
use crate::time::epoch_to_mjd;

/// Calibration table kinds, declared in application order: delays, then
/// bandpass amplitude/phase, then gain amplitude/phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum CalTableKind {
    /// Antenna delays.
    K,
    /// Bandpass amplitude.
    BA,
    /// Bandpass phase.
    BP,
    /// Gain amplitude.
    GA,
    /// Gain phase.
    GP,
}

impl CalTableKind {
    /// Position in the apply chain. Gaps leave room for site-specific extras
    /// without renumbering.
    pub fn order_index(self) -> i64 {
        match self {
            CalTableKind::K => 10,
            CalTableKind::BA => 20,
            CalTableKind::BP => 30,
            CalTableKind::GA => 40,
            CalTableKind::GP => 50,
        }
    }
}

/// One table offered for registration.
#[derive(Debug, Clone)]
pub struct CalTable {
    pub kind: CalTableKind,
    pub path: PathBuf,
}

#[derive(Clone)]
pub struct Registry {
    store: Arc<Store>,
}

impl Registry {
    pub fn new(store: Arc<Store>) -> Registry {
        Registry { store }
    }

    /// Register a named set of calibration tables valid over
    /// `[valid_start, valid_end)`, then verify the registration before
    /// reporting success.
    ///
    /// The write is one store transaction; the verification necessarily is
    /// not (it checks the filesystem), so a failed verification deactivates
    /// everything just written. From the caller's perspective the pair is one
    /// logical transaction: on error, zero tables of this set are active.
    ///
    /// Returns the registered table paths in application order.
    pub fn register_set(
        &self,
        set_name: &str,
        tables: Vec1<CalTable>,
        valid_start: Epoch,
        valid_end: Epoch,
    ) -> Result<Vec<String>, RegistryError> {
        let start_mjd = epoch_to_mjd(valid_start);
        let end_mjd = epoch_to_mjd(valid_end);
        if start_mjd >= end_mjd {
            return Err(RegistryError::InvalidWindow {
                start_mjd,
                end_mjd,
            });
        }
        if let Some(kind) = tables.iter().map(|t| t.kind).duplicates().next() {
            return Err(RegistryError::DuplicateKind {
                set_name: set_name.to_string(),
                kind: kind.to_string(),
            });
        }
        if let Some(path) = tables.iter().map(|t| &t.path).duplicates().next() {
            return Err(RegistryError::DuplicatePath {
                set_name: set_name.to_string(),
                path: path.display().to_string(),
            });
        }

        let rows: Vec<NewCalTable> = tables
            .iter()
            .sorted_by_key(|t| t.kind.order_index())
            .map(|t| NewCalTable {
                path: t.path.display().to_string(),
                kind: t.kind.to_string(),
                order_index: t.kind.order_index(),
            })
            .collect();
        self.store
            .insert_cal_set(set_name, &rows, start_mjd, end_mjd)?;

        // Verification pass: re-read what was written and confirm it is
        // usable. Any miss rolls the whole set back.
        let probe_mjd = (start_mjd + end_mjd) / 2.0;
        if let Err(reason) = self.verify_set(set_name, &rows, probe_mjd) {
            let deactivated = self.store.deactivate_cal_set(set_name)?;
            warn!(
                "Rolled back calibration set '{set_name}' ({deactivated} tables deactivated): \
                 {reason}"
            );
            return Err(RegistryError::VerificationFailed {
                set_name: set_name.to_string(),
                reason,
            });
        }

        info!(
            "Registered calibration set '{set_name}': {} tables valid over \
             [{start_mjd:.6}, {end_mjd:.6}) MJD",
            rows.len()
        );
        Ok(rows.into_iter().map(|r| r.path).collect())
    }

    /// Confirm a just-registered set re-reads correctly: every row is
    /// present and active, every path resolves to a non-empty file or
    /// directory, and the probe epoch is discoverable inside the window.
    fn verify_set(
        &self,
        set_name: &str,
        expected: &[NewCalTable],
        probe_mjd: f64,
    ) -> Result<(), String> {
        let discovered = self
            .store
            .cal_set(set_name)
            .map_err(|e| format!("re-read failed: {e}"))?;
        if discovered.len() != expected.len() {
            return Err(format!(
                "expected {} active tables, found {}",
                expected.len(),
                discovered.len()
            ));
        }
        for (want, got) in expected.iter().zip(discovered.iter()) {
            if want.path != got.path {
                return Err(format!(
                    "apply order mismatch: expected '{}', found '{}'",
                    want.path, got.path
                ));
            }
            if !(got.valid_start_mjd..got.valid_end_mjd).contains(&probe_mjd) {
                return Err(format!(
                    "probe epoch {probe_mjd} MJD is outside the stored window of '{}'",
                    got.path
                ));
            }
            resolvable(Path::new(&got.path))?;
        }
        Ok(())
    }

    /// The ordered apply list for an epoch: the most recently created active
    /// set whose `[start, end)` window contains it. Callers must treat
    /// [RegistryError::NoApplicableSet] as a real outcome, never a default.
    pub fn lookup(&self, epoch: Epoch) -> Result<(String, Vec<CalTableRecord>), RegistryError> {
        let epoch_mjd = epoch_to_mjd(epoch);
        self.store
            .active_applylist(epoch_mjd)?
            .ok_or(RegistryError::NoApplicableSet { epoch_mjd })
    }

    /// Deactivate a set explicitly (e.g. found bad after the fact). Rows are
    /// kept for provenance.
    pub fn retire_set(&self, set_name: &str) -> Result<usize, RegistryError> {
        let deactivated = self.store.deactivate_cal_set(set_name)?;
        if deactivated == 0 && self.store.cal_set(set_name)?.is_empty() {
            let known = self
                .store
                .list_cal_sets()?
                .into_iter()
                .any(|s| s.set_name == set_name);
            if !known {
                return Err(RegistryError::UnknownSet(set_name.to_string()));
            }
        }
        info!("Retired calibration set '{set_name}' ({deactivated} tables)");
        Ok(deactivated)
    }

    pub fn list_sets(&self) -> Result<Vec<CalSetSummary>, RegistryError> {
        Ok(self.store.list_cal_sets()?)
    }
}

/// A calibration table resolves if it exists and is non-empty. CASA-style
/// tables are directories; single-file formats also occur.
fn resolvable(path: &Path) -> Result<(), String> {
    let meta = fs::metadata(path)
        .map_err(|e| format!("table '{}' is not readable: {e}", path.display()))?;
    if meta.is_dir() {
        let mut entries = fs::read_dir(path)
            .map_err(|e| format!("table '{}' is not listable: {e}", path.display()))?;
        if entries.next().is_none() {
            return Err(format!("table '{}' is an empty directory", path.display()));
        }
    } else if meta.len() == 0 {
        return Err(format!("table '{}' is empty", path.display()));
    }
    Ok(())
}
