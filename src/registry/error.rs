// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Calibration set '{set_name}' declares table kind {kind} more than once")]
    DuplicateKind { set_name: String, kind: String },

    #[error("Calibration set '{set_name}' declares path '{path}' more than once")]
    DuplicatePath { set_name: String, path: String },

    #[error("Validity window start ({start_mjd} MJD) is not before its end ({end_mjd} MJD)")]
    InvalidWindow { start_mjd: f64, end_mjd: f64 },

    #[error(
        "Calibration set '{set_name}' failed post-registration verification and was rolled \
         back: {reason}"
    )]
    VerificationFailed { set_name: String, reason: String },

    #[error("No active calibration set covers epoch {epoch_mjd} MJD")]
    NoApplicableSet { epoch_mjd: f64 },

    #[error("No calibration set named '{0}' is registered")]
    UnknownSet(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
