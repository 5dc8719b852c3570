// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::store::StoreError;
use crate::time::ParseTimestampError;

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("'{0}' is not a recognised subband filename")]
    UnrecognisedFilename(String),

    #[error("'{file}': {source}")]
    BadTimestamp {
        file: String,
        source: ParseTimestampError,
    },

    #[error("'{file}': subband index {idx} is outside the expected set of {expected}")]
    IndexOutOfRange {
        file: String,
        idx: usize,
        expected: usize,
    },

    #[error("IO error reading '{file}': {source}")]
    Io {
        file: String,
        source: std::io::Error,
    },

    #[error("Bad glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}
