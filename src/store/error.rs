// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Group '{0}' is not in the queue")]
    GroupNotFound(String),

    #[error("Group '{group}': refusing transition to {to}; group is not {expected}")]
    InvalidTransition {
        group: String,
        expected: &'static str,
        to: &'static str,
    },

    #[error("Store mutex poisoned; a worker panicked while holding the store")]
    Poisoned,

    #[error("Couldn't create state directory '{0}': {1}")]
    CreateDir(String, std::io::Error),

    #[error("State database schema version {found} is newer than this binary supports ({supported})")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Couldn't (de)serialise stored JSON: {0}")]
    Json(#[from] serde_json::Error),
}
