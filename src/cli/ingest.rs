// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `ingest` subcommand: record input files without processing them.

use std::sync::Arc;

use clap::Args;
use log::info;

use super::ContimgError;
use crate::assembler::Assembler;
use crate::config::Settings;
use crate::store::Store;

#[derive(Debug, Args)]
pub(super) struct IngestArgs {
    /// Scan this directory instead of the configured input directory.
    #[clap(long)]
    input_dir: Option<std::path::PathBuf>,
}

impl IngestArgs {
    pub(super) fn run(&self, settings: &Settings) -> Result<(), ContimgError> {
        let store = Arc::new(Store::open(&settings.paths.state_db)?);
        let assembler = Assembler::new(store, settings)?;
        let dir = self
            .input_dir
            .as_deref()
            .unwrap_or(&settings.paths.input_dir);

        let stats = assembler.scan_directory(dir)?;
        info!(
            "Ingest of {} complete: {} new, {} already recorded, {} anomalies, {} rejected; \
             {} group(s) became complete",
            dir.display(),
            stats.recorded,
            stats.duplicates,
            stats.anomalies,
            stats.rejected,
            stats.completed_groups
        );
        Ok(())
    }
}
