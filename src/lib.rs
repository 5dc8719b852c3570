// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Streaming ingest and processing core for radio-interferometer continuum
imaging.

Subband files arriving from the correlator are assembled into time-windowed
groups, persisted in a SQLite-backed queue, and driven through conversion,
calibration and imaging by a stage orchestrator. Calibration solutions are
tracked as time-windowed sets in a registry so nearby observations can reuse
them.
 */

pub mod assembler;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod resource;
pub mod retry;
pub mod stages;
pub mod store;
pub mod time;

// Re-exports.
pub use cli::ContimgError;
pub use config::Settings;
pub use store::{GroupState, Store};
