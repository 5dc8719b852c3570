// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all contimg-related errors. This should be the *only*
//! error enum that is publicly visible.

use thiserror::Error;

use crate::assembler::AssemblerError;
use crate::config::ConfigError;
use crate::orchestrator::{GraphError, OrchestratorError};
use crate::registry::RegistryError;
use crate::store::StoreError;

/// The *only* publicly visible error from contimg.
#[derive(Error, Debug)]
pub enum ContimgError {
    /// An error validating or reading configuration.
    #[error("{0}\n\nCheck the pipeline TOML config file.")]
    Config(String),

    /// An error while ingesting input files.
    #[error("{0}")]
    Ingest(String),

    /// An error from the state database.
    #[error("{0}")]
    Queue(String),

    /// An error from the calibration registry.
    #[error("{0}")]
    Registry(String),

    /// A stage-graph declaration error; fatal at startup.
    #[error("{0}")]
    StageGraph(String),

    /// A generic error that can't be clarified further, e.g. IO errors.
    #[error("{0}")]
    Generic(String),
}

// When changing the error propagation below, ensure `Self::from(e)` uses the
// correct `e`!

impl From<ConfigError> for ContimgError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<StoreError> for ContimgError {
    fn from(e: StoreError) -> Self {
        Self::Queue(e.to_string())
    }
}

impl From<AssemblerError> for ContimgError {
    fn from(e: AssemblerError) -> Self {
        let s = e.to_string();
        match e {
            AssemblerError::Store(_) => Self::Queue(s),
            AssemblerError::Config(_) => Self::Config(s),
            _ => Self::Ingest(s),
        }
    }
}

impl From<RegistryError> for ContimgError {
    fn from(e: RegistryError) -> Self {
        let s = e.to_string();
        match e {
            RegistryError::Store(_) => Self::Queue(s),
            _ => Self::Registry(s),
        }
    }
}

impl From<OrchestratorError> for ContimgError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Store(e) => Self::from(e),
        }
    }
}

impl From<GraphError> for ContimgError {
    fn from(e: GraphError) -> Self {
        Self::StageGraph(e.to_string())
    }
}

impl From<std::io::Error> for ContimgError {
    fn from(e: std::io::Error) -> Self {
        Self::Generic(e.to_string())
    }
}
