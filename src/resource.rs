// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scoped acquisition of per-stage working resources.
//!
//! Every stage invocation gets its own scratch directory, released on every
//! exit path. Stages that need an artifact to outlive the invocation move it
//! out of scratch before returning, or call [ScratchDir::keep].

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use thiserror::Error;

/// A working directory that removes itself on drop, including on unwind.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    keep: bool,
}

impl ScratchDir {
    /// Create `<root>/<group_key>.<stage>/` fresh. A leftover directory from
    /// a crashed earlier attempt is removed first; its contents are by
    /// definition incomplete.
    pub fn create(root: &Path, group_key: &str, stage: &str) -> Result<ScratchDir, ResourceError> {
        let path = root.join(format!("{group_key}.{stage}"));
        if path.exists() {
            warn!("Removing leftover scratch dir {}", path.display());
            fs::remove_dir_all(&path)
                .map_err(|e| ResourceError::Remove(path.display().to_string(), e))?;
        }
        fs::create_dir_all(&path)
            .map_err(|e| ResourceError::Create(path.display().to_string(), e))?;
        Ok(ScratchDir { path, keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detach the directory from the guard so it survives the invocation.
    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        // Failing to clean scratch must never mask the stage outcome.
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if self.path.exists() {
                warn!("Couldn't remove scratch dir {}: {e}", self.path.display());
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Couldn't create scratch dir '{0}': {1}")]
    Create(String, std::io::Error),

    #[error("Couldn't remove stale scratch dir '{0}': {1}")]
    Remove(String, std::io::Error),
}
