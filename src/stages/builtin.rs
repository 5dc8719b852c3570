// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The production stage set: convert, calibrate, image.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use hifitime::{Duration, Epoch, Unit};
use indexmap::indexmap;
use log::{debug, info};
use vec1::Vec1;

use super::{Collaborator, CommandCollaborator};
use crate::config::Settings;
use crate::orchestrator::{ArtifactSet, GraphError, Stage, StageContext, StageError, StageGraph,
                          StageNode};
use crate::registry::{CalTable, CalTableKind, Registry, RegistryError};
use crate::resource::ScratchDir;
use crate::store::{GroupRecord, Store};
use crate::time::{parse_utc, window_mid};

pub const STAGE_CONVERT: &str = "convert";
pub const STAGE_CALIBRATE: &str = "calibrate";
pub const STAGE_IMAGE: &str = "image";

/// Build the declared production graph from validated settings. Cycle and
/// name validation happens here, at startup.
pub fn production_graph(
    store: Arc<Store>,
    registry: Registry,
    settings: &Settings,
) -> Result<StageGraph, GraphError> {
    let scratch_root = settings.paths.scratch_dir.clone();
    let output_dir = settings.paths.output_dir.clone();
    StageGraph::new(vec![
        StageNode {
            name: STAGE_CONVERT.to_string(),
            deps: vec![],
            stage: Box::new(ConvertStage {
                store,
                collaborator: Box::new(CommandCollaborator::from_tool(
                    STAGE_CONVERT,
                    &settings.tools.convert,
                )),
                scratch_root: scratch_root.clone(),
                output_dir: output_dir.clone(),
            }),
        },
        StageNode {
            name: STAGE_CALIBRATE.to_string(),
            deps: vec![STAGE_CONVERT.to_string()],
            stage: Box::new(CalibrateStage {
                solver: Box::new(CommandCollaborator::from_tool(
                    "calibration solver",
                    &settings.tools.calibrate_solve,
                )),
                applier: Box::new(CommandCollaborator::from_tool(
                    "calibration applier",
                    &settings.tools.calibrate_apply,
                )),
                registry,
                window: settings.window(),
                validity_width: settings.validity_width(),
                scratch_root: scratch_root.clone(),
                output_dir: output_dir.clone(),
            }),
        },
        StageNode {
            name: STAGE_IMAGE.to_string(),
            deps: vec![STAGE_CALIBRATE.to_string()],
            stage: Box::new(ImageStage {
                collaborator: Box::new(CommandCollaborator::from_tool(
                    STAGE_IMAGE,
                    &settings.tools.image,
                )),
                scratch_root,
                output_dir,
            }),
        },
    ])
}

/// Per-invocation context additions common to all stages: where to put
/// products and a scratch directory scoped to this invocation.
fn invocation_base(scratch: &ScratchDir, output_dir: &Path) -> ArtifactSet {
    indexmap! {
        "scratch_dir".to_string() => scratch.path().display().to_string(),
        "output_dir".to_string() => output_dir.display().to_string(),
    }
}

/// Convert a group's recorded subband files into a visibility set.
///
/// Membership is read back from the store (it was declared at observation
/// time); files that have since vanished or emptied are a terminal failure,
/// never a silent skip.
pub struct ConvertStage {
    pub(super) store: Arc<Store>,
    pub(super) collaborator: Box<dyn Collaborator>,
    pub(super) scratch_root: PathBuf,
    pub(super) output_dir: PathBuf,
}

impl Stage for ConvertStage {
    fn run(&self, group: &GroupRecord, ctx: &StageContext) -> Result<ArtifactSet, StageError> {
        let members = self
            .store
            .members(&group.group_key)
            .map_err(|e| StageError::Retryable(format!("couldn't read membership: {e}")))?;
        if members.is_empty() {
            return Err(StageError::Terminal(
                "group has no recorded members".to_string(),
            ));
        }
        if group.partial {
            info!(
                "Group {}: converting partial membership ({} of {})",
                group.group_key,
                members.len(),
                group.expected_count
            );
        }

        let missing: Vec<&str> = members
            .iter()
            .filter(|m| {
                std::fs::metadata(&m.path)
                    .map(|meta| meta.len() == 0)
                    .unwrap_or(true)
            })
            .map(|m| m.path.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(StageError::Terminal(format!(
                "recorded member files are missing or empty: {}",
                missing.join(", ")
            )));
        }

        let scratch = ScratchDir::create(&self.scratch_root, &group.group_key, STAGE_CONVERT)
            .map_err(|e| StageError::Retryable(e.to_string()))?;
        let mut base = invocation_base(&scratch, &self.output_dir);
        let member_paths: Vec<&str> = members.iter().map(|m| m.path.as_str()).collect();
        base.insert(
            "member_paths".to_string(),
            serde_json::to_string(&member_paths)
                .map_err(|e| StageError::Retryable(e.to_string()))?,
        );
        base.insert("n_members".to_string(), members.len().to_string());

        self.collaborator.execute(group, &ctx.with(base))
    }
}

/// Solve or apply calibration for a group.
///
/// Calibrator groups run the solver and register the produced table set with
/// the configured validity window. Other groups look up the registry at
/// their mid-epoch and run the applier with the discovered apply list. "No
/// applicable set" is a retryable failure: a covering set may be registered
/// by a later calibrator transit, and silently proceeding uncalibrated is
/// exactly the failure mode this stage exists to prevent.
pub struct CalibrateStage {
    pub(super) solver: Box<dyn Collaborator>,
    pub(super) applier: Box<dyn Collaborator>,
    pub(super) registry: Registry,
    pub(super) window: Duration,
    pub(super) validity_width: Duration,
    pub(super) scratch_root: PathBuf,
    pub(super) output_dir: PathBuf,
}

impl CalibrateStage {
    fn mid_epoch(&self, group: &GroupRecord) -> Result<Epoch, StageError> {
        let start = parse_utc(&group.group_key).map_err(|e| {
            StageError::Terminal(format!(
                "group key '{}' is not a window timestamp: {e}",
                group.group_key
            ))
        })?;
        Ok(window_mid(start, self.window))
    }

    fn solve(&self, group: &GroupRecord, ctx: &StageContext) -> Result<ArtifactSet, StageError> {
        let mid = self.mid_epoch(group)?;
        let set_name = format!("cal_{}", group.group_key);
        let scratch = ScratchDir::create(&self.scratch_root, &group.group_key, STAGE_CALIBRATE)
            .map_err(|e| StageError::Retryable(e.to_string()))?;
        let mut base = invocation_base(&scratch, &self.output_dir);
        base.insert("cal_set".to_string(), set_name.clone());

        let produced = self.solver.execute(group, &ctx.with(base))?;

        // Artifacts named after table kinds form the set; anything else the
        // solver declared passes through untouched.
        let tables: Vec<CalTable> = produced
            .iter()
            .filter_map(|(name, path)| {
                CalTableKind::from_str(name).ok().map(|kind| CalTable {
                    kind,
                    path: PathBuf::from(path),
                })
            })
            .collect();
        let tables = Vec1::try_from_vec(tables).map_err(|_| {
            StageError::Terminal(
                "solver reported success but produced no calibration tables".to_string(),
            )
        })?;

        let half = Duration::from_f64(self.validity_width.to_seconds() / 2.0, Unit::Second);
        let paths = self
            .registry
            .register_set(&set_name, tables, mid - half, mid + half)
            .map_err(|e| match e {
                RegistryError::DuplicateKind { .. }
                | RegistryError::DuplicatePath { .. }
                | RegistryError::InvalidWindow { .. } => StageError::Terminal(e.to_string()),
                _ => StageError::Retryable(e.to_string()),
            })?;

        let mut artifacts = produced;
        artifacts.insert("cal_set".to_string(), set_name);
        artifacts.insert(
            "applylist".to_string(),
            serde_json::to_string(&paths).map_err(|e| StageError::Retryable(e.to_string()))?,
        );
        Ok(artifacts)
    }

    fn apply(&self, group: &GroupRecord, ctx: &StageContext) -> Result<ArtifactSet, StageError> {
        let mid = self.mid_epoch(group)?;
        let (set_name, tables) = self.registry.lookup(mid).map_err(|e| match e {
            RegistryError::NoApplicableSet { epoch_mjd } => StageError::Retryable(format!(
                "no calibration available for epoch {epoch_mjd:.6} MJD"
            )),
            other => StageError::Retryable(other.to_string()),
        })?;
        debug!(
            "Group {}: applying calibration set '{set_name}' ({} tables)",
            group.group_key,
            tables.len()
        );

        let scratch = ScratchDir::create(&self.scratch_root, &group.group_key, STAGE_CALIBRATE)
            .map_err(|e| StageError::Retryable(e.to_string()))?;
        let mut base = invocation_base(&scratch, &self.output_dir);
        let paths: Vec<&str> = tables.iter().map(|t| t.path.as_str()).collect();
        let applylist =
            serde_json::to_string(&paths).map_err(|e| StageError::Retryable(e.to_string()))?;
        base.insert("cal_set".to_string(), set_name.clone());
        base.insert("applylist".to_string(), applylist.clone());

        let mut artifacts = self.applier.execute(group, &ctx.with(base))?;
        artifacts.insert("cal_set".to_string(), set_name);
        artifacts.insert("applylist".to_string(), applylist);
        Ok(artifacts)
    }
}

impl Stage for CalibrateStage {
    fn run(&self, group: &GroupRecord, ctx: &StageContext) -> Result<ArtifactSet, StageError> {
        if group.has_calibrator {
            self.solve(group, ctx)
        } else {
            self.apply(group, ctx)
        }
    }
}

/// Image a calibrated visibility set.
pub struct ImageStage {
    pub(super) collaborator: Box<dyn Collaborator>,
    pub(super) scratch_root: PathBuf,
    pub(super) output_dir: PathBuf,
}

impl Stage for ImageStage {
    fn run(&self, group: &GroupRecord, ctx: &StageContext) -> Result<ArtifactSet, StageError> {
        let scratch = ScratchDir::create(&self.scratch_root, &group.group_key, STAGE_IMAGE)
            .map_err(|e| StageError::Retryable(e.to_string()))?;
        let base = invocation_base(&scratch, &self.output_dir);
        self.collaborator.execute(group, &ctx.with(base))
    }
}
