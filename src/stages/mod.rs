// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stage implementations and the external-collaborator contract.
//!
//! The numerical work (conversion, calibration solving, imaging) happens in
//! external tools. A [Collaborator] is the whole of the pipeline's view of
//! such a tool: it gets a group and a context, and either returns an
//! artifact set or fails retryably/terminally. Nothing here interprets
//! tool-specific output beyond that classification.

mod builtin;

use std::path::PathBuf;
use std::process::Command;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

pub use builtin::{production_graph, CalibrateStage, ConvertStage, ImageStage};

use crate::config::ToolCommand;
use crate::orchestrator::{ArtifactSet, StageContext, StageError};
use crate::store::GroupRecord;

lazy_static! {
    static ref RE_PLACEHOLDER: Regex = Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap();
}

/// An opaque external tool invoked by a stage.
pub trait Collaborator: Send + Sync {
    fn execute(&self, group: &GroupRecord, ctx: &StageContext)
        -> Result<ArtifactSet, StageError>;
}

/// Runs a configured command line, classifying its exit status.
///
/// Argument and output templates may reference context artifacts as
/// `{name}`; an unresolvable placeholder is a terminal failure (the
/// configuration promises an artifact the pipeline never produced). After a
/// successful exit, every declared output must exist on disk; a tool that
/// "succeeds" without producing its outputs has failed terminally.
pub struct CommandCollaborator {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    outputs: Vec<(String, String)>,
    terminal_exit_code: i32,
}

impl CommandCollaborator {
    pub fn from_tool(name: &str, tool: &ToolCommand) -> CommandCollaborator {
        CommandCollaborator {
            name: name.to_string(),
            program: tool.program.clone(),
            args: tool.args.clone(),
            outputs: tool
                .outputs
                .iter()
                .map(|o| (o.name.clone(), o.path.clone()))
                .collect(),
            terminal_exit_code: tool.terminal_exit_code,
        }
    }
}

impl Collaborator for CommandCollaborator {
    fn execute(
        &self,
        group: &GroupRecord,
        ctx: &StageContext,
    ) -> Result<ArtifactSet, StageError> {
        let args = self
            .args
            .iter()
            .map(|a| resolve_template(a, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            "Group {}: running {} {}",
            group.group_key,
            self.program.display(),
            args.join(" ")
        );

        let output = Command::new(&self.program).args(&args).output().map_err(|e| {
            StageError::Retryable(format!(
                "couldn't launch {} '{}': {e}",
                self.name,
                self.program.display()
            ))
        })?;

        if !output.status.success() {
            let detail = stderr_tail(&output.stderr);
            let message = format!(
                "{} '{}' exited with {}{detail}",
                self.name,
                self.program.display(),
                output
                    .status
                    .code()
                    .map(|c| format!("code {c}"))
                    .unwrap_or_else(|| "a signal".to_string()),
            );
            return if output.status.code() == Some(self.terminal_exit_code) {
                Err(StageError::Terminal(message))
            } else {
                Err(StageError::Retryable(message))
            };
        }

        let mut artifacts = ArtifactSet::new();
        for (name, template) in &self.outputs {
            let path = resolve_template(template, ctx)?;
            if !std::path::Path::new(&path).exists() {
                return Err(StageError::Terminal(format!(
                    "{} '{}' reported success but output '{name}' is missing at '{path}'",
                    self.name,
                    self.program.display()
                )));
            }
            artifacts.insert(name.clone(), path);
        }
        Ok(artifacts)
    }
}

/// Substitute `{name}` placeholders from the context.
fn resolve_template(template: &str, ctx: &StageContext) -> Result<String, StageError> {
    let mut result = String::with_capacity(template.len());
    let mut last = 0;
    for caps in RE_PLACEHOLDER.captures_iter(template) {
        // The full match always exists.
        let m = caps.get(0).unwrap();
        let name = &caps[1];
        result.push_str(&template[last..m.start()]);
        match ctx.get(name) {
            Some(value) => result.push_str(value),
            None => {
                return Err(StageError::Terminal(format!(
                    "unresolved placeholder '{{{name}}}' in '{template}'"
                )))
            }
        }
        last = m.end();
    }
    result.push_str(&template[last..]);
    Ok(result)
}

/// The last chunk of a tool's stderr, enough to diagnose without dumping
/// whole logs into the queue.
fn stderr_tail(stderr: &[u8]) -> String {
    if stderr.is_empty() {
        return String::new();
    }
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return String::new();
    }
    let tail: String = if trimmed.len() > 400 {
        let cut = trimmed.len() - 400;
        // Don't split a UTF-8 codepoint.
        let cut = (cut..trimmed.len())
            .find(|&i| trimmed.is_char_boundary(i))
            .unwrap_or(cut);
        format!("...{}", &trimmed[cut..])
    } else {
        trimmed.to_string()
    };
    format!(": {tail}")
}
