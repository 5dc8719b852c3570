// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `queue` subcommands: operator surface over the processing queue.

use std::sync::Arc;

use clap::Subcommand;

use super::ContimgError;
use crate::assembler::Assembler;
use crate::config::Settings;
use crate::store::{GroupState, Store};

#[derive(Debug, Subcommand)]
pub(super) enum QueueCommand {
    #[clap(about = "Summarise the queue by state.")]
    Status,

    #[clap(about = "Show one group: state, members, last error, timings.")]
    Show {
        /// The group key (window start timestamp).
        group_key: String,
    },

    #[clap(about = "Queue a still-collecting group with partial membership.")]
    ForceComplete {
        /// The group key (window start timestamp).
        group_key: String,
    },
}

impl QueueCommand {
    pub(super) fn run(&self, settings: &Settings) -> Result<(), ContimgError> {
        let store = Arc::new(Store::open(&settings.paths.state_db)?);
        match self {
            QueueCommand::Status => status(&store, settings),
            QueueCommand::Show { group_key } => {
                let assembler = Assembler::new(Arc::clone(&store), settings)?;
                show(&store, &assembler, group_key)
            }
            QueueCommand::ForceComplete { group_key } => {
                store.force_complete(group_key)?;
                println!("{group_key}: queued with partial membership");
                Ok(())
            }
        }
    }
}

fn status(store: &Store, settings: &Settings) -> Result<(), ContimgError> {
    let counts = store.counts_by_state()?;
    if counts.is_empty() {
        println!("The queue is empty.");
        return Ok(());
    }
    for (state, n) in &counts {
        println!("{state:<12} {n}");
    }
    let retryable = store.count_retry_candidates(settings.retry.max_retries)?;
    if retryable > 0 {
        println!("({retryable} failed group(s) still within the retry budget)");
    }
    Ok(())
}

fn show(store: &Store, assembler: &Assembler, group_key: &str) -> Result<(), ContimgError> {
    let group = store
        .group(group_key)?
        .ok_or_else(|| ContimgError::Queue(format!("Group '{group_key}' is not in the queue")))?;

    println!("group:       {}", group.group_key);
    println!("state:       {}", group.state);
    if group.partial {
        println!("             (force-completed with partial membership)");
    }
    println!(
        "members:     {} of {}",
        store.member_count(group_key)?,
        group.expected_count
    );
    if group.has_calibrator {
        println!("calibrators: {}", group.calibrators.join(", "));
    }
    println!("retries:     {}", group.retry_count);
    if group.terminal {
        println!("             (terminally failed; operator attention required)");
    }
    if let Some(error) = &group.error {
        println!("last error:  {error}");
    }

    let invalid = assembler.validate_members(group_key)?;
    for member in store.members(group_key)? {
        let note = if invalid.contains(&member.path) {
            "  [MISSING]"
        } else {
            ""
        };
        println!(
            "  [{:02}] {} ({} B){note}",
            member.member_idx, member.path, member.size_bytes
        );
    }

    if matches!(group.state, GroupState::Completed | GroupState::Failed) {
        if let Some(sample) = store.perf_sample(group_key)? {
            println!("timing:");
            for (stage, seconds) in &sample.stage_seconds {
                println!("  {stage:<12} {seconds:8.2} s");
            }
            println!("  {:<12} {:8.2} s", "total", sample.total_seconds);
        }
    }
    Ok(())
}
