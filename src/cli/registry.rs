// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `registry` subcommands: operator surface over the calibration
//! registry.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::Subcommand;
use vec1::Vec1;

use super::ContimgError;
use crate::config::Settings;
use crate::registry::{CalTable, CalTableKind, Registry};
use crate::store::Store;
use crate::time::parse_utc;

#[derive(Debug, Subcommand)]
pub(super) enum RegistryCommand {
    #[clap(about = "Register a calibration set. Tables are KIND=PATH pairs, \
                    e.g. K=/cal/a_kcal BP=/cal/a_bpcal.")]
    Register {
        /// The set name.
        #[clap(long)]
        set_name: String,

        /// Validity window start, YYYY-MM-DDTHH:MM:SS UTC.
        #[clap(long)]
        valid_start: String,

        /// Validity window end (exclusive), YYYY-MM-DDTHH:MM:SS UTC.
        #[clap(long)]
        valid_end: String,

        /// The tables, as KIND=PATH pairs.
        #[clap(required = true)]
        tables: Vec<String>,
    },

    #[clap(about = "Print the apply list for an epoch.")]
    Lookup {
        /// The epoch, YYYY-MM-DDTHH:MM:SS UTC.
        epoch: String,
    },

    #[clap(about = "List registered sets.")]
    List,

    #[clap(about = "Deactivate a set so lookups no longer find it.")]
    Retire {
        /// The set name.
        set_name: String,
    },
}

impl RegistryCommand {
    pub(super) fn run(&self, settings: &Settings) -> Result<(), ContimgError> {
        let store = Arc::new(Store::open(&settings.paths.state_db)?);
        let registry = Registry::new(store);
        match self {
            RegistryCommand::Register {
                set_name,
                valid_start,
                valid_end,
                tables,
            } => register(&registry, set_name, valid_start, valid_end, tables),
            RegistryCommand::Lookup { epoch } => {
                let epoch = parse_utc(epoch)
                    .map_err(|e| ContimgError::Registry(e.to_string()))?;
                let (set_name, tables) = registry.lookup(epoch)?;
                println!("set: {set_name}");
                for table in tables {
                    println!("  {:<4} {}", table.kind, table.path);
                }
                Ok(())
            }
            RegistryCommand::List => {
                let sets = registry.list_sets()?;
                if sets.is_empty() {
                    println!("No calibration sets are registered.");
                    return Ok(());
                }
                for set in sets {
                    println!(
                        "{:<40} {} table(s), {} active",
                        set.set_name, set.n_tables, set.n_active
                    );
                }
                Ok(())
            }
            RegistryCommand::Retire { set_name } => {
                let deactivated = registry.retire_set(set_name)?;
                println!("{set_name}: {deactivated} table(s) deactivated");
                Ok(())
            }
        }
    }
}

fn register(
    registry: &Registry,
    set_name: &str,
    valid_start: &str,
    valid_end: &str,
    tables: &[String],
) -> Result<(), ContimgError> {
    let valid_start =
        parse_utc(valid_start).map_err(|e| ContimgError::Registry(e.to_string()))?;
    let valid_end = parse_utc(valid_end).map_err(|e| ContimgError::Registry(e.to_string()))?;

    let mut parsed = Vec::with_capacity(tables.len());
    for spec in tables {
        let (kind, path) = spec.split_once('=').ok_or_else(|| {
            ContimgError::Registry(format!(
                "'{spec}' is not a KIND=PATH pair (e.g. K=/cal/a_kcal)"
            ))
        })?;
        let kind = CalTableKind::from_str(kind).map_err(|_| {
            ContimgError::Registry(format!(
                "'{kind}' is not a calibration table kind (K, BA, BP, GA, GP)"
            ))
        })?;
        parsed.push(CalTable {
            kind,
            path: PathBuf::from(path),
        });
    }
    let tables = Vec1::try_from_vec(parsed)
        .map_err(|_| ContimgError::Registry("No tables were given".to_string()))?;

    let paths = registry.register_set(set_name, tables, valid_start, valid_end)?;
    println!("{set_name}: registered and verified {} table(s)", paths.len());
    for path in paths {
        println!("  {path}");
    }
    Ok(())
}
