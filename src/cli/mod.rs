// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command-line interface code. More specific options for `contimg`
//! subcommands are contained in modules.
//!
//! Only 3 things should be public in this module: `Contimg`, `Contimg::run`,
//! and `ContimgError`.

mod error;
mod ingest;
mod queue;
mod registry;
mod run;

pub use error::ContimgError;

use std::path::PathBuf;

use clap::{AppSettings, Args, Parser, Subcommand};
use log::info;

use crate::config::Settings;

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    about = "Streaming ingest and processing core for radio-interferometer continuum imaging"
)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
#[clap(propagate_version = true)]
#[clap(infer_long_args = true)]
pub struct Contimg {
    #[clap(flatten)]
    global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Path to the pipeline TOML config file.
    #[clap(short, long, default_value = "contimg.toml")]
    #[clap(global = true)]
    config: PathBuf,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    verbosity: u8,
}

#[derive(Debug, Subcommand)]
#[clap(arg_required_else_help = true)]
enum Command {
    #[clap(about = "Run the pipeline: watch for subband files, assemble \
                    groups and process them to completion.")]
    Run(run::RunArgs),

    #[clap(about = "Scan the input directory once and record every subband \
                    file in the queue, without processing anything.")]
    Ingest(ingest::IngestArgs),

    #[clap(subcommand)]
    #[clap(about = "Inspect and nudge the processing queue.")]
    Queue(queue::QueueCommand),

    #[clap(subcommand)]
    #[clap(about = "Inspect and maintain the calibration registry.")]
    Registry(registry::RegistryCommand),
}

impl Contimg {
    pub fn run(self) -> Result<(), ContimgError> {
        let GlobalArgs { config, verbosity } = self.global_opts;
        setup_logging(verbosity).expect("Failed to initialise logging.");

        let sub_command = match &self.command {
            Command::Run(_) => "run",
            Command::Ingest(_) => "ingest",
            Command::Queue(_) => "queue",
            Command::Registry(_) => "registry",
        };
        info!("contimg {} {}", sub_command, env!("CARGO_PKG_VERSION"));
        display_build_info();

        let settings = Settings::load(&config)?;

        match self.command {
            Command::Run(args) => args.run(&settings)?,
            Command::Ingest(args) => args.run(&settings)?,
            Command::Queue(args) => args.run(&settings)?,
            Command::Registry(args) => args.run(&settings)?,
        }

        info!("contimg {} complete.", sub_command);
        Ok(())
    }
}

/// Activate a logger. All log messages are put onto `stdout`. `env_logger`
/// automatically only uses colours and fancy symbols if we're on a tty (e.g.
/// a terminal); piped output will be formatted sensibly. Source code lines
/// are displayed in log messages when verbosity >= 3.
fn setup_logging(verbosity: u8) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();

    Ok(())
}

/// Write many info-level log lines of how this executable was compiled.
fn display_build_info() {
    let dirty = match GIT_DIRTY {
        Some(true) => " (dirty)",
        _ => "",
    };
    match GIT_COMMIT_HASH_SHORT {
        Some(hash) => {
            info!("Compiled on git commit hash: {hash}{dirty}");
        }
        None => info!("Compiled on git commit hash: <no git info>"),
    }
    if let Some(hr) = GIT_HEAD_REF {
        info!("            git head ref: {}", hr);
    }
    info!("            {}", BUILT_TIME_UTC);
    info!("         with compiler {}", RUSTC_VERSION);
    info!("");
}
