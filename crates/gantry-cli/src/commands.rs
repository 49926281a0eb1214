//! Command definitions.

use clap::{Subcommand, ValueEnum};
use gantry_core::definition::EventKind;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a pipeline and report every node's outcome.
    Run {
        /// Pipeline definition file.
        #[arg(default_value = "gantry.yaml")]
        file: PathBuf,

        /// Branch the run is attributed to, for trigger filters.
        #[arg(long, default_value = "main")]
        branch: String,

        /// Event kind the run is attributed to.
        #[arg(long, value_enum, default_value_t = EventArg::Manual)]
        event: EventArg,

        /// Report format.
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,

        /// Directory steps execute in.
        #[arg(long, default_value = ".")]
        workspace: PathBuf,

        /// Extra variables, KEY=VALUE, repeatable. Override pipeline variables.
        #[arg(long = "var", value_parser = parse_key_val)]
        vars: Vec<(String, String)>,

        /// Enable the filesystem cache store rooted at this directory.
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Parse a pipeline file and check its structure without running it.
    Validate {
        #[arg(default_value = "gantry.yaml")]
        file: PathBuf,
    },

    /// Show the execution plan: nodes grouped by dependency tier.
    Plan {
        #[arg(default_value = "gantry.yaml")]
        file: PathBuf,

        #[arg(long, default_value = "main")]
        branch: String,

        #[arg(long, value_enum, default_value_t = EventArg::Manual)]
        event: EventArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum EventArg {
    Push,
    PullRequest,
    Tag,
    Schedule,
    Manual,
}

impl From<EventArg> for EventKind {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::Push => EventKind::Push,
            EventArg::PullRequest => EventKind::PullRequest,
            EventArg::Tag => EventKind::Tag,
            EventArg::Schedule => EventKind::Schedule,
            EventArg::Manual => EventKind::Manual,
        }
    }
}

#[derive(Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}
