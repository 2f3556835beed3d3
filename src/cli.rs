//! CLI struct definitions for the anchorage command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "anchorage",
    version = env!("CARGO_PKG_VERSION"),
    about = "Govern canonical knowledge objects through the INTENT, ROUTE, EXECUTE, COMPLETE lifecycle.",
    disable_version_flag = true
)]
pub(crate) struct Cli {
    /// Store directory; defaults to the nearest `.anchorage` above the working directory.
    #[clap(long, global = true)]
    pub store: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContractArg {
    General,
    StageReview,
    ExecuteReview,
    Regeneration,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create a store with a default governance.toml and an empty anchor registry.
    Init {
        /// Project directory to create `.anchorage` in.
        #[clap(long, default_value = ".")]
        dir: PathBuf,
        /// Overwrite an existing governance.toml with defaults.
        #[clap(long)]
        force: bool,
    },
    /// Render a knowledge object from a JSON field map.
    Format {
        /// Artefact kind: CKO, WKO, TKO or PKO.
        #[clap(long)]
        kind: String,
        #[clap(long)]
        project: u64,
        /// JSON file with `fields` (and `stages` for WKO); `-` reads stdin.
        #[clap(long, default_value = "-")]
        input: PathBuf,
    },
    /// Canonicalise free text: ASCII, headers, blank lines, trailing newline.
    Normalise {
        /// Text file; `-` reads stdin.
        #[clap(long, default_value = "-")]
        input: PathBuf,
    },
    /// Run one Review Conference with a JSON mutation request.
    Submit {
        /// JSON mutation request; `-` reads stdin.
        #[clap(long, default_value = "-")]
        input: PathBuf,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Inspect anchors.
    Anchor {
        #[clap(subcommand)]
        command: AnchorCommand,
    },
    /// Inspect review conference lifecycles.
    Lifecycle {
        #[clap(subcommand)]
        command: LifecycleCommand,
    },
    /// Print the seed brief for a conference on a marker.
    Brief {
        #[clap(long)]
        project: u64,
        #[clap(long)]
        marker: String,
        /// Contract to brief; defaults to the marker's usual contract.
        #[clap(long, value_enum)]
        contract: Option<ContractArg>,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand, Debug)]
pub(crate) enum AnchorCommand {
    /// Show the canonical anchor for a project and marker.
    Show {
        #[clap(long)]
        project: u64,
        #[clap(long)]
        marker: String,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// List every committed version of an anchor.
    History {
        #[clap(long)]
        project: u64,
        #[clap(long)]
        marker: String,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum LifecycleCommand {
    /// Show the conference cycle for a project and chat.
    Show {
        #[clap(long)]
        project: u64,
        #[clap(long)]
        chat: String,
    },
}
