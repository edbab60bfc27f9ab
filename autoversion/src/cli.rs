use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use autoversion_core::config::{LookupStrategy, Strategy};

/// autoversion: fold re-uploaded documents into versions of the original.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Engine configuration file (JSON).
    #[arg(long, short, global = true, env = "AUTOVERSION_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (use multiple times for more).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload files into an in-memory repository, one transaction per file.
    Import(ImportArgs),
    /// Print the canonical form of file names.
    Canonicalize(CanonicalizeArgs),
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Files to upload, in order. Files sharing a name become versions of the first one.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Folder inside the site's document library to upload into.
    #[arg(long)]
    pub folder: Option<String>,

    /// Merge strategy (overrides the configuration file).
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Sibling lookup (overrides the configuration file).
    #[arg(long, value_enum)]
    pub lookup: Option<LookupArg>,

    /// User the uploads run as.
    #[arg(long = "as", default_value = "admin")]
    pub user: String,

    /// Short name of the site to create.
    #[arg(long, default_value = "demo")]
    pub site: String,
}

#[derive(Args, Debug)]
pub struct CanonicalizeArgs {
    #[arg(required = true)]
    pub names: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum StrategyArg {
    Synchronous,
    Deferred,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Synchronous => Strategy::Synchronous,
            StrategyArg::Deferred => Strategy::Deferred,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LookupArg {
    Scan,
    Indexed,
}

impl From<LookupArg> for LookupStrategy {
    fn from(arg: LookupArg) -> Self {
        match arg {
            LookupArg::Scan => LookupStrategy::Scan,
            LookupArg::Indexed => LookupStrategy::Indexed,
        }
    }
}
