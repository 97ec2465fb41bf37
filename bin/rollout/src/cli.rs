use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rollout_deploy::MANIFEST_FILENAME;
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "rollout")]
#[command(
    author,
    version,
    about = "Deploy and upgrade contracts, re-runnable without side effects"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "ROLLOUT_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the rollout manifest.
    #[arg(short, long, env = "ROLLOUT_MANIFEST", default_value = MANIFEST_FILENAME)]
    pub manifest: PathBuf,

    /// The network to operate on, as named in the manifest's `[networks]` table.
    ///
    /// Required by every command except `classify`.
    #[arg(short, long, env = "ROLLOUT_NETWORK")]
    pub network: Option<String>,

    /// Output format for results.
    #[arg(long, env = "ROLLOUT_FORMAT", default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn network(&self) -> anyhow::Result<&str> {
        self.network
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--network is required for this command"))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bring every manifest target to its requested version.
    Deploy {
        /// Deploy everything fresh without reading or writing the registry.
        ///
        /// Meant for throwaway local nodes. Nothing is verified.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Show the registry of the network.
    Status,

    /// Print the canonical address of an artifact.
    Address { name: String },

    /// Print whether an artifact is upgradeable or plain.
    Classify { name: String },

    /// Resolve the implementation currently behind an artifact's proxy.
    Implementation { name: String },
}
