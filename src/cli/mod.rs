//! CLI module for fleetctl
//!
//! Subcommands:
//! - `fleetctl inventory list` - List records across clusters
//! - `fleetctl cluster apply` - Reconcile clusters to a node count
//! - `fleetctl cluster start|stop|destroy` - Drive lifecycle transitions
//! - `fleetctl cluster exec` - Run a command on cluster nodes
//! - `fleetctl cluster hosts` - Roll out /etc/hosts entries
//! - `fleetctl cluster tag` - Add or remove tags
//! - `fleetctl files upload|download` - Copy files to or from nodes
//! - `fleetctl config show|init` - Inspect or create the config file

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::fleet::{NodeRangeError, NodeSelection};

#[derive(Parser, Debug)]
#[command(name = "fleetctl")]
#[command(about = "Manage fleets of database cluster nodes")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.fleetctl/config.yaml)
    #[arg(long, global = true, env = "FLEETCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a .env file for loading provider credentials
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query the inventory
    #[command(subcommand)]
    Inventory(InventoryCommand),

    /// Manage clusters
    #[command(subcommand)]
    Cluster(ClusterCommand),

    /// Copy files to or from cluster nodes
    #[command(subcommand)]
    Files(FilesCommand),

    /// Manage the config file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum InventoryCommand {
    /// List records
    #[command(visible_alias = "ls")]
    List(ListArgs),
}

/// Arguments for the inventory list command
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only records of this cluster
    #[arg(long)]
    pub cluster: Option<String>,

    /// Filter criterion (key=value), repeatable: cluster, nodes, tag.<key>,
    /// state, not-state, owner, zone, backend, role, arch, os, os-version, expired
    #[arg(short, long = "filter", value_name = "KEY=VALUE")]
    pub filters: Vec<String>,

    /// Include terminated records
    #[arg(short, long)]
    pub all: bool,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// Bring clusters to a node count, creating or destroying nodes
    Apply(ApplyArgs),

    /// Start stopped nodes
    Start(TransitionArgs),

    /// Stop running nodes
    Stop(TransitionArgs),

    /// Terminate nodes
    #[command(visible_alias = "terminate")]
    Destroy(TransitionArgs),

    /// Run a command on nodes
    Exec(ExecArgs),

    /// Write every node's address into every node's /etc/hosts
    Hosts(HostsArgs),

    /// Add or remove tags
    Tag(TagArgs),
}

/// Cluster and node selection shared by cluster commands
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Cluster names, comma-separated
    #[arg(short = 'n', long = "name", value_delimiter = ',', required = true)]
    pub clusters: Vec<String>,

    /// Node numbers, e.g. 1,3,5-7 (default: all nodes)
    #[arg(short = 'l', long = "nodes")]
    pub nodes: Option<String>,
}

impl TargetArgs {
    /// Parsed node selection; `None` means every node
    pub fn selection(&self) -> Result<Option<NodeSelection>, NodeRangeError> {
        NodeSelection::parse_optional(self.nodes.as_deref())
    }
}

/// Arguments for the apply command
#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Cluster names, comma-separated
    #[arg(short = 'n', long = "name")]
    pub names: String,

    /// Desired number of live nodes per cluster
    #[arg(short = 'c', long = "count", allow_negative_numbers = true)]
    pub count: i64,

    /// Show what would change without changing it
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for start, stop and destroy
#[derive(Args, Debug)]
pub struct TransitionArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Seconds to wait for nodes to settle; 0 returns immediately
    #[arg(long, value_name = "SECS")]
    pub wait: Option<u64>,

    /// Skip graceful shutdown
    #[arg(long)]
    pub force: bool,

    /// Maximum nodes handled at once
    #[arg(short = 'P', long)]
    pub parallel: Option<usize>,
}

/// Arguments for the exec command
#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Maximum nodes handled at once
    #[arg(short = 'P', long)]
    pub parallel: Option<usize>,

    /// Per-node session timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Command to run, after `--`
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Arguments for the hosts command
#[derive(Args, Debug)]
pub struct HostsArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Maximum nodes handled at once
    #[arg(short = 'P', long)]
    pub parallel: Option<usize>,
}

/// Arguments for the tag command
#[derive(Args, Debug)]
pub struct TagArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Tag to add (key=value), repeatable
    #[arg(long = "add", value_name = "KEY=VALUE")]
    pub add: Vec<String>,

    /// Tag key to remove, repeatable
    #[arg(long = "remove", value_name = "KEY")]
    pub remove: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum FilesCommand {
    /// Copy a local file to nodes
    Upload(FilesArgs),

    /// Copy a file from nodes; with several nodes LOCAL is a directory
    Download(FilesArgs),
}

/// Arguments for file transfers
#[derive(Args, Debug)]
pub struct FilesArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Maximum nodes handled at once
    #[arg(short = 'P', long)]
    pub parallel: Option<usize>,

    /// Local path
    pub local: PathBuf,

    /// Path on the node
    pub remote: String,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
