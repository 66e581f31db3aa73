//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return rendered output or an error, printing is
//! handled by the caller

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use super::display::{
    format_batch, format_exec_report, format_reconcile_failure, format_reconcile_outcomes,
    format_record_list, format_transfer_report,
};
use super::{
    ApplyArgs, ClusterCommand, Commands, ConfigCommand, ExecArgs, FilesArgs, FilesCommand,
    HostsArgs, InventoryCommand, ListArgs, TagArgs, TargetArgs, TransitionArgs,
};
use crate::backend::{BackendError, ExecRequest, Transfer};
use crate::config::{self, ConfigError, FleetConfig};
use crate::fleet::{
    AggregateError, BatchReport, Collection, ExecutorError, Filter, FilterError, Fleet,
    FleetError, FleetReconcileError, LifecycleState, NodeRangeError, ParallelOptions,
    ReconcileError, Transition,
};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("Invalid node list: {0}")]
    NodeRange(#[from] NodeRangeError),

    #[error("Invalid filter: {0}")]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Reconcile(#[from] FleetReconcileError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Some records failed; `output` holds the rendered per-record results
    #[error("{source}")]
    Batch {
        output: String,
        #[source]
        source: AggregateError,
    },

    /// Reconciliation failed after changing something; `output` says what
    #[error("{source}")]
    Apply {
        output: String,
        #[source]
        source: ReconcileError,
    },
}

impl CommandError {
    /// Output produced before the command failed
    pub fn output(&self) -> Option<&str> {
        match self {
            CommandError::Batch { output, .. } | CommandError::Apply { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Split `key=value`; the key must be non-empty
pub fn parse_key_value(input: &str) -> CommandResult<(String, String)> {
    match input.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(CommandError::InvalidArgument(format!(
            "expected key=value, got '{}'",
            input
        ))),
    }
}

/// Parse repeated `--add key=value` arguments into a tag map
pub fn parse_tags(pairs: &[String]) -> CommandResult<HashMap<String, String>> {
    pairs.iter().map(|p| parse_key_value(p)).collect()
}

/// Build the inventory filter from `--cluster` and `--filter` arguments
pub fn build_filter(args: &ListArgs) -> CommandResult<Filter> {
    let mut filter = Filter::parse(&args.filters)?;
    if let Some(cluster) = &args.cluster {
        filter = filter.cluster(cluster.clone());
    }
    Ok(filter)
}

/// Turn a batch into rendered output, or a [`CommandError::Batch`] carrying it
fn finish_batch<T>(report: &BatchReport<T>, output: String) -> CommandResult<String> {
    match report.aggregate_error() {
        Some(source) => Err(CommandError::Batch { output, source }),
        None => Ok(output),
    }
}

/// Like [`finish_batch`] for a command that ran several batches over `total` targets
fn finish_batches(
    total: usize,
    errors: Vec<AggregateError>,
    output: String,
) -> CommandResult<String> {
    match AggregateError::merge(total, errors) {
        Some(source) => Err(CommandError::Batch { output, source }),
        None => Ok(output),
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Run any command that needs a backend
pub async fn run_fleet_command(fleet: &Fleet, command: &Commands) -> CommandResult<String> {
    match command {
        Commands::Inventory(InventoryCommand::List(args)) => inventory_list(fleet, args).await,
        Commands::Cluster(cmd) => match cmd {
            ClusterCommand::Apply(args) => cluster_apply(fleet, args).await,
            ClusterCommand::Start(args) => cluster_transition(fleet, args, Transition::Start).await,
            ClusterCommand::Stop(args) => {
                let transition = Transition::Stop { force: args.force };
                cluster_transition(fleet, args, transition).await
            }
            ClusterCommand::Destroy(args) => cluster_destroy(fleet, args).await,
            ClusterCommand::Exec(args) => cluster_exec(fleet, args).await,
            ClusterCommand::Hosts(args) => cluster_hosts(fleet, args).await,
            ClusterCommand::Tag(args) => cluster_tag(fleet, args).await,
        },
        Commands::Files(FilesCommand::Upload(args)) => {
            let transfer = Transfer::upload(args.local.clone(), args.remote.clone());
            files_transfer(fleet, args, transfer).await
        }
        Commands::Files(FilesCommand::Download(args)) => {
            let transfer = Transfer::download(args.remote.clone(), args.local.clone());
            files_transfer(fleet, args, transfer).await
        }
        Commands::Config(_) => Err(CommandError::InvalidArgument(
            "config commands do not use a backend".to_string(),
        )),
    }
}

async fn select_targets(fleet: &Fleet, target: &TargetArgs) -> CommandResult<Collection> {
    let selection = target.selection()?;
    let selected = fleet.select(&target.clusters, selection.as_ref()).await?;
    debug!(records = selected.len(), "Selected targets");
    Ok(selected)
}

/// List records matching the given filters
pub async fn inventory_list(fleet: &Fleet, args: &ListArgs) -> CommandResult<String> {
    let filter = build_filter(args)?;
    let records = fleet.query(&filter, args.all).await?;

    if args.json {
        let mut json = serde_json::to_string_pretty(&records.sorted().describe())?;
        json.push('\n');
        return Ok(json);
    }
    Ok(format_record_list(&records))
}

/// Reconcile each named cluster to the desired count
pub async fn cluster_apply(fleet: &Fleet, args: &ApplyArgs) -> CommandResult<String> {
    match fleet
        .reconcile_many(&args.names, args.count, args.dry_run)
        .await
    {
        Ok(outcomes) => Ok(format_reconcile_outcomes(&outcomes)),
        Err(FleetReconcileError::Reconcile(source)) => {
            let output = format_reconcile_failure(&source);
            if output.is_empty() {
                return Err(FleetReconcileError::Reconcile(source).into());
            }
            Err(CommandError::Apply { output, source })
        }
        Err(e) => Err(e.into()),
    }
}

fn wait_for(fleet: &Fleet, args: &TransitionArgs) -> Duration {
    args.wait
        .map(Duration::from_secs)
        .unwrap_or_else(|| fleet.config().lifecycle.wait())
}

/// Start or stop the selected nodes
pub async fn cluster_transition(
    fleet: &Fleet,
    args: &TransitionArgs,
    transition: Transition,
) -> CommandResult<String> {
    let targets = select_targets(fleet, &args.target).await?;
    let options = fleet.parallel_options(args.parallel)?;
    let report = fleet
        .transition(&targets, transition, wait_for(fleet, args), &options)
        .await;
    let output = format_batch(&report, |state| Some(state.to_string()));
    finish_batch(&report, output)
}

/// Terminate the selected nodes; `--force` stops running ones without grace first
///
/// Records whose forced stop fails are not terminated. Every other target
/// is, and the failures of both steps are reported together.
pub async fn cluster_destroy(fleet: &Fleet, args: &TransitionArgs) -> CommandResult<String> {
    let targets = select_targets(fleet, &args.target).await?;
    let options = fleet.parallel_options(args.parallel)?;
    let wait = wait_for(fleet, args);

    let mut output = String::new();
    let mut errors = Vec::new();
    let mut to_terminate = targets.clone();

    if args.force {
        let running = targets.with_state(&[LifecycleState::Running]);
        if !running.is_empty() {
            info!(records = running.len(), "Force-stopping before terminate");
            let report = fleet
                .transition(&running, Transition::Stop { force: true }, wait, &options)
                .await;
            output.push_str(&format_batch(&report, |state| Some(state.to_string())));
            if let Some(error) = report.aggregate_error() {
                let failed = error.failed_refs();
                to_terminate = targets
                    .iter()
                    .filter(|r| !failed.iter().any(|f| f.backend_id == r.backend_id()))
                    .cloned()
                    .collect();
                errors.push(error);
            }
        }
    }

    if !to_terminate.is_empty() {
        let report = fleet
            .transition(&to_terminate, Transition::Terminate, wait, &options)
            .await;
        output.push_str(&format_batch(&report, |state| Some(state.to_string())));
        errors.extend(report.aggregate_error());
    }
    finish_batches(targets.len(), errors, output)
}

/// Run a command on the selected nodes
pub async fn cluster_exec(fleet: &Fleet, args: &ExecArgs) -> CommandResult<String> {
    let targets = select_targets(fleet, &args.target).await?;
    let mut options: ParallelOptions = fleet.parallel_options(args.parallel)?;
    if let Some(secs) = args.timeout {
        options = options.with_timeout(Some(Duration::from_secs(secs)));
    }

    let request = ExecRequest::new(args.command.iter().cloned());
    let report = fleet.exec(&targets, &request, &options).await;
    let output = format_exec_report(&report);
    finish_batch(&report, output)
}

/// Push hosts entries for every selected node to every selected node
pub async fn cluster_hosts(fleet: &Fleet, args: &HostsArgs) -> CommandResult<String> {
    let targets = select_targets(fleet, &args.target).await?;
    let options = fleet.parallel_options(args.parallel)?;
    let report = fleet.update_hosts(&targets, &options).await;
    let output = format_batch(&report, |_| None);
    finish_batch(&report, output)
}

/// Add and then remove tags on the selected nodes
pub async fn cluster_tag(fleet: &Fleet, args: &TagArgs) -> CommandResult<String> {
    if args.add.is_empty() && args.remove.is_empty() {
        return Err(CommandError::InvalidArgument(
            "nothing to do: pass --add or --remove".to_string(),
        ));
    }
    let tags = parse_tags(&args.add)?;
    let targets = select_targets(fleet, &args.target).await?;
    let options = fleet.parallel_options(None)?;

    let mut output = String::new();
    let mut errors = Vec::new();
    if !tags.is_empty() {
        let report = fleet.add_tags(&targets, &tags, &options).await;
        output.push_str(&format_batch(&report, |_| None));
        errors.extend(report.aggregate_error());
    }
    if !args.remove.is_empty() {
        let report = fleet.remove_tags(&targets, &args.remove, &options).await;
        output.push_str(&format_batch(&report, |_| None));
        errors.extend(report.aggregate_error());
    }
    finish_batches(targets.len(), errors, output)
}

/// Upload to or download from the selected nodes
pub async fn files_transfer(
    fleet: &Fleet,
    args: &FilesArgs,
    transfer: Transfer,
) -> CommandResult<String> {
    let targets = select_targets(fleet, &args.target).await?;
    let options = fleet.parallel_options(args.parallel)?;
    let report = fleet.transfer(&targets, &transfer, &options).await;
    let output = format_transfer_report(&report);
    finish_batch(&report, output)
}

/// Handle `config show` and `config init`
pub fn run_config_command(
    command: &ConfigCommand,
    config: &FleetConfig,
    path: &Path,
) -> CommandResult<String> {
    match command {
        ConfigCommand::Show => Ok(config::serialize_config(config)?),
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(CommandError::InvalidArgument(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            config::save_config_to(&FleetConfig::default(), path)?;
            Ok(format!("Wrote default config to {}\n", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cli::Cli;
    use crate::fleet::record::{BackendType, ResourceRecord};
    use clap::Parser;
    use std::sync::Arc;

    fn fleet_with(backend: &MemoryBackend) -> Fleet {
        let mut config = FleetConfig::default();
        config.lifecycle.wait_secs = 0;
        Fleet::new(Arc::new(backend.clone()), config).unwrap()
    }

    fn parse(args: &[&str]) -> Commands {
        let mut argv = vec!["fleetctl"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().command
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("team=db").unwrap(),
            ("team".to_string(), "db".to_string())
        );
        assert_eq!(
            parse_key_value("url=a=b").unwrap(),
            ("url".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("=x").is_err());
        assert!(parse_key_value("novalue").is_err());
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = FleetConfig::default();

        let init = ConfigCommand::Init { force: false };
        assert!(run_config_command(&init, &config, &path).is_ok());
        assert!(run_config_command(&init, &config, &path).is_err());
        assert!(run_config_command(&ConfigCommand::Init { force: true }, &config, &path).is_ok());
    }

    #[tokio::test]
    async fn test_apply_then_list() {
        let backend = MemoryBackend::new();
        let fleet = fleet_with(&backend);

        let out = run_fleet_command(&fleet, &parse(&["cluster", "apply", "-n", "mydc", "-c", "2"]))
            .await
            .unwrap();
        assert_eq!(out, "mydc: create 2\ncreated-node-numbers:1,2\n");

        let out = run_fleet_command(&fleet, &parse(&["inventory", "list", "--cluster", "mydc"]))
            .await
            .unwrap();
        assert_eq!(out.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_exec_failure_keeps_output() {
        let backend = MemoryBackend::new();
        backend.insert(
            ResourceRecord::instance(BackendType::Memory, "mydc", 1, "")
                .with_state(LifecycleState::Running),
        );
        backend.insert(
            ResourceRecord::instance(BackendType::Memory, "mydc", 2, "")
                .with_state(LifecycleState::Stopped),
        );
        let fleet = fleet_with(&backend);

        let err = run_fleet_command(&fleet, &parse(&["cluster", "exec", "-n", "mydc", "--", "true"]))
            .await
            .unwrap_err();
        let output = err.output().unwrap();
        assert!(output.contains("=== mydc-1 ==="));
        assert!(output.contains("FAILED: instance not running"));
        assert!(err.to_string().starts_with("1 of 2 records failed"));
    }

    #[tokio::test]
    async fn test_destroy_missing_nodes_is_not_found() {
        let backend = MemoryBackend::new();
        let fleet = fleet_with(&backend);
        run_fleet_command(&fleet, &parse(&["cluster", "apply", "-n", "mydc", "-c", "3"]))
            .await
            .unwrap();

        let err = run_fleet_command(
            &fleet,
            &parse(&["cluster", "destroy", "-n", "mydc", "-l", "2,7"]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Fleet(FleetError::NotFound(_))));
        assert!(err.to_string().contains('7'));
    }

    #[tokio::test]
    async fn test_tag_requires_an_operation() {
        let fleet = fleet_with(&MemoryBackend::new());
        let err = run_fleet_command(&fleet, &parse(&["cluster", "tag", "-n", "mydc"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));
    }
}
