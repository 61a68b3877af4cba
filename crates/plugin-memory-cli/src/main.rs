use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use plugin_memory_core::{AuditContext, PairKey, ScopeKind, TrimRequest};
use plugin_memory_scopes::{MutationCoordinator, ScopeSet};
use plugin_memory_store::StoreLayout;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "pmem.v1";

#[derive(Debug, Parser)]
#[command(name = "pmem")]
#[command(about = "Plugin memory store CLI")]
struct Cli {
    /// Store directory; defaults to $PLUGIN_MEMORY_CACHE_DIR or the platform cache dir.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Root of the user settings; defaults to the home directory.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Root of the project and local settings; defaults to the working directory.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Cache {
        #[command(subcommand)]
        command: Box<CacheCommand>,
    },
    History {
        #[command(subcommand)]
        command: Box<HistoryCommand>,
    },
    Scopes {
        #[command(subcommand)]
        command: Box<ScopesCommand>,
    },
    Enable(EnableArgs),
    Disable(DisableArgs),
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    List(CacheListArgs),
    Forget(KeyArgs),
    ForgetSource(SourceArgs),
    Clear,
}

#[derive(Debug, Args)]
struct CacheListArgs {
    #[arg(long, default_value_t = false)]
    sources: bool,
}

#[derive(Debug, Args)]
struct KeyArgs {
    /// `primary@secondary`
    key: String,
}

#[derive(Debug, Args)]
struct SourceArgs {
    source: String,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    Show(HistoryShowArgs),
    Trim(HistoryTrimArgs),
}

#[derive(Debug, Args)]
struct HistoryShowArgs {
    #[arg(long, default_value_t = 20)]
    last: usize,
}

#[derive(Debug, Args)]
struct HistoryTrimArgs {
    #[arg(long)]
    keep: Option<usize>,
    #[arg(long)]
    older_than_days: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum ScopesCommand {
    Status(KeyArgs),
    Overview,
}

#[derive(Debug, Args)]
struct EnableArgs {
    key: String,
    #[arg(long, value_enum)]
    scope: ScopeArg,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DisableArgs {
    key: String,
    #[arg(long, value_enum, required_unless_present = "all", conflicts_with = "all")]
    scope: Option<ScopeArg>,
    #[arg(long, default_value_t = false)]
    all: bool,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    User,
    Project,
    Local,
}

impl ScopeArg {
    fn into_scope_kind(self) -> ScopeKind {
        match self {
            Self::User => ScopeKind::User,
            Self::Project => ScopeKind::Project,
            Self::Local => ScopeKind::Local,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let layout = match cli.cache_dir {
        Some(root) => StoreLayout::new(root),
        None => StoreLayout::from_env()?,
    };
    debug!(root = %layout.root().display(), "using store directory");

    match cli.command {
        Command::Cache { command } => run_cache(*command, &layout).map(|()| ExitCode::SUCCESS),
        Command::History { command } => {
            run_history(*command, &layout).map(|()| ExitCode::SUCCESS)
        }
        Command::Scopes { command } => {
            let coordinator = coordinator(cli.home, cli.project_dir, &layout)?;
            run_scopes(*command, &coordinator).map(|()| ExitCode::SUCCESS)
        }
        Command::Enable(args) => {
            let coordinator = coordinator(cli.home, cli.project_dir, &layout)?;
            run_enable(&args, &coordinator)
        }
        Command::Disable(args) => {
            let coordinator = coordinator(cli.home, cli.project_dir, &layout)?;
            run_disable(&args, &coordinator)
        }
    }
}

fn coordinator(
    home: Option<PathBuf>,
    project_dir: Option<PathBuf>,
    layout: &StoreLayout,
) -> Result<MutationCoordinator> {
    let scopes = ScopeSet::discover(home, project_dir)?;
    Ok(MutationCoordinator::new(scopes, layout))
}

fn audit_context(dry_run: bool) -> AuditContext {
    let command_line =
        std::env::args_os().map(|arg| arg.to_string_lossy().into_owned()).collect();
    AuditContext::new(command_line, dry_run)
}

fn parse_key(raw: &str) -> Result<PairKey> {
    PairKey::parse(raw).with_context(|| format!("failed to parse key `{raw}`"))
}

fn run_cache(command: CacheCommand, layout: &StoreLayout) -> Result<()> {
    match command {
        CacheCommand::List(args) => run_cache_list(&args, layout),
        CacheCommand::Forget(args) => {
            let key = parse_key(&args.key)?;
            let removed = layout.pair_cache().remove(&key.identity())?;
            emit_json(serde_json::json!({
                "key": key.identity(),
                "removed": removed
            }))
        }
        CacheCommand::ForgetSource(args) => {
            let source = args.source.trim();
            let removed = layout.source_cache().remove(source)?;
            emit_json(serde_json::json!({
                "source": source,
                "removed": removed
            }))
        }
        CacheCommand::Clear => {
            let pairs_cleared = layout.pair_cache().clear()?;
            let sources_cleared = layout.source_cache().clear()?;
            emit_json(serde_json::json!({
                "pairs_cleared": pairs_cleared,
                "sources_cleared": sources_cleared
            }))
        }
    }
}

fn run_cache_list(args: &CacheListArgs, layout: &StoreLayout) -> Result<()> {
    if args.sources {
        let mut sources = layout.source_cache().list()?;
        sources.sort_by(|left, right| right.last_used.cmp(&left.last_used));
        return emit_json(serde_json::json!({
            "cache_path": layout.sources_path(),
            "sources": sources
        }));
    }

    let mut pairs = layout.pair_cache().list()?;
    pairs.sort_by(|left, right| right.last_used.cmp(&left.last_used));
    emit_json(serde_json::json!({
        "cache_path": layout.pairs_path(),
        "pairs": pairs
    }))
}

fn run_history(command: HistoryCommand, layout: &StoreLayout) -> Result<()> {
    let log = layout.audit_log();
    match command {
        HistoryCommand::Show(args) => {
            let entries = log.show(args.last)?;
            emit_json(serde_json::json!({
                "log_path": log.path(),
                "count": entries.len(),
                "entries": entries
            }))
        }
        HistoryCommand::Trim(args) => {
            let request = TrimRequest { keep: args.keep, older_than_days: args.older_than_days };
            let report = log.trim(request)?;
            emit_json(serde_json::json!({
                "log_path": log.path(),
                "floor": log.floor(),
                "request": request,
                "report": report
            }))
        }
    }
}

fn run_scopes(command: ScopesCommand, coordinator: &MutationCoordinator) -> Result<()> {
    match command {
        ScopesCommand::Status(args) => {
            let key = parse_key(&args.key)?;
            let records = coordinator.query(&key, audit_context(false));
            let active_scopes = records
                .iter()
                .filter(|record| record.is_active)
                .map(|record| record.scope)
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({
                "key": key.identity(),
                "active_scopes": active_scopes,
                "records": records
            }))
        }
        ScopesCommand::Overview => {
            let active = coordinator.reconciler().all_active_identities();
            emit_json(serde_json::json!({
                "scopes": coordinator.scopes().scopes(),
                "active": active
            }))
        }
    }
}

fn run_enable(args: &EnableArgs, coordinator: &MutationCoordinator) -> Result<ExitCode> {
    let key = parse_key(&args.key)?;
    let scope = args.scope.into_scope_kind();
    match coordinator.activate(&key, scope, audit_context(args.dry_run)) {
        Ok(outcome) => {
            emit_json(serde_json::json!({
                "ok": true,
                "key": key.identity(),
                "outcome": outcome
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            emit_json(serde_json::json!({
                "ok": false,
                "key": key.identity(),
                "scope": scope,
                "error": format!("{err:#}")
            }))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_disable(args: &DisableArgs, coordinator: &MutationCoordinator) -> Result<ExitCode> {
    let key = parse_key(&args.key)?;
    let context = audit_context(args.dry_run);

    let Some(scope) = args.scope.map(ScopeArg::into_scope_kind) else {
        let batch = coordinator.deactivate_everywhere(&key, context);
        let ok = batch.is_complete();
        emit_json(serde_json::json!({
            "ok": ok,
            "key": key.identity(),
            "succeeded": batch.succeeded,
            "failed": batch.failed
        }))?;
        return Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    };

    match coordinator.deactivate(&key, scope, context) {
        Ok(outcome) => {
            emit_json(serde_json::json!({
                "ok": true,
                "key": key.identity(),
                "outcome": outcome
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            emit_json(serde_json::json!({
                "ok": false,
                "key": key.identity(),
                "scope": scope,
                "error": format!("{err:#}")
            }))?;
            Ok(ExitCode::FAILURE)
        }
    }
}
