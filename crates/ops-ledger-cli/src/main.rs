use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ops_ledger_api::{
    BackupRequest, OpsLedgerApi, RestoreRequest, TaxonomyProvider, API_CONTRACT_VERSION,
};
use ops_ledger_core::{AuditEvent, AuditSink, ScopeFlags, SnapshotError, TaxonomyBaseline};
use serde_json::Value;
use sha2::{Digest, Sha256};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ol")]
#[command(about = "Ops Ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./ops_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Taxonomy {
        #[command(subcommand)]
        command: TaxonomyCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Stats,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Backup(SnapshotBackupArgs),
    Restore(SnapshotRestoreArgs),
}

/// Scope selection shared by backup and restore. Passing no flag selects the
/// full scope.
#[derive(Debug, Args)]
struct ScopeArgs {
    #[arg(long, default_value_t = false)]
    taxonomy: bool,
    #[arg(long = "case-data", default_value_t = false)]
    case_data: bool,
    #[arg(long, default_value_t = false)]
    accounts: bool,
}

impl ScopeArgs {
    fn to_scope(&self) -> ScopeFlags {
        let selected =
            ScopeFlags { taxonomy: self.taxonomy, case_data: self.case_data, accounts: self.accounts };
        if selected.is_empty() {
            ScopeFlags::full()
        } else {
            selected
        }
    }
}

#[derive(Debug, Args)]
struct SnapshotBackupArgs {
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long, default_value = "cli")]
    actor: String,
    #[arg(long)]
    audit_log: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SnapshotRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long, default_value_t = false)]
    clear: bool,
    #[arg(long, default_value = "cli")]
    actor: String,
    #[arg(long)]
    audit_log: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum TaxonomyCommand {
    Seed(TaxonomySeedArgs),
}

#[derive(Debug, Args)]
struct TaxonomySeedArgs {
    #[arg(long)]
    from: PathBuf,
}

/// Captures the engine's audit event for the JSON output, and appends it as a
/// JSON line to the optional audit log file. Transport failures never fail
/// the invocation.
#[derive(Debug, Default)]
struct CliAuditSink {
    log_path: Option<PathBuf>,
    last: Mutex<Option<AuditEvent>>,
}

impl CliAuditSink {
    fn new(log_path: Option<PathBuf>) -> Self {
        Self { log_path, last: Mutex::new(None) }
    }

    fn last_event(&self) -> Option<AuditEvent> {
        match self.last.lock() {
            Ok(last) => last.clone(),
            Err(_) => None,
        }
    }
}

impl AuditSink for CliAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(event.clone());
        }
        let Some(path) = &self.log_path else {
            return;
        };
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{line}");
        }
    }
}

struct FileTaxonomyProvider {
    path: PathBuf,
}

impl TaxonomyProvider for FileTaxonomyProvider {
    fn baseline(&self) -> Result<TaxonomyBaseline> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read taxonomy file {}", self.path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse taxonomy file {}", self.path.display()))
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

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(engine_err) = err.downcast_ref::<SnapshotError>() {
                let _ = emit_json(serde_json::json!({
                    "error_kind": engine_err.kind(),
                    "error": engine_err.to_string()
                }));
            } else {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let api = OpsLedgerApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(&command, &api),
        Command::Snapshot { command } => run_snapshot(&command, &api),
        Command::Taxonomy { command } => run_taxonomy(&command, &api),
    }
}

fn run_db(command: &DbCommand, api: &OpsLedgerApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "api_contract_version": API_CONTRACT_VERSION
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
        DbCommand::Stats => {
            let counts = api.category_counts()?;
            emit_json(serde_json::json!({ "counts": counts }))
        }
    }
}

fn run_snapshot(command: &SnapshotCommand, api: &OpsLedgerApi) -> Result<()> {
    match command {
        SnapshotCommand::Backup(args) => run_snapshot_backup(args, api),
        SnapshotCommand::Restore(args) => run_snapshot_restore(args, api),
    }
}

fn run_snapshot_backup(args: &SnapshotBackupArgs, api: &OpsLedgerApi) -> Result<()> {
    let sink = CliAuditSink::new(args.audit_log.clone());
    let request = BackupRequest { scope: args.scope.to_scope(), actor: args.actor.clone() };
    let result = api.backup(&request, &sink)?;

    fs::write(&args.out, result.snapshot.as_bytes())
        .with_context(|| format!("failed to write snapshot file {}", args.out.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(result.snapshot.as_bytes());
    let sha256 = format!("{:x}", hasher.finalize());

    // The snapshot body already lives in the output file; the result JSON
    // carries its digest instead.
    let mut output = match serde_json::to_value(&result)
        .context("failed to serialize backup result")?
    {
        Value::Object(mut object) => {
            object.remove("snapshot");
            object
        }
        _ => anyhow::bail!("backup result should serialize to an object"),
    };
    output.insert("out".to_string(), serde_json::json!(args.out));
    output.insert(
        "scope".to_string(),
        serde_json::to_value(request.scope).context("failed to serialize scope")?,
    );
    output.insert("sha256".to_string(), Value::String(sha256));
    output.insert(
        "audit".to_string(),
        serde_json::to_value(sink.last_event()).context("failed to serialize audit event")?,
    );

    emit_json(Value::Object(output))
}

fn run_snapshot_restore(args: &SnapshotRestoreArgs, api: &OpsLedgerApi) -> Result<()> {
    let snapshot = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read snapshot file {}", args.input.display()))?;

    let sink = CliAuditSink::new(args.audit_log.clone());
    let request = RestoreRequest {
        snapshot,
        scope: args.scope.to_scope(),
        clear_before_restore: args.clear,
        actor: args.actor.clone(),
    };
    let summary = api.restore(&request, &sink)?;

    emit_json(serde_json::json!({
        "restored_from": args.input,
        "scope": request.scope,
        "clear_before_restore": request.clear_before_restore,
        "summary": summary,
        "audit": sink.last_event()
    }))
}

fn run_taxonomy(command: &TaxonomyCommand, api: &OpsLedgerApi) -> Result<()> {
    match command {
        TaxonomyCommand::Seed(args) => {
            let provider = FileTaxonomyProvider { path: args.from.clone() };
            let summary = api.seed_taxonomy(&provider)?;
            emit_json(serde_json::json!({
                "seeded_from": args.from,
                "summary": summary
            }))
        }
    }
}
