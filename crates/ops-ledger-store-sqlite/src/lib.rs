use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ops_ledger_core::{
    creation_order, deletion_order, mint_id, AccessGroup, Account, AccountRole, Actor,
    ActorTechnique, Category, Credential, LogSource, Membership, Operation, OperationLayout,
    OperationStatus, Outcome, RestorePhase, ScopeFlags, SnapshotEnvelope, SnapshotError,
    SnapshotPayload, Step, StepStatus, Subtechnique, Tactic, Tag, Target, TargetAssignment,
    TaxonomyBaseline, Technique, Tool, ToolCategory, Verdict, Visibility,
    SNAPSHOT_FORMAT_VERSION,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS accounts (
  id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  display_name TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('admin','operator','viewer')),
  active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS access_groups (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  description TEXT
);

CREATE TABLE IF NOT EXISTS memberships (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  account_id TEXT NOT NULL,
  access_group_id TEXT NOT NULL,
  UNIQUE (account_id, access_group_id),
  FOREIGN KEY (account_id) REFERENCES accounts(id),
  FOREIGN KEY (access_group_id) REFERENCES access_groups(id)
);

CREATE TABLE IF NOT EXISTS credentials (
  id TEXT PRIMARY KEY,
  account_id TEXT NOT NULL,
  username TEXT NOT NULL,
  secret TEXT NOT NULL,
  FOREIGN KEY (account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS tactics (
  id TEXT PRIMARY KEY,
  external_id TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS techniques (
  id TEXT PRIMARY KEY,
  external_id TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  tactic_id TEXT NOT NULL,
  FOREIGN KEY (tactic_id) REFERENCES tactics(id)
);

CREATE TABLE IF NOT EXISTS subtechniques (
  id TEXT PRIMARY KEY,
  external_id TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  technique_id TEXT NOT NULL,
  FOREIGN KEY (technique_id) REFERENCES techniques(id)
);

CREATE TABLE IF NOT EXISTS actors (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT
);

CREATE TABLE IF NOT EXISTS actor_techniques (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  actor_id TEXT NOT NULL,
  technique_id TEXT NOT NULL,
  UNIQUE (actor_id, technique_id),
  FOREIGN KEY (actor_id) REFERENCES actors(id),
  FOREIGN KEY (technique_id) REFERENCES techniques(id)
);

CREATE TABLE IF NOT EXISTS tags (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  color TEXT
);

CREATE TABLE IF NOT EXISTS tool_categories (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tools (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  category_id TEXT NOT NULL,
  FOREIGN KEY (category_id) REFERENCES tool_categories(id)
);

CREATE TABLE IF NOT EXISTS log_sources (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  platform TEXT
);

CREATE TABLE IF NOT EXISTS targets (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  address TEXT
);

CREATE TABLE IF NOT EXISTS operations (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT,
  status TEXT NOT NULL CHECK (status IN ('planned','active','complete')),
  visibility TEXT NOT NULL CHECK (visibility IN ('open','restricted')),
  started_at TEXT,
  ended_at TEXT
);

CREATE TABLE IF NOT EXISTS operation_access_groups (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  operation_id TEXT NOT NULL,
  access_group_id TEXT NOT NULL,
  UNIQUE (operation_id, access_group_id),
  FOREIGN KEY (operation_id) REFERENCES operations(id),
  FOREIGN KEY (access_group_id) REFERENCES access_groups(id)
);

CREATE TABLE IF NOT EXISTS operation_tags (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  operation_id TEXT NOT NULL,
  tag_id TEXT NOT NULL,
  UNIQUE (operation_id, tag_id),
  FOREIGN KEY (operation_id) REFERENCES operations(id),
  FOREIGN KEY (tag_id) REFERENCES tags(id)
);

CREATE TABLE IF NOT EXISTS operation_targets (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  operation_id TEXT NOT NULL,
  target_id TEXT NOT NULL,
  UNIQUE (operation_id, target_id),
  FOREIGN KEY (operation_id) REFERENCES operations(id),
  FOREIGN KEY (target_id) REFERENCES targets(id)
);

CREATE TABLE IF NOT EXISTS steps (
  id TEXT PRIMARY KEY,
  operation_id TEXT NOT NULL,
  name TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','inProgress','done')),
  executed_at TEXT,
  FOREIGN KEY (operation_id) REFERENCES operations(id)
);

CREATE TABLE IF NOT EXISTS step_tools (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  step_id TEXT NOT NULL,
  tool_id TEXT NOT NULL,
  UNIQUE (step_id, tool_id),
  FOREIGN KEY (step_id) REFERENCES steps(id),
  FOREIGN KEY (tool_id) REFERENCES tools(id)
);

CREATE TABLE IF NOT EXISTS step_targets (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  step_id TEXT NOT NULL,
  target_id TEXT NOT NULL,
  in_scope INTEGER NOT NULL,
  UNIQUE (step_id, target_id),
  FOREIGN KEY (step_id) REFERENCES steps(id),
  FOREIGN KEY (target_id) REFERENCES targets(id)
);

CREATE TABLE IF NOT EXISTS outcomes (
  id TEXT PRIMARY KEY,
  step_id TEXT NOT NULL,
  verdict TEXT NOT NULL CHECK (verdict IN ('prevented','detected','logged','missed')),
  notes TEXT,
  recorded_at TEXT,
  FOREIGN KEY (step_id) REFERENCES steps(id)
);

CREATE TABLE IF NOT EXISTS outcome_tools (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  outcome_id TEXT NOT NULL,
  tool_id TEXT NOT NULL,
  UNIQUE (outcome_id, tool_id),
  FOREIGN KEY (outcome_id) REFERENCES outcomes(id),
  FOREIGN KEY (tool_id) REFERENCES tools(id)
);

CREATE TABLE IF NOT EXISTS outcome_log_sources (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  outcome_id TEXT NOT NULL,
  log_source_id TEXT NOT NULL,
  UNIQUE (outcome_id, log_source_id),
  FOREIGN KEY (outcome_id) REFERENCES outcomes(id),
  FOREIGN KEY (log_source_id) REFERENCES log_sources(id)
);

CREATE TABLE IF NOT EXISTS operation_layouts (
  operation_id TEXT PRIMARY KEY,
  column_order_json TEXT NOT NULL,
  FOREIGN KEY (operation_id) REFERENCES operations(id)
);

CREATE INDEX IF NOT EXISTS idx_techniques_tactic ON techniques(tactic_id);
CREATE INDEX IF NOT EXISTS idx_subtechniques_technique ON subtechniques(technique_id);
CREATE INDEX IF NOT EXISTS idx_actor_techniques_actor ON actor_techniques(actor_id);
CREATE INDEX IF NOT EXISTS idx_steps_operation ON steps(operation_id);
CREATE INDEX IF NOT EXISTS idx_outcomes_step ON outcomes(step_id);
CREATE INDEX IF NOT EXISTS idx_memberships_account ON memberships(account_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Outcome of one restore invocation: rows created or merged per category, and
/// how many membership links were skipped because one side was missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreSummary {
    pub cleared: bool,
    pub created: BTreeMap<String, usize>,
    pub merged: BTreeMap<String, usize>,
    pub skipped_memberships: usize,
}

impl RestoreSummary {
    fn record_created(&mut self, category: Category, count: usize) {
        if count > 0 {
            *self.created.entry(category.key().to_string()).or_default() += count;
        }
    }

    fn record_merged(&mut self, category: Category, count: usize) {
        if count > 0 {
            *self.merged.entry(category.key().to_string()).or_default() += count;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedSummary {
    pub inserted_tactics: usize,
    pub inserted_techniques: usize,
    pub inserted_subtechniques: usize,
    pub skipped_existing: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        if current_schema_version(&self.conn)? == 0 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            let now = now_rfc3339()?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now],
            )
            .context("failed to record migration version 1")?;
            tx.commit().context("failed to commit migration v1")?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Serialize the selected scope into a versioned snapshot envelope.
    ///
    /// Read-only; concurrent writes during serialization may yield mild
    /// cross-category skew, which is an accepted limitation. Either the full
    /// requested scope is serialized or the call fails.
    ///
    /// # Errors
    /// Returns [`SnapshotError::BackupFailed`] when any category read fails;
    /// no partial envelope is returned.
    pub fn backup(&self, scope: ScopeFlags) -> Result<SnapshotEnvelope, SnapshotError> {
        let mut payload = SnapshotPayload::default();

        if scope.taxonomy {
            payload.tactics = Some(self.list_tactics().map_err(backup_failed)?);
            payload.techniques = Some(self.list_techniques().map_err(backup_failed)?);
            payload.subtechniques = Some(self.list_subtechniques().map_err(backup_failed)?);
        }

        if scope.case_data {
            payload.actors = Some(self.list_actors().map_err(backup_failed)?);
            payload.actor_techniques = Some(self.list_actor_techniques().map_err(backup_failed)?);
            payload.tags = Some(self.list_tags().map_err(backup_failed)?);
            payload.tool_categories = Some(self.list_tool_categories().map_err(backup_failed)?);
            payload.tools = Some(self.list_tools().map_err(backup_failed)?);
            payload.log_sources = Some(self.list_log_sources().map_err(backup_failed)?);
            payload.targets = Some(self.list_targets().map_err(backup_failed)?);
            payload.operations = Some(self.list_operations().map_err(backup_failed)?);
            payload.steps = Some(self.list_steps().map_err(backup_failed)?);
            payload.outcomes = Some(self.list_outcomes().map_err(backup_failed)?);
            payload.layouts = Some(self.list_layouts().map_err(backup_failed)?);
        }

        if scope.accounts {
            payload.accounts = Some(self.list_accounts().map_err(backup_failed)?);
            payload.access_groups = Some(self.list_access_groups().map_err(backup_failed)?);
            payload.memberships = Some(self.list_memberships().map_err(backup_failed)?);
            payload.credentials = Some(self.list_credentials().map_err(backup_failed)?);
        }

        Ok(SnapshotEnvelope {
            format_version: SNAPSHOT_FORMAT_VERSION.to_string(),
            generated_at: OffsetDateTime::now_utc(),
            payload,
        })
    }

    /// Apply a validated payload to this store: all-or-nothing.
    ///
    /// Runs the read-only preflight, then executes the optional clear pass and
    /// the creation pass inside one transaction in dependency order. Foreign
    /// references are re-resolved inside the transaction; preflight results
    /// are never trusted across the gap. Not designed for concurrent
    /// execution against the same scope; callers must serialize restores.
    ///
    /// # Errors
    /// - [`SnapshotError::DanglingReference`] when a payload reference does
    ///   not resolve; nothing is left applied.
    /// - [`SnapshotError::TransactionFailure`] when the store rejects a write;
    ///   the transaction is rolled back.
    pub fn restore(
        &mut self,
        payload: &SnapshotPayload,
        scope: ScopeFlags,
        clear_before: bool,
    ) -> Result<RestoreSummary, SnapshotError> {
        self.preflight_access_groups(payload, scope)?;

        let first_phase =
            if clear_before { RestorePhase::Clearing } else { RestorePhase::Creating };
        let tx = self
            .conn
            .transaction()
            .map_err(|err| tx_failure(first_phase, err))?;

        let mut summary = RestoreSummary { cleared: clear_before, ..RestoreSummary::default() };
        if clear_before {
            clear_scope(&tx, scope).map_err(|err| tx_failure(RestorePhase::Clearing, err))?;
        }

        let mut ids = IdMap::default();
        for category in creation_order(scope) {
            restore_category(&tx, category, payload, &mut ids, &mut summary)?;
        }

        tx.commit().map_err(|err| tx_failure(RestorePhase::Committing, err))?;
        Ok(summary)
    }

    /// Every access-group reference of a restricted operation must resolve
    /// before anything is mutated: a late-discovered miss would strand a
    /// half-restored graph.
    fn preflight_access_groups(
        &self,
        payload: &SnapshotPayload,
        scope: ScopeFlags,
    ) -> Result<(), SnapshotError> {
        if !scope.case_data {
            return Ok(());
        }
        let Some(operations) = payload.operations.as_ref() else {
            return Ok(());
        };

        // Groups the restore itself will create are valid references: creation
        // order guarantees they exist before any operation row.
        let payload_groups: BTreeSet<&str> = if scope.accounts {
            payload.access_groups.iter().flatten().map(|group| group.id.as_str()).collect()
        } else {
            BTreeSet::new()
        };

        for operation in operations {
            if operation.visibility != Visibility::Restricted {
                continue;
            }
            for group in &operation.access_group_ids {
                if payload_groups.contains(group.as_str()) {
                    continue;
                }
                let exists = row_exists(&self.conn, Category::AccessGroup, group)
                    .map_err(|err| tx_failure(RestorePhase::Preflight, err))?;
                if !exists {
                    return Err(SnapshotError::DanglingReference {
                        category: Category::AccessGroup,
                        reference: group.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Insert baseline taxonomy rows that are not already present, keyed by
    /// stable external id. Idempotent; a concurrent first-call race cannot
    /// double-seed because the unique constraint makes the second insert a
    /// no-op. Baseline techniques reference their tactic by external id, and
    /// subtechniques their technique likewise.
    ///
    /// # Errors
    /// Returns an error when the baseline references an unknown parent or a
    /// write fails.
    pub fn seed_taxonomy(&mut self, baseline: &TaxonomyBaseline) -> Result<SeedSummary> {
        let tx = self.conn.transaction().context("failed to start taxonomy seed transaction")?;
        let mut summary = SeedSummary::default();

        for tactic in &baseline.tactics {
            let affected = tx
                .execute(
                    "INSERT OR IGNORE INTO tactics(id, external_id, name) VALUES (?1, ?2, ?3)",
                    params![mint_id(), tactic.external_id, tactic.name],
                )
                .context("failed to seed tactic")?;
            if affected > 0 {
                summary.inserted_tactics += 1;
            } else {
                summary.skipped_existing += 1;
            }
        }

        for technique in &baseline.techniques {
            let tactic_id = tx
                .query_row(
                    "SELECT id FROM tactics WHERE external_id = ?1",
                    params![technique.tactic_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .context("failed to look up seeded tactic")?
                .ok_or_else(|| {
                    anyhow!("taxonomy baseline references unknown tactic {}", technique.tactic_id)
                })?;
            let affected = tx
                .execute(
                    "INSERT OR IGNORE INTO techniques(id, external_id, name, tactic_id)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![mint_id(), technique.external_id, technique.name, tactic_id],
                )
                .context("failed to seed technique")?;
            if affected > 0 {
                summary.inserted_techniques += 1;
            } else {
                summary.skipped_existing += 1;
            }
        }

        for subtechnique in &baseline.subtechniques {
            let technique_id = tx
                .query_row(
                    "SELECT id FROM techniques WHERE external_id = ?1",
                    params![subtechnique.technique_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .context("failed to look up seeded technique")?
                .ok_or_else(|| {
                    anyhow!(
                        "taxonomy baseline references unknown technique {}",
                        subtechnique.technique_id
                    )
                })?;
            let affected = tx
                .execute(
                    "INSERT OR IGNORE INTO subtechniques(id, external_id, name, technique_id)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![mint_id(), subtechnique.external_id, subtechnique.name, technique_id],
                )
                .context("failed to seed subtechnique")?;
            if affected > 0 {
                summary.inserted_subtechniques += 1;
            } else {
                summary.skipped_existing += 1;
            }
        }

        tx.commit().context("failed to commit taxonomy seed transaction")?;
        Ok(summary)
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Row count per category, keyed by payload key.
    ///
    /// # Errors
    /// Returns an error when a count query fails.
    pub fn category_counts(&self) -> Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for category in Category::ALL {
            let query = format!("SELECT COUNT(*) FROM {}", table(category));
            let count: i64 = self
                .conn
                .query_row(&query, [], |row| row.get(0))
                .with_context(|| format!("failed to count rows in {}", table(category)))?;
            counts.insert(category.key().to_string(), usize::try_from(count).unwrap_or_default());
        }
        Ok(counts)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_tactics(&self) -> Result<Vec<Tactic>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, external_id, name FROM tactics ORDER BY external_id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Tactic { id: row.get(0)?, external_id: row.get(1)?, name: row.get(2)? })
        })?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_techniques(&self) -> Result<Vec<Technique>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, external_id, name, tactic_id FROM techniques ORDER BY external_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Technique {
                id: row.get(0)?,
                external_id: row.get(1)?,
                name: row.get(2)?,
                tactic_id: row.get(3)?,
            })
        })?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_subtechniques(&self) -> Result<Vec<Subtechnique>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, external_id, name, technique_id FROM subtechniques
             ORDER BY external_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Subtechnique {
                id: row.get(0)?,
                external_id: row.get(1)?,
                name: row.get(2)?,
                technique_id: row.get(3)?,
            })
        })?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_actors(&self) -> Result<Vec<Actor>> {
        let mut stmt =
            self.conn.prepare("SELECT id, name, description FROM actors ORDER BY name ASC, id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Actor { id: row.get(0)?, name: row.get(1)?, description: row.get(2)? })
        })?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_actor_techniques(&self) -> Result<Vec<ActorTechnique>> {
        let mut stmt = self
            .conn
            .prepare("SELECT actor_id, technique_id FROM actor_techniques ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(ActorTechnique { actor_id: row.get(0)?, technique_id: row.get(1)? })
        })?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        let mut stmt =
            self.conn.prepare("SELECT id, name, color FROM tags ORDER BY name ASC, id ASC")?;
        let rows = stmt
            .query_map([], |row| Ok(Tag { id: row.get(0)?, name: row.get(1)?, color: row.get(2)? }))?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_tool_categories(&self) -> Result<Vec<ToolCategory>> {
        let mut stmt =
            self.conn.prepare("SELECT id, name FROM tool_categories ORDER BY name ASC, id ASC")?;
        let rows =
            stmt.query_map([], |row| Ok(ToolCategory { id: row.get(0)?, name: row.get(1)? }))?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, category_id FROM tools ORDER BY name ASC, id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Tool { id: row.get(0)?, name: row.get(1)?, category_id: row.get(2)? })
        })?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_log_sources(&self) -> Result<Vec<LogSource>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, platform FROM log_sources ORDER BY name ASC, id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(LogSource { id: row.get(0)?, name: row.get(1)?, platform: row.get(2)? })
        })?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_targets(&self) -> Result<Vec<Target>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, address FROM targets ORDER BY name ASC, id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Target { id: row.get(0)?, name: row.get(1)?, address: row.get(2)? })
        })?;
        collect(rows)
    }

    /// Load operations with their embedded association id lists.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_operations(&self) -> Result<Vec<Operation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, status, visibility, started_at, ended_at
             FROM operations ORDER BY name ASC, id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let status_raw: String = row.get(3)?;
            let visibility_raw: String = row.get(4)?;

            records.push(Operation {
                id: id.clone(),
                name: row.get(1)?,
                description: row.get(2)?,
                status: OperationStatus::parse(&status_raw)
                    .ok_or_else(|| anyhow!("unknown operation status: {status_raw}"))?,
                visibility: Visibility::parse(&visibility_raw)
                    .ok_or_else(|| anyhow!("unknown operation visibility: {visibility_raw}"))?,
                access_group_ids: self.linked_ids(
                    "SELECT access_group_id FROM operation_access_groups
                     WHERE operation_id = ?1 ORDER BY id ASC",
                    &id,
                )?,
                tag_ids: self.linked_ids(
                    "SELECT tag_id FROM operation_tags WHERE operation_id = ?1 ORDER BY id ASC",
                    &id,
                )?,
                target_ids: self.linked_ids(
                    "SELECT target_id FROM operation_targets
                     WHERE operation_id = ?1 ORDER BY id ASC",
                    &id,
                )?,
                started_at: read_timestamp(row.get(5)?)?,
                ended_at: read_timestamp(row.get(6)?)?,
            });
        }

        Ok(records)
    }

    /// Load steps with their tool links and target assignments.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_steps(&self) -> Result<Vec<Step>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, operation_id, name, status, executed_at
             FROM steps ORDER BY operation_id ASC, id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let status_raw: String = row.get(3)?;

            records.push(Step {
                id: id.clone(),
                operation_id: row.get(1)?,
                name: row.get(2)?,
                status: StepStatus::parse(&status_raw)
                    .ok_or_else(|| anyhow!("unknown step status: {status_raw}"))?,
                tool_ids: self.linked_ids(
                    "SELECT tool_id FROM step_tools WHERE step_id = ?1 ORDER BY id ASC",
                    &id,
                )?,
                targets: self.step_target_assignments(&id)?,
                executed_at: read_timestamp(row.get(4)?)?,
            });
        }

        Ok(records)
    }

    /// Load outcomes with their tool and log-source links.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_outcomes(&self) -> Result<Vec<Outcome>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, step_id, verdict, notes, recorded_at
             FROM outcomes ORDER BY step_id ASC, id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let verdict_raw: String = row.get(2)?;

            records.push(Outcome {
                id: id.clone(),
                step_id: row.get(1)?,
                verdict: Verdict::parse(&verdict_raw)
                    .ok_or_else(|| anyhow!("unknown outcome verdict: {verdict_raw}"))?,
                notes: row.get(3)?,
                tool_ids: self.linked_ids(
                    "SELECT tool_id FROM outcome_tools WHERE outcome_id = ?1 ORDER BY id ASC",
                    &id,
                )?,
                log_source_ids: self.linked_ids(
                    "SELECT log_source_id FROM outcome_log_sources
                     WHERE outcome_id = ?1 ORDER BY id ASC",
                    &id,
                )?,
                recorded_at: read_timestamp(row.get(4)?)?,
            });
        }

        Ok(records)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_layouts(&self) -> Result<Vec<OperationLayout>> {
        let mut stmt = self.conn.prepare(
            "SELECT operation_id, column_order_json FROM operation_layouts
             ORDER BY operation_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let operation_id: String = row.get(0)?;
            let column_order_json: String = row.get(1)?;
            let column_order = serde_json::from_str(&column_order_json)
                .with_context(|| format!("invalid layout columns for operation {operation_id}"))?;
            records.push(OperationLayout { operation_id, column_order });
        }

        Ok(records)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, display_name, role, active FROM accounts ORDER BY email ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let role_raw: String = row.get(3)?;
            records.push(Account {
                id: row.get(0)?,
                email: row.get(1)?,
                display_name: row.get(2)?,
                role: AccountRole::parse(&role_raw)
                    .ok_or_else(|| anyhow!("unknown account role: {role_raw}"))?,
                active: row.get(4)?,
            });
        }

        Ok(records)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_access_groups(&self) -> Result<Vec<AccessGroup>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, description FROM access_groups ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(AccessGroup { id: row.get(0)?, name: row.get(1)?, description: row.get(2)? })
        })?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_memberships(&self) -> Result<Vec<Membership>> {
        let mut stmt = self
            .conn
            .prepare("SELECT account_id, access_group_id FROM memberships ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Membership { account_id: row.get(0)?, access_group_id: row.get(1)? })
        })?;
        collect(rows)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_credentials(&self) -> Result<Vec<Credential>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, account_id, username, secret FROM credentials
             ORDER BY account_id ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Credential {
                id: row.get(0)?,
                account_id: row.get(1)?,
                username: row.get(2)?,
                secret: row.get(3)?,
            })
        })?;
        collect(rows)
    }

    fn linked_ids(&self, query: &str, owner_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(query)?;
        let rows = stmt.query_map(params![owner_id], |row| row.get::<_, String>(0))?;
        collect(rows)
    }

    fn step_target_assignments(&self, step_id: &str) -> Result<Vec<TargetAssignment>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_id, in_scope FROM step_targets WHERE step_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![step_id], |row| {
            Ok(TargetAssignment { target_id: row.get(0)?, in_scope: row.get(1)? })
        })?;
        collect(rows)
    }
}

/// Payload-id → target-id mapping built while creating rows. Foreign
/// references resolve here first; rows that pre-exist in the target (taxonomy
/// out of scope, merged identities) resolve by store lookup instead.
#[derive(Debug, Default)]
struct IdMap {
    entries: BTreeMap<(Category, String), String>,
}

impl IdMap {
    fn insert(&mut self, category: Category, payload_id: &str, target_id: &str) {
        if !payload_id.trim().is_empty() {
            self.entries.insert((category, payload_id.to_string()), target_id.to_string());
        }
    }

    fn lookup(&self, category: Category, payload_id: &str) -> Option<&String> {
        self.entries.get(&(category, payload_id.to_string()))
    }
}

fn resolve(
    tx: &Transaction<'_>,
    ids: &IdMap,
    category: Category,
    payload_id: &str,
) -> Result<String, SnapshotError> {
    match try_resolve(tx, ids, category, payload_id)? {
        Some(target_id) => Ok(target_id),
        None => Err(SnapshotError::DanglingReference {
            category,
            reference: payload_id.to_string(),
        }),
    }
}

fn try_resolve(
    tx: &Transaction<'_>,
    ids: &IdMap,
    category: Category,
    payload_id: &str,
) -> Result<Option<String>, SnapshotError> {
    if let Some(target_id) = ids.lookup(category, payload_id) {
        return Ok(Some(target_id.clone()));
    }
    let exists = row_exists(tx, category, payload_id).map_err(creating)?;
    if exists {
        return Ok(Some(payload_id.to_string()));
    }
    Ok(None)
}

fn row_exists(conn: &Connection, category: Category, id: &str) -> rusqlite::Result<bool> {
    let query = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", table(category));
    conn.query_row(&query, params![id], |row| row.get(0))
}

fn table(category: Category) -> &'static str {
    match category {
        Category::Tactic => "tactics",
        Category::Technique => "techniques",
        Category::Subtechnique => "subtechniques",
        Category::Actor => "actors",
        Category::ActorTechnique => "actor_techniques",
        Category::Tag => "tags",
        Category::ToolCategory => "tool_categories",
        Category::Tool => "tools",
        Category::LogSource => "log_sources",
        Category::Target => "targets",
        Category::Operation => "operations",
        Category::Step => "steps",
        Category::Outcome => "outcomes",
        Category::Layout => "operation_layouts",
        Category::Account => "accounts",
        Category::AccessGroup => "access_groups",
        Category::Membership => "memberships",
        Category::Credential => "credentials",
    }
}

/// Delete every row of every in-scope category, dependents first. Join rows
/// owned by an entity go with that entity; join rows referencing a cleared
/// parent from another scope go with the parent so foreign keys stay intact.
fn clear_scope(tx: &Transaction<'_>, scope: ScopeFlags) -> rusqlite::Result<()> {
    for category in deletion_order(scope) {
        match category {
            Category::Outcome => {
                tx.execute("DELETE FROM outcome_tools", [])?;
                tx.execute("DELETE FROM outcome_log_sources", [])?;
                tx.execute("DELETE FROM outcomes", [])?;
            }
            Category::Step => {
                tx.execute("DELETE FROM step_tools", [])?;
                tx.execute("DELETE FROM step_targets", [])?;
                tx.execute("DELETE FROM steps", [])?;
            }
            Category::Layout => {
                tx.execute("DELETE FROM operation_layouts", [])?;
            }
            Category::Operation => {
                tx.execute("DELETE FROM operation_access_groups", [])?;
                tx.execute("DELETE FROM operation_tags", [])?;
                tx.execute("DELETE FROM operation_targets", [])?;
                tx.execute("DELETE FROM operations", [])?;
            }
            Category::Tool => {
                tx.execute("DELETE FROM tools", [])?;
            }
            Category::ToolCategory => {
                tx.execute("DELETE FROM tool_categories", [])?;
            }
            Category::LogSource => {
                tx.execute("DELETE FROM log_sources", [])?;
            }
            Category::Tag => {
                tx.execute("DELETE FROM tags", [])?;
            }
            Category::Target => {
                tx.execute("DELETE FROM targets", [])?;
            }
            Category::ActorTechnique => {
                tx.execute("DELETE FROM actor_techniques", [])?;
            }
            Category::Actor => {
                tx.execute("DELETE FROM actors", [])?;
            }
            Category::Subtechnique => {
                tx.execute("DELETE FROM subtechniques", [])?;
            }
            Category::Technique => {
                // Actor links live in the case-data scope but reference
                // techniques; a taxonomy-only clear must take them along.
                tx.execute("DELETE FROM actor_techniques", [])?;
                tx.execute("DELETE FROM techniques", [])?;
            }
            Category::Tactic => {
                tx.execute("DELETE FROM tactics", [])?;
            }
            Category::Membership => {
                tx.execute("DELETE FROM memberships", [])?;
            }
            Category::Credential => {
                tx.execute("DELETE FROM credentials", [])?;
            }
            Category::AccessGroup => {
                // Operations referencing cleared groups live in another scope.
                tx.execute("DELETE FROM operation_access_groups", [])?;
                tx.execute("DELETE FROM memberships", [])?;
                tx.execute("DELETE FROM access_groups", [])?;
            }
            Category::Account => {
                tx.execute("DELETE FROM accounts", [])?;
            }
        }
    }
    Ok(())
}

fn restore_category(
    tx: &Transaction<'_>,
    category: Category,
    payload: &SnapshotPayload,
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    match category {
        Category::Account => {
            if let Some(rows) = payload.accounts.as_deref() {
                upsert_accounts(tx, rows, ids, summary)?;
            }
        }
        Category::AccessGroup => {
            if let Some(rows) = payload.access_groups.as_deref() {
                upsert_access_groups(tx, rows, ids, summary)?;
            }
        }
        Category::Credential => {
            if let Some(rows) = payload.credentials.as_deref() {
                create_credentials(tx, rows, ids, summary)?;
            }
        }
        Category::Membership => {
            if let Some(rows) = payload.memberships.as_deref() {
                create_memberships(tx, rows, ids, summary)?;
            }
        }
        Category::Tactic => {
            if let Some(rows) = payload.tactics.as_deref() {
                create_tactics(tx, rows, ids, summary)?;
            }
        }
        Category::Technique => {
            if let Some(rows) = payload.techniques.as_deref() {
                create_techniques(tx, rows, ids, summary)?;
            }
        }
        Category::Subtechnique => {
            if let Some(rows) = payload.subtechniques.as_deref() {
                create_subtechniques(tx, rows, ids, summary)?;
            }
        }
        Category::Actor => {
            if let Some(rows) = payload.actors.as_deref() {
                create_actors(tx, rows, ids, summary)?;
            }
        }
        Category::ActorTechnique => {
            if let Some(rows) = payload.actor_techniques.as_deref() {
                create_actor_techniques(tx, rows, ids, summary)?;
            }
        }
        Category::Target => {
            if let Some(rows) = payload.targets.as_deref() {
                create_targets(tx, rows, ids, summary)?;
            }
        }
        Category::Tag => {
            if let Some(rows) = payload.tags.as_deref() {
                create_tags(tx, rows, ids, summary)?;
            }
        }
        Category::LogSource => {
            if let Some(rows) = payload.log_sources.as_deref() {
                create_log_sources(tx, rows, ids, summary)?;
            }
        }
        Category::ToolCategory => {
            if let Some(rows) = payload.tool_categories.as_deref() {
                create_tool_categories(tx, rows, ids, summary)?;
            }
        }
        Category::Tool => {
            if let Some(rows) = payload.tools.as_deref() {
                create_tools(tx, rows, ids, summary)?;
            }
        }
        Category::Operation => {
            if let Some(rows) = payload.operations.as_deref() {
                create_operations(tx, rows, ids, summary)?;
            }
        }
        Category::Layout => {
            if let Some(rows) = payload.layouts.as_deref() {
                upsert_layouts(tx, rows, ids, summary)?;
            }
        }
        Category::Step => {
            if let Some(rows) = payload.steps.as_deref() {
                create_steps(tx, rows, ids, summary)?;
            }
        }
        Category::Outcome => {
            if let Some(rows) = payload.outcomes.as_deref() {
                create_outcomes(tx, rows, ids, summary)?;
            }
        }
    }
    Ok(())
}

fn upsert_accounts(
    tx: &Transaction<'_>,
    rows: &[Account],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    let mut created = 0;
    let mut merged = 0;

    for row in rows {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM accounts WHERE email = ?1",
                params![row.email],
                |found| found.get(0),
            )
            .optional()
            .map_err(creating)?;

        match existing {
            Some(target_id) => {
                tx.execute(
                    "UPDATE accounts SET display_name = ?1, role = ?2, active = ?3 WHERE id = ?4",
                    params![row.display_name, row.role.as_str(), row.active, target_id],
                )
                .map_err(creating)?;
                ids.insert(Category::Account, &row.id, &target_id);
                merged += 1;
            }
            None => {
                let target_id = mint_id();
                tx.execute(
                    "INSERT INTO accounts(id, email, display_name, role, active)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![target_id, row.email, row.display_name, row.role.as_str(), row.active],
                )
                .map_err(creating)?;
                ids.insert(Category::Account, &row.id, &target_id);
                created += 1;
            }
        }
    }

    summary.record_created(Category::Account, created);
    summary.record_merged(Category::Account, merged);
    Ok(())
}

fn upsert_access_groups(
    tx: &Transaction<'_>,
    rows: &[AccessGroup],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    let mut created = 0;
    let mut merged = 0;

    for row in rows {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM access_groups WHERE name = ?1",
                params![row.name],
                |found| found.get(0),
            )
            .optional()
            .map_err(creating)?;

        match existing {
            Some(target_id) => {
                tx.execute(
                    "UPDATE access_groups SET description = ?1 WHERE id = ?2",
                    params![row.description, target_id],
                )
                .map_err(creating)?;
                ids.insert(Category::AccessGroup, &row.id, &target_id);
                merged += 1;
            }
            None => {
                let target_id = mint_id();
                tx.execute(
                    "INSERT INTO access_groups(id, name, description) VALUES (?1, ?2, ?3)",
                    params![target_id, row.name, row.description],
                )
                .map_err(creating)?;
                ids.insert(Category::AccessGroup, &row.id, &target_id);
                created += 1;
            }
        }
    }

    summary.record_created(Category::AccessGroup, created);
    summary.record_merged(Category::AccessGroup, merged);
    Ok(())
}

fn create_credentials(
    tx: &Transaction<'_>,
    rows: &[Credential],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let account_id = resolve(tx, ids, Category::Account, &row.account_id)?;
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO credentials(id, account_id, username, secret) VALUES (?1, ?2, ?3, ?4)",
            params![target_id, account_id, row.username, row.secret],
        )
        .map_err(creating)?;
        ids.insert(Category::Credential, &row.id, &target_id);
    }
    summary.record_created(Category::Credential, rows.len());
    Ok(())
}

/// Memberships are best-effort links: a side missing from the target store is
/// skipped and counted, never failed. See the restore summary.
fn create_memberships(
    tx: &Transaction<'_>,
    rows: &[Membership],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    let mut created = 0;

    for row in rows {
        let account = try_resolve(tx, ids, Category::Account, &row.account_id)?;
        let group = try_resolve(tx, ids, Category::AccessGroup, &row.access_group_id)?;
        match (account, group) {
            (Some(account_id), Some(group_id)) => {
                let affected = tx
                    .execute(
                        "INSERT OR IGNORE INTO memberships(account_id, access_group_id)
                         VALUES (?1, ?2)",
                        params![account_id, group_id],
                    )
                    .map_err(creating)?;
                if affected > 0 {
                    created += 1;
                }
            }
            _ => summary.skipped_memberships += 1,
        }
    }

    summary.record_created(Category::Membership, created);
    Ok(())
}

fn create_tactics(
    tx: &Transaction<'_>,
    rows: &[Tactic],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO tactics(id, external_id, name) VALUES (?1, ?2, ?3)",
            params![target_id, row.external_id, row.name],
        )
        .map_err(creating)?;
        ids.insert(Category::Tactic, &row.id, &target_id);
    }
    summary.record_created(Category::Tactic, rows.len());
    Ok(())
}

fn create_techniques(
    tx: &Transaction<'_>,
    rows: &[Technique],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let tactic_id = resolve(tx, ids, Category::Tactic, &row.tactic_id)?;
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO techniques(id, external_id, name, tactic_id) VALUES (?1, ?2, ?3, ?4)",
            params![target_id, row.external_id, row.name, tactic_id],
        )
        .map_err(creating)?;
        ids.insert(Category::Technique, &row.id, &target_id);
    }
    summary.record_created(Category::Technique, rows.len());
    Ok(())
}

fn create_subtechniques(
    tx: &Transaction<'_>,
    rows: &[Subtechnique],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let technique_id = resolve(tx, ids, Category::Technique, &row.technique_id)?;
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO subtechniques(id, external_id, name, technique_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![target_id, row.external_id, row.name, technique_id],
        )
        .map_err(creating)?;
        ids.insert(Category::Subtechnique, &row.id, &target_id);
    }
    summary.record_created(Category::Subtechnique, rows.len());
    Ok(())
}

fn create_actors(
    tx: &Transaction<'_>,
    rows: &[Actor],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO actors(id, name, description) VALUES (?1, ?2, ?3)",
            params![target_id, row.name, row.description],
        )
        .map_err(creating)?;
        ids.insert(Category::Actor, &row.id, &target_id);
    }
    summary.record_created(Category::Actor, rows.len());
    Ok(())
}

fn create_actor_techniques(
    tx: &Transaction<'_>,
    rows: &[ActorTechnique],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let actor_id = resolve(tx, ids, Category::Actor, &row.actor_id)?;
        let technique_id = resolve(tx, ids, Category::Technique, &row.technique_id)?;
        tx.execute(
            "INSERT INTO actor_techniques(actor_id, technique_id) VALUES (?1, ?2)",
            params![actor_id, technique_id],
        )
        .map_err(creating)?;
    }
    summary.record_created(Category::ActorTechnique, rows.len());
    Ok(())
}

fn create_targets(
    tx: &Transaction<'_>,
    rows: &[Target],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO targets(id, name, address) VALUES (?1, ?2, ?3)",
            params![target_id, row.name, row.address],
        )
        .map_err(creating)?;
        ids.insert(Category::Target, &row.id, &target_id);
    }
    summary.record_created(Category::Target, rows.len());
    Ok(())
}

fn create_tags(
    tx: &Transaction<'_>,
    rows: &[Tag],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO tags(id, name, color) VALUES (?1, ?2, ?3)",
            params![target_id, row.name, row.color],
        )
        .map_err(creating)?;
        ids.insert(Category::Tag, &row.id, &target_id);
    }
    summary.record_created(Category::Tag, rows.len());
    Ok(())
}

fn create_log_sources(
    tx: &Transaction<'_>,
    rows: &[LogSource],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO log_sources(id, name, platform) VALUES (?1, ?2, ?3)",
            params![target_id, row.name, row.platform],
        )
        .map_err(creating)?;
        ids.insert(Category::LogSource, &row.id, &target_id);
    }
    summary.record_created(Category::LogSource, rows.len());
    Ok(())
}

fn create_tool_categories(
    tx: &Transaction<'_>,
    rows: &[ToolCategory],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO tool_categories(id, name) VALUES (?1, ?2)",
            params![target_id, row.name],
        )
        .map_err(creating)?;
        ids.insert(Category::ToolCategory, &row.id, &target_id);
    }
    summary.record_created(Category::ToolCategory, rows.len());
    Ok(())
}

fn create_tools(
    tx: &Transaction<'_>,
    rows: &[Tool],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let category_id = resolve(tx, ids, Category::ToolCategory, &row.category_id)?;
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO tools(id, name, category_id) VALUES (?1, ?2, ?3)",
            params![target_id, row.name, category_id],
        )
        .map_err(creating)?;
        ids.insert(Category::Tool, &row.id, &target_id);
    }
    summary.record_created(Category::Tool, rows.len());
    Ok(())
}

fn create_operations(
    tx: &Transaction<'_>,
    rows: &[Operation],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO operations(id, name, description, status, visibility, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                target_id,
                row.name,
                row.description,
                row.status.as_str(),
                row.visibility.as_str(),
                timestamp_text(row.started_at)?,
                timestamp_text(row.ended_at)?,
            ],
        )
        .map_err(creating)?;

        for group in &row.access_group_ids {
            let group_id = resolve(tx, ids, Category::AccessGroup, group)?;
            tx.execute(
                "INSERT OR IGNORE INTO operation_access_groups(operation_id, access_group_id)
                 VALUES (?1, ?2)",
                params![target_id, group_id],
            )
            .map_err(creating)?;
        }
        for tag in &row.tag_ids {
            let tag_id = resolve(tx, ids, Category::Tag, tag)?;
            tx.execute(
                "INSERT OR IGNORE INTO operation_tags(operation_id, tag_id) VALUES (?1, ?2)",
                params![target_id, tag_id],
            )
            .map_err(creating)?;
        }
        for target in &row.target_ids {
            let linked_target_id = resolve(tx, ids, Category::Target, target)?;
            tx.execute(
                "INSERT OR IGNORE INTO operation_targets(operation_id, target_id) VALUES (?1, ?2)",
                params![target_id, linked_target_id],
            )
            .map_err(creating)?;
        }

        ids.insert(Category::Operation, &row.id, &target_id);
    }
    summary.record_created(Category::Operation, rows.len());
    Ok(())
}

fn upsert_layouts(
    tx: &Transaction<'_>,
    rows: &[OperationLayout],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    let mut created = 0;
    let mut merged = 0;

    for row in rows {
        let operation_id = resolve(tx, ids, Category::Operation, &row.operation_id)?;
        let column_order_json = serde_json::to_string(&row.column_order)
            .map_err(|err| tx_failure(RestorePhase::Creating, err))?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM operation_layouts WHERE operation_id = ?1)",
                params![operation_id],
                |found| found.get(0),
            )
            .map_err(creating)?;

        tx.execute(
            "INSERT INTO operation_layouts(operation_id, column_order_json) VALUES (?1, ?2)
             ON CONFLICT(operation_id) DO UPDATE SET column_order_json = excluded.column_order_json",
            params![operation_id, column_order_json],
        )
        .map_err(creating)?;

        if exists {
            merged += 1;
        } else {
            created += 1;
        }
    }

    summary.record_created(Category::Layout, created);
    summary.record_merged(Category::Layout, merged);
    Ok(())
}

fn create_steps(
    tx: &Transaction<'_>,
    rows: &[Step],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let operation_id = resolve(tx, ids, Category::Operation, &row.operation_id)?;
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO steps(id, operation_id, name, status, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                target_id,
                operation_id,
                row.name,
                row.status.as_str(),
                timestamp_text(row.executed_at)?,
            ],
        )
        .map_err(creating)?;

        for tool in &row.tool_ids {
            let tool_id = resolve(tx, ids, Category::Tool, tool)?;
            tx.execute(
                "INSERT OR IGNORE INTO step_tools(step_id, tool_id) VALUES (?1, ?2)",
                params![target_id, tool_id],
            )
            .map_err(creating)?;
        }
        for assignment in &row.targets {
            let linked_target_id = resolve(tx, ids, Category::Target, &assignment.target_id)?;
            tx.execute(
                "INSERT OR IGNORE INTO step_targets(step_id, target_id, in_scope)
                 VALUES (?1, ?2, ?3)",
                params![target_id, linked_target_id, assignment.in_scope],
            )
            .map_err(creating)?;
        }

        ids.insert(Category::Step, &row.id, &target_id);
    }
    summary.record_created(Category::Step, rows.len());
    Ok(())
}

fn create_outcomes(
    tx: &Transaction<'_>,
    rows: &[Outcome],
    ids: &mut IdMap,
    summary: &mut RestoreSummary,
) -> Result<(), SnapshotError> {
    for row in rows {
        let step_id = resolve(tx, ids, Category::Step, &row.step_id)?;
        let target_id = mint_id();
        tx.execute(
            "INSERT INTO outcomes(id, step_id, verdict, notes, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                target_id,
                step_id,
                row.verdict.as_str(),
                row.notes,
                timestamp_text(row.recorded_at)?,
            ],
        )
        .map_err(creating)?;

        for tool in &row.tool_ids {
            let tool_id = resolve(tx, ids, Category::Tool, tool)?;
            tx.execute(
                "INSERT OR IGNORE INTO outcome_tools(outcome_id, tool_id) VALUES (?1, ?2)",
                params![target_id, tool_id],
            )
            .map_err(creating)?;
        }
        for log_source in &row.log_source_ids {
            let log_source_id = resolve(tx, ids, Category::LogSource, log_source)?;
            tx.execute(
                "INSERT OR IGNORE INTO outcome_log_sources(outcome_id, log_source_id)
                 VALUES (?1, ?2)",
                params![target_id, log_source_id],
            )
            .map_err(creating)?;
        }

        ids.insert(Category::Outcome, &row.id, &target_id);
    }
    summary.record_created(Category::Outcome, rows.len());
    Ok(())
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn tx_failure(phase: RestorePhase, cause: impl Display) -> SnapshotError {
    SnapshotError::TransactionFailure { phase, cause: cause.to_string() }
}

fn creating(err: rusqlite::Error) -> SnapshotError {
    tx_failure(RestorePhase::Creating, err)
}

fn backup_failed(err: anyhow::Error) -> SnapshotError {
    SnapshotError::BackupFailed { cause: format!("{err:#}") }
}

fn timestamp_text(value: Option<OffsetDateTime>) -> Result<Option<String>, SnapshotError> {
    match value {
        Some(timestamp) => timestamp
            .format(&time::format_description::well_known::Rfc3339)
            .map(Some)
            .map_err(|err| tx_failure(RestorePhase::Creating, err)),
        None => Ok(None),
    }
}

fn read_timestamp(raw: Option<String>) -> Result<Option<OffsetDateTime>> {
    match raw {
        Some(raw) => {
            let parsed = OffsetDateTime::parse(&raw, &time::format_description::well_known::Rfc3339)
                .with_context(|| format!("invalid RFC3339 timestamp: {raw}"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}
