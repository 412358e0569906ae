use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use ops_ledger_core::{
    parse_snapshot, AuditAction, AuditEvent, AuditSink, RestorePhase, ScopeFlags, SnapshotError,
    TaxonomyBaseline,
};
use ops_ledger_store_sqlite::{
    IntegrityReport, RestoreSummary, SchemaStatus, SeedSummary, SqliteStore,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// External source of baseline classification rows. Read-only: the engine
/// never writes back to the provider.
pub trait TaxonomyProvider {
    /// # Errors
    /// Returns an error when the baseline cannot be produced.
    fn baseline(&self) -> Result<TaxonomyBaseline>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRequest {
    pub scope: ScopeFlags,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupResult {
    pub format_version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub categories: BTreeMap<String, usize>,
    pub snapshot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreRequest {
    pub snapshot: String,
    pub scope: ScopeFlags,
    pub clear_before_restore: bool,
    pub actor: String,
}

/// Process-facing surface of the backup/restore engine. Authorization is the
/// caller's concern: this surface trusts that the invoking layer has already
/// gated who may run backup and restore.
#[derive(Debug, Clone)]
pub struct OpsLedgerApi {
    db_path: PathBuf,
}

impl OpsLedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run store integrity probes.
    ///
    /// # Errors
    /// Returns an error when a probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }

    /// Row count per category.
    ///
    /// # Errors
    /// Returns an error when a count query fails.
    pub fn category_counts(&self) -> Result<BTreeMap<String, usize>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.category_counts()
    }

    /// Idempotent startup step: seed baseline taxonomy rows that are not yet
    /// present. Invoked once by the process entry point.
    ///
    /// # Errors
    /// Returns an error when the provider or the seeding transaction fails.
    pub fn seed_taxonomy(&self, provider: &dyn TaxonomyProvider) -> Result<SeedSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let baseline = provider.baseline()?;
        store.seed_taxonomy(&baseline)
    }

    /// Serialize the selected scope into a snapshot. Emits one audit event to
    /// `sink` whether the invocation succeeds or fails.
    ///
    /// # Errors
    /// Returns [`SnapshotError::BackupFailed`] when any category read fails;
    /// no partial snapshot is returned.
    pub fn backup(
        &self,
        request: &BackupRequest,
        sink: &dyn AuditSink,
    ) -> Result<BackupResult, SnapshotError> {
        let outcome = self.backup_inner(request);
        let event = match &outcome {
            Ok(_) => AuditEvent::ok(&request.actor, AuditAction::Backup, request.scope),
            Err(err) => AuditEvent::error(
                &request.actor,
                AuditAction::Backup,
                request.scope,
                err.to_string(),
            ),
        };
        sink.record(&event);
        outcome
    }

    fn backup_inner(&self, request: &BackupRequest) -> Result<BackupResult, SnapshotError> {
        let mut store = self.open_store().map_err(backup_failed)?;
        store.migrate().map_err(backup_failed)?;

        let envelope = store.backup(request.scope)?;
        let snapshot = serde_json::to_string_pretty(&envelope)
            .map_err(|err| SnapshotError::BackupFailed { cause: err.to_string() })?;

        Ok(BackupResult {
            format_version: envelope.format_version.clone(),
            generated_at: envelope.generated_at,
            categories: envelope.payload.category_counts(),
            snapshot,
        })
    }

    /// Validate a snapshot and apply it to the store: all-or-nothing. Emits
    /// one audit event to `sink` whether the invocation succeeds or fails.
    ///
    /// # Errors
    /// Returns the engine failure taxonomy: `MalformedInput`,
    /// `MissingPayload`, `SchemaViolation`, `DanglingReference`, or
    /// `TransactionFailure`. Nothing partially applied is ever left behind.
    pub fn restore(
        &self,
        request: &RestoreRequest,
        sink: &dyn AuditSink,
    ) -> Result<RestoreSummary, SnapshotError> {
        let outcome = self.restore_inner(request);
        let event = match &outcome {
            Ok(_) => AuditEvent::ok(&request.actor, AuditAction::Restore, request.scope),
            Err(err) => AuditEvent::error(
                &request.actor,
                AuditAction::Restore,
                request.scope,
                err.to_string(),
            ),
        };
        sink.record(&event);
        outcome
    }

    fn restore_inner(&self, request: &RestoreRequest) -> Result<RestoreSummary, SnapshotError> {
        let parsed = parse_snapshot(&request.snapshot)?;
        let mut store = self.open_store().map_err(store_unavailable)?;
        store.migrate().map_err(store_unavailable)?;
        store.restore(&parsed.payload, request.scope, request.clear_before_restore)
    }
}

fn backup_failed(err: anyhow::Error) -> SnapshotError {
    SnapshotError::BackupFailed { cause: format!("{err:#}") }
}

fn store_unavailable(err: anyhow::Error) -> SnapshotError {
    SnapshotError::TransactionFailure {
        phase: RestorePhase::Preflight,
        cause: format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ops_ledger_core::{Subtechnique, Tactic, Technique};
    use serde_json::Value;

    use super::*;

    #[derive(Debug, Default)]
    struct CollectingSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl AuditSink for CollectingSink {
        fn record(&self, event: &AuditEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event.clone());
            }
        }
    }

    impl CollectingSink {
        fn events(&self) -> Vec<AuditEvent> {
            match self.events.lock() {
                Ok(events) => events.clone(),
                Err(err) => panic!("audit sink lock poisoned: {err}"),
            }
        }
    }

    struct StaticProvider(TaxonomyBaseline);

    impl TaxonomyProvider for StaticProvider {
        fn baseline(&self) -> Result<TaxonomyBaseline> {
            Ok(self.0.clone())
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("ops-ledger-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn fixture_baseline() -> TaxonomyBaseline {
        TaxonomyBaseline {
            tactics: vec![Tactic {
                id: String::new(),
                external_id: "TA0002".to_string(),
                name: "Execution".to_string(),
            }],
            techniques: vec![Technique {
                id: String::new(),
                external_id: "T1059".to_string(),
                name: "Command and Scripting Interpreter".to_string(),
                tactic_id: "TA0002".to_string(),
            }],
            subtechniques: vec![Subtechnique {
                id: String::new(),
                external_id: "T1059.001".to_string(),
                name: "PowerShell".to_string(),
                technique_id: "T1059".to_string(),
            }],
        }
    }

    fn restore_text(api: &OpsLedgerApi, snapshot: &str, sink: &dyn AuditSink) -> RestoreSummary {
        let request = RestoreRequest {
            snapshot: snapshot.to_string(),
            scope: ScopeFlags::full(),
            clear_before_restore: false,
            actor: "tester".to_string(),
        };
        match api.restore(&request, sink) {
            Ok(summary) => summary,
            Err(err) => panic!("restore should succeed: {err}"),
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn seed_backup_restore_round_trip_emits_audit_events() {
        let db_a = unique_temp_db_path();
        let db_b = unique_temp_db_path();
        let source = OpsLedgerApi::new(db_a.clone());
        let replica = OpsLedgerApi::new(db_b.clone());
        let sink = CollectingSink::default();

        let seeded = match source.seed_taxonomy(&StaticProvider(fixture_baseline())) {
            Ok(summary) => summary,
            Err(err) => panic!("seed should succeed: {err}"),
        };
        assert_eq!(seeded.inserted_techniques, 1);

        let backup = match source.backup(
            &BackupRequest { scope: ScopeFlags::full(), actor: "tester".to_string() },
            &sink,
        ) {
            Ok(result) => result,
            Err(err) => panic!("backup should succeed: {err}"),
        };
        assert_eq!(backup.format_version, "2");
        assert_eq!(backup.categories.get("techniques"), Some(&1));

        let summary = restore_text(&replica, &backup.snapshot, &sink);
        assert_eq!(summary.created.get("techniques"), Some(&1));

        let counts = match replica.category_counts() {
            Ok(counts) => counts,
            Err(err) => panic!("counts should be readable: {err}"),
        };
        assert_eq!(counts.get("subtechniques"), Some(&1));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.succeeded));
        assert_eq!(events[0].action, AuditAction::Backup);
        assert_eq!(events[1].action, AuditAction::Restore);

        let _ = std::fs::remove_file(&db_a);
        let _ = std::fs::remove_file(&db_b);
    }

    // Test IDs: TAPI-002
    #[test]
    fn envelope_and_legacy_shapes_produce_identical_restore_outcomes() {
        let db_source = unique_temp_db_path();
        let source = OpsLedgerApi::new(db_source.clone());
        let sink = CollectingSink::default();

        if let Err(err) = source.seed_taxonomy(&StaticProvider(fixture_baseline())) {
            panic!("seed should succeed: {err}");
        }
        let backup = match source.backup(
            &BackupRequest { scope: ScopeFlags::full(), actor: "tester".to_string() },
            &sink,
        ) {
            Ok(result) => result,
            Err(err) => panic!("backup should succeed: {err}"),
        };

        // The same logical data as a legacy bare payload.
        let envelope_value: Value = match serde_json::from_str(&backup.snapshot) {
            Ok(value) => value,
            Err(err) => panic!("snapshot should be JSON: {err}"),
        };
        let legacy_text = match envelope_value.get("payload") {
            Some(payload) => payload.to_string(),
            None => panic!("snapshot should carry a payload"),
        };

        let db_current = unique_temp_db_path();
        let db_legacy = unique_temp_db_path();
        let current = OpsLedgerApi::new(db_current.clone());
        let legacy = OpsLedgerApi::new(db_legacy.clone());

        let current_summary = restore_text(&current, &backup.snapshot, &sink);
        let legacy_summary = restore_text(&legacy, &legacy_text, &sink);
        assert_eq!(current_summary, legacy_summary);

        let current_counts = match current.category_counts() {
            Ok(counts) => counts,
            Err(err) => panic!("counts should be readable: {err}"),
        };
        let legacy_counts = match legacy.category_counts() {
            Ok(counts) => counts,
            Err(err) => panic!("counts should be readable: {err}"),
        };
        assert_eq!(current_counts, legacy_counts);

        let _ = std::fs::remove_file(&db_source);
        let _ = std::fs::remove_file(&db_current);
        let _ = std::fs::remove_file(&db_legacy);
    }

    // Test IDs: TAPI-003
    #[test]
    fn failed_restore_emits_failed_audit_event() {
        let db = unique_temp_db_path();
        let api = OpsLedgerApi::new(db.clone());
        let sink = CollectingSink::default();

        let request = RestoreRequest {
            snapshot: "{broken".to_string(),
            scope: ScopeFlags::full(),
            clear_before_restore: false,
            actor: "tester".to_string(),
        };
        let err = match api.restore(&request, &sink) {
            Ok(summary) => panic!("restore should fail, created {:?}", summary.created),
            Err(err) => err,
        };
        assert_eq!(err.kind(), "malformed_input");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(!events[0].succeeded);
        assert_eq!(events[0].action, AuditAction::Restore);
        assert!(events[0].failure.is_some());

        let _ = std::fs::remove_file(&db);
    }
}
