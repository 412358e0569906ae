use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use ops_ledger_api::{
    BackupRequest, BackupResult, MigrateResult, OpsLedgerApi, RestoreRequest,
    API_CONTRACT_VERSION,
};
use ops_ledger_core::{AuditEvent, AuditSink, SnapshotError};
use ops_ledger_store_sqlite::{RestoreSummary, SchemaStatus};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: OpsLedgerApi,
    audit: FileAuditSink,
}

/// Appends one JSON line per audit event. Transport failures never fail the
/// invocation that produced the event.
#[derive(Debug, Clone, Default)]
struct FileAuditSink {
    path: Option<PathBuf>,
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: &AuditEvent) {
        let Some(path) = &self.path else {
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

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateHttpRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "ops-ledger-service")]
#[command(about = "Local HTTP service for the Ops Ledger backup/restore engine")]
struct Args {
    #[arg(long, default_value = "./ops_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long)]
    audit_log: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

fn operational_error(err: &anyhow::Error) -> ServiceError {
    ServiceError {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error_kind: None,
        error: format!("{err:#}"),
    }
}

fn engine_error(err: &SnapshotError) -> ServiceError {
    ServiceError {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error_kind: Some(err.kind()),
        error: err.to_string(),
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/snapshot/backup", post(snapshot_backup))
        .route("/v1/snapshot/restore", post(snapshot_restore))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = ServiceState {
        api: OpsLedgerApi::new(args.db),
        audit: FileAuditSink { path: args.audit_log },
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| operational_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateHttpRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| operational_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn snapshot_backup(
    State(state): State<ServiceState>,
    Json(request): Json<BackupRequest>,
) -> Result<Json<ServiceEnvelope<BackupResult>>, ServiceError> {
    let result =
        state.api.backup(&request, &state.audit).map_err(|err| engine_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn snapshot_restore(
    State(state): State<ServiceState>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<ServiceEnvelope<RestoreSummary>>, ServiceError> {
    let summary =
        state.api.restore(&request, &state.audit).map_err(|err| engine_error(&err))?;
    Ok(Json(envelope(summary)))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("ops-ledger-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn state_for(db_path: PathBuf) -> ServiceState {
        ServiceState { api: OpsLedgerApi::new(db_path), audit: FileAuditSink::default() }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(state_for(unique_temp_db_path()));

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = app(state_for(unique_temp_db_path()));

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/openapi")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/snapshot/backup"));
        assert!(body.contains("/v1/snapshot/restore"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn backup_and_restore_flow_round_trips_through_the_service() {
        let db_a = unique_temp_db_path();
        let db_b = unique_temp_db_path();
        let source_router = app(state_for(db_a.clone()));
        let replica_router = app(state_for(db_b.clone()));

        let backup_body = serde_json::json!({
            "scope": {"taxonomy": true, "caseData": true, "accounts": true},
            "actor": "service-tester"
        });
        let backup_response = match source_router
            .oneshot(json_request("/v1/snapshot/backup", backup_body))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("backup request failed: {err}"),
        };
        assert_eq!(backup_response.status(), StatusCode::OK);
        let backup_value = response_json(backup_response).await;
        let snapshot = backup_value
            .get("data")
            .and_then(|data| data.get("snapshot"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.snapshot in response: {backup_value}"))
            .to_string();

        let restore_body = serde_json::json!({
            "snapshot": snapshot,
            "scope": {"taxonomy": true, "caseData": true, "accounts": true},
            "clear_before_restore": true,
            "actor": "service-tester"
        });
        let restore_response = match replica_router
            .oneshot(json_request("/v1/snapshot/restore", restore_body))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("restore request failed: {err}"),
        };
        assert_eq!(restore_response.status(), StatusCode::OK);
        let restore_value = response_json(restore_response).await;
        assert!(restore_value
            .get("data")
            .and_then(|data| data.get("cleared"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false));

        let _ = std::fs::remove_file(&db_a);
        let _ = std::fs::remove_file(&db_b);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn engine_failures_map_to_bad_request_with_error_kind() {
        let db = unique_temp_db_path();
        let router = app(state_for(db.clone()));

        let body = serde_json::json!({
            "snapshot": "{broken",
            "scope": {"taxonomy": true, "caseData": true, "accounts": true},
            "clear_before_restore": false,
            "actor": "service-tester"
        });
        let response = match router.oneshot(json_request("/v1/snapshot/restore", body)).await {
            Ok(response) => response,
            Err(err) => panic!("restore request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(
            value.get("error_kind").and_then(serde_json::Value::as_str),
            Some("malformed_input")
        );

        let _ = std::fs::remove_file(&db);
    }
}
