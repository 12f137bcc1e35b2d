use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use release_history_api::{HistoryApi, HistoryFeed, HistoryRequest, API_CONTRACT_VERSION};
use release_history_core::{HistoryError, ReleaseId};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: HistoryApi,
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
struct ServiceErrorBody {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone)]
struct ServiceError {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Wire-level history query parameters; names match the public contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    items: Option<usize>,
    sort_order: Option<String>,
    last_timestamp: Option<i64>,
    filter: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "release-history-service")]
#[command(about = "HTTP service for the merged release history feed")]
struct Args {
    #[arg(long, default_value = "./release_history.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = ServiceErrorBody {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<HistoryError> for ServiceError {
    fn from(err: HistoryError) -> Self {
        let status = match &err {
            HistoryError::NotFound(_) => StatusCode::NOT_FOUND,
            HistoryError::Validation(_) => StatusCode::BAD_REQUEST,
            HistoryError::Query(_) | HistoryError::MalformedAudit(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
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
        .route("/v1/releases/:release_id/history", get(release_history))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = ServiceState { api: HistoryApi::new(args.db) };
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

async fn release_history(
    State(state): State<ServiceState>,
    Path(release_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryFeed>, ServiceError> {
    let release_id = Ulid::from_string(&release_id)
        .map(ReleaseId)
        .map_err(|err| {
            ServiceError::new(
                StatusCode::BAD_REQUEST,
                format!("invalid release id {release_id}: {err}"),
            )
        })?;
    let request = HistoryRequest {
        items: params.items,
        sort_order: params.sort_order,
        last_timestamp: params.last_timestamp,
        filter: params.filter,
    };
    let feed = state.api.release_history(release_id, &request)?;
    Ok(Json(feed))
}
