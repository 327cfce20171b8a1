//! HTTP/JSON surface: queries plus snapshot and replication administration.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use quill_engine::{Engine, EngineError, Response};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Builds the router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/databases", get(databases))
        .route("/", post(query_default))
        .route("/databases/{id}", post(query_database).get(download_database))
        .route("/download", get(download_default))
        .route("/snapshot", post(take_snapshot_default).get(download_snapshot_default))
        .route(
            "/databases/{id}/snapshot",
            post(take_snapshot_database).get(download_snapshot_database),
        )
        .route("/replications", get(replications_default))
        .route(
            "/replications/{name}",
            get(replication_by_name).delete(delete_replication_default),
        )
        .route("/databases/{id}/replications", get(replications_database))
        .route(
            "/databases/{id}/replications/{name}",
            get(replication_database_by_name).delete(delete_replication_database),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// One query in a request body.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// Either a single query object or an array of them.
///
/// An array always runs as one transaction and always answers with a
/// `results` wrapper, even for a single element.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QueryBody {
    One(QueryRequest),
    Many(Vec<QueryRequest>),
}

/// Error payload mapped onto an HTTP status.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        (self.status, self.message).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        let status = match &error {
            EngineError::Classify(_) | EngineError::Parameter(_) => StatusCode::BAD_REQUEST,
            EngineError::DatabaseNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::ReplicationDisabled => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl From<quill_replication::ReplicationError> for ApiError {
    fn from(error: quill_replication::ReplicationError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn databases(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "databases": state.engine.database_ids() }))
}

async fn query_default(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<HttpResponse, ApiError> {
    run_queries(&state, "", body).await
}

async fn query_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<QueryBody>,
) -> Result<HttpResponse, ApiError> {
    run_queries(&state, &id, body).await
}

async fn run_queries(state: &AppState, id: &str, body: QueryBody) -> Result<HttpResponse, ApiError> {
    let database = state.engine.database(id)?;
    match body {
        QueryBody::One(request) => {
            let stmt = state.engine.classifier().classify(&request.sql)?;
            let response = database.execute(&stmt, &request.params).await?;
            Ok(Json(response).into_response())
        }
        QueryBody::Many(requests) => {
            if requests.is_empty() {
                return Err(ApiError {
                    status: StatusCode::BAD_REQUEST,
                    message: "no queries found".to_string(),
                });
            }
            let mut batch = Vec::with_capacity(requests.len());
            for request in requests {
                let stmt = state.engine.classifier().classify(&request.sql)?;
                batch.push((stmt, request.params));
            }
            let responses: Vec<Response> = database.transaction(batch).await?;
            Ok(Json(json!({ "results": responses })).into_response())
        }
    }
}

async fn download_default(State(state): State<AppState>) -> Result<HttpResponse, ApiError> {
    download(&state, "").await
}

async fn download_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<HttpResponse, ApiError> {
    download(&state, &id).await
}

async fn download(state: &AppState, id: &str) -> Result<HttpResponse, ApiError> {
    let database = state.engine.database(id)?;
    let image = database.backup().await?;
    let filename = format!("{}_backup.db", database.id());
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        image,
    )
        .into_response())
}

async fn take_snapshot_default(State(state): State<AppState>) -> Result<HttpResponse, ApiError> {
    take_snapshot(&state, "").await
}

async fn take_snapshot_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<HttpResponse, ApiError> {
    take_snapshot(&state, &id).await
}

async fn take_snapshot(state: &AppState, id: &str) -> Result<HttpResponse, ApiError> {
    let database = state.engine.database(id)?;
    let snapshotter = database
        .snapshotter()
        .ok_or_else(|| ApiError::from(EngineError::ReplicationDisabled))?;
    let sequence = snapshotter.take_snapshot().await?;
    Ok(([("x-sequence", sequence.to_string())], StatusCode::OK).into_response())
}

async fn download_snapshot_default(State(state): State<AppState>) -> Result<HttpResponse, ApiError> {
    download_snapshot(&state, "").await
}

async fn download_snapshot_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<HttpResponse, ApiError> {
    download_snapshot(&state, &id).await
}

async fn download_snapshot(state: &AppState, id: &str) -> Result<HttpResponse, ApiError> {
    let database = state.engine.database(id)?;
    let snapshotter = database
        .snapshotter()
        .ok_or_else(|| ApiError::from(EngineError::ReplicationDisabled))?;
    let (sequence, payload) = snapshotter.latest().await?;
    let filename = format!("{}_snapshot_{}.db", database.id(), sequence);
    Ok((
        [
            ("x-sequence".to_string(), sequence.to_string()),
            (
                header::CONTENT_TYPE.to_string(),
                "application/octet-stream".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION.to_string(),
                format!("attachment; filename={filename}"),
            ),
        ],
        payload,
    )
        .into_response())
}

async fn replications_default(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    replications(&state, "", None).await
}

async fn replication_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    replications(&state, "", Some(&name)).await
}

async fn replications_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    replications(&state, &id, None).await
}

async fn replication_database_by_name(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    replications(&state, &id, Some(&name)).await
}

async fn replications(
    state: &AppState,
    id: &str,
    name: Option<&str>,
) -> Result<Json<Value>, ApiError> {
    let database = state.engine.database(id)?;
    let subscriber = database
        .subscriber()
        .ok_or_else(|| ApiError::from(EngineError::ReplicationDisabled))?;
    let info = subscriber.delivered_info(name).await?;
    Ok(Json(json!({ "replications": info })))
}

async fn delete_replication_default(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    delete_replication(&state, "", &name).await
}

async fn delete_replication_database(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    delete_replication(&state, &id, &name).await
}

async fn delete_replication(state: &AppState, id: &str, name: &str) -> Result<StatusCode, ApiError> {
    let database = state.engine.database(id)?;
    let subscriber = database
        .subscriber()
        .ok_or_else(|| ApiError::from(EngineError::ReplicationDisabled))?;
    subscriber.remove_consumer(name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_accepts_a_single_query_object() {
        let body: QueryBody =
            serde_json::from_str(r#"{"sql": "SELECT 1", "params": {"id": 1}}"#).unwrap();
        match body {
            QueryBody::One(request) => {
                assert_eq!(request.sql, "SELECT 1");
                assert_eq!(request.params["id"], json!(1));
            }
            QueryBody::Many(_) => panic!("expected a single query"),
        }
    }

    #[test]
    fn body_accepts_an_array_of_queries() {
        let body: QueryBody =
            serde_json::from_str(r#"[{"sql": "SELECT 1"}, {"sql": "SELECT 2"}]"#).unwrap();
        match body {
            QueryBody::Many(requests) => {
                assert_eq!(requests.len(), 2);
                assert!(requests[0].params.is_empty());
            }
            QueryBody::One(_) => panic!("expected an array"),
        }
    }

    #[test]
    fn engine_errors_map_to_statuses() {
        let not_found = ApiError::from(EngineError::DatabaseNotFound("x".into()));
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let disabled = ApiError::from(EngineError::ReplicationDisabled);
        assert_eq!(disabled.status, StatusCode::BAD_REQUEST);

        let parameter = ApiError::from(EngineError::Parameter("missing".into()));
        assert_eq!(parameter.status, StatusCode::BAD_REQUEST);
    }
}
