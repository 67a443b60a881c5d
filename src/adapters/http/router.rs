use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dimse::{DimseNetwork, DimseOperation, DimseRequest, QueryLevel, RemoteNode};
use http::{header, StatusCode};
use serde_json::json;

use super::status_mapper::retrieve_error_status;
use crate::pipeline::{InstanceRequest, RetrievalPipeline};
use crate::query::QueryService;

/// Shared handles for every route
#[derive(Clone)]
pub struct AppState {
    pub pipeline: RetrievalPipeline,
    pub query: QueryService,
    pub network: Arc<dyn DimseNetwork>,
    pub source: RemoteNode,
    pub target: RemoteNode,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/wadouri", get(wado_uri))
        .route("/rs/studies", get(find_studies))
        .route("/rs/studies/{study}/series", get(find_series))
        .route(
            "/rs/studies/{study}/series/{series}/instances",
            get(find_instances),
        )
        .route("/echo", get(echo))
        .route("/cache", get(cache_entries))
        .with_state(state)
}

async fn wado_uri(
    State(state): State<AppState>,
    Query(request): Query<InstanceRequest>,
) -> Response {
    match state.pipeline.serve(&request).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/dicom")], bytes).into_response(),
        Err(e) => {
            let status = retrieve_error_status(&e);
            tracing::warn!("WADO-URI request failed with {}: {}", status, e);
            (status, e.to_string()).into_response()
        }
    }
}

async fn find_studies(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Response {
    qido(&state, QueryLevel::Study, params).await
}

async fn find_series(
    State(state): State<AppState>,
    Path(study): Path<String>,
    Query(mut params): Query<BTreeMap<String, String>>,
) -> Response {
    params.insert("StudyInstanceUID".into(), study);
    qido(&state, QueryLevel::Series, params).await
}

async fn find_instances(
    State(state): State<AppState>,
    Path((study, series)): Path<(String, String)>,
    Query(mut params): Query<BTreeMap<String, String>>,
) -> Response {
    params.insert("StudyInstanceUID".into(), study);
    params.insert("SeriesInstanceUID".into(), series);
    qido(&state, QueryLevel::Image, params).await
}

async fn qido(state: &AppState, level: QueryLevel, params: BTreeMap<String, String>) -> Response {
    let matches = state.query.find(level, &params).await;
    (
        [(header::CONTENT_TYPE, "application/dicom+json")],
        Json(matches),
    )
        .into_response()
}

async fn echo(State(state): State<AppState>) -> Response {
    let request = DimseRequest::new(
        DimseOperation::Echo,
        state.source.clone(),
        state.target.clone(),
    );
    match state.network.execute(request).await {
        Ok(result) if result.code.is_usable() => {
            Json(json!({ "code": result.code, "target": state.target.ae_title })).into_response()
        }
        Ok(result) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "code": result.code, "message": result.message })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "message": e.to_string() })),
        )
            .into_response(),
    }
}

async fn cache_entries(State(state): State<AppState>) -> Response {
    match state.pipeline.cache().entries() {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            tracing::error!("Failed to list cache entries: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
