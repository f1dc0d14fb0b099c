//! Plain GET routes: the health probe and the compiled resources of each app.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{error::ApiError, state::AppState};

static X_CACHE: HeaderName = HeaderName::from_static("x-cache");

#[derive(Debug, Serialize)]
pub struct Health {
    ok: bool,
    version: &'static str,
    project: String,
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        project: state.compiler.project_name().to_string(),
    })
}

/// The app's HTML shell. `X-Cache` tells whether it came from the artifact
/// cache.
pub async fn base(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let rendered = state
        .compiler
        .render_client(&id)
        .await
        .map_err(|e| ApiError::classified(&e))?;
    let cache = HeaderValue::from_static(if rendered.cache_hit { "HIT" } else { "MISS" });
    tracing::debug!(app_id = %id, cache_hit = rendered.cache_hit, "served app shell");
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8")),
            (X_CACHE.clone(), cache),
        ],
        rendered.html,
    )
        .into_response())
}

pub async fn bundle(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let js = state
        .compiler
        .client_bundle(&id)
        .await
        .map_err(|e| ApiError::classified(&e))?;
    Ok((
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        js,
    )
        .into_response())
}

pub async fn metafile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .compiler
        .client_metafile(&id)
        .await
        .map(Json)
        .map_err(|e| ApiError::classified(&e))
}
