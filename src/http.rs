//! Ops API: health, supervisor status and admin-only filter inspection.

use crate::auth::{AdminUser, AuthSettings, AuthUser};
use crate::catalog::CatalogGateway;
use crate::supervisor::StatusBoard;
use anyhow::Result;
use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use mongodb::bson::{doc, Bson};
use serde::Serialize;

#[derive(Clone)]
pub struct AppState {
    pub status: StatusBoard,
    pub gateway: CatalogGateway,
    pub auth: AuthSettings,
    pub collection_filters: String,
    pub collection_alerts: String,
}

impl FromRef<AppState> for AuthSettings {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

#[derive(Debug, Serialize)]
struct TopicStatus {
    topic: String,
    alive: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    topics: Vec<TopicStatus>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<AppState>, _user: AuthUser) -> Json<StatusResponse> {
    let board = state.status.read().await;
    let mut topics: Vec<TopicStatus> = board
        .iter()
        .map(|(topic, alive)| TopicStatus {
            topic: topic.clone(),
            alive: *alive,
        })
        .collect();
    topics.sort_by(|a, b| a.topic.cmp(&b.topic));
    Json(StatusResponse { topics })
}

async fn get_filters(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let templates = state
        .gateway
        .find(
            &state.collection_filters,
            doc! { "catalog": &state.collection_alerts },
            doc! { "_id": 1, "science_program_id": 1, "created": 1 },
        )
        .await
        .map_err(|err| (StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;
    let templates: Vec<serde_json::Value> = templates
        .into_iter()
        .map(|template| Bson::Document(template).into_relaxed_extjson())
        .collect();
    Ok(Json(serde_json::Value::Array(templates)))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(healthz))
        .route("/api/status", get(get_status))
        .route("/api/admin/filters", get(get_filters))
        .with_state(state)
}
