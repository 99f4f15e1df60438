//! # Feature: Web Dashboard
//!
//! Schema-driven editor for the feature documents. Every config is served as
//! long as `configs/schemas/<name>.schema.json` exists:
//!
//! - `GET /` form for `global_config`
//! - `GET /configs/?config=<name>` form for any config
//! - `GET /raw/configs?config=<name>` raw document
//! - `GET /raw/configs/schema?config=<name>` raw schema
//! - `GET /get/channel/?id=<id>` channel name lookup
//! - `POST /post/?config=<name>` replace a document after schema validation
//!
//! Saved documents are picked up by the feature poll loops.

use crate::config::DashboardConfig;
use crate::platform::ChatPlatform;
use crate::store::{validate_against_schema, ConfigStore};
use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

const GLOBAL_CONFIG: &str = "global_config";

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("unknown config '{0}'")]
    UnknownConfig(String),

    #[error("cannot save unknown config '{0}'")]
    UnknownSaveTarget(String),

    #[error("document does not match its schema")]
    SchemaMismatch(Vec<String>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        match self {
            DashboardError::UnknownConfig(_) => {
                (StatusCode::NOT_FOUND, Json(json!({"config": "Invalid"}))).into_response()
            }
            DashboardError::UnknownSaveTarget(_) => (
                StatusCode::NOT_FOUND,
                Json(json!({"saved": false, "config": false})),
            )
                .into_response(),
            DashboardError::SchemaMismatch(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"saved": false, "valid": false, "errors": errors})),
            )
                .into_response(),
            DashboardError::Internal(e) => {
                error!("[dashboard] {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}

type DashboardResult<T> = Result<T, DashboardError>;

#[derive(Clone)]
pub struct DashboardState {
    store: ConfigStore,
    /// `None` when running without the bot
    platform: Option<Arc<dyn ChatPlatform>>,
}

impl DashboardState {
    pub fn new(store: ConfigStore, platform: Option<Arc<dyn ChatPlatform>>) -> Self {
        DashboardState { store, platform }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigQuery {
    config: String,
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    id: String,
}

pub fn create_router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/configs/", get(config_form))
        .route("/raw/configs", get(raw_config))
        .route("/raw/configs/schema", get(raw_schema))
        .route("/get/channel/", get(channel_name))
        .route("/post/", post(save_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the dashboard until the listener fails
pub async fn serve(config: &DashboardConfig, state: DashboardState) -> anyhow::Result<()> {
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind dashboard to {}", address))?;
    info!("[dashboard] Listening on http://{}", address);
    axum::serve(listener, create_router(state))
        .await
        .context("Dashboard server failed")
}

async fn index(State(state): State<DashboardState>) -> DashboardResult<Html<String>> {
    render_form(&state, GLOBAL_CONFIG).await
}

async fn config_form(
    State(state): State<DashboardState>,
    Query(query): Query<ConfigQuery>,
) -> DashboardResult<Html<String>> {
    render_form(&state, &query.config).await
}

async fn raw_config(
    State(state): State<DashboardState>,
    Query(query): Query<ConfigQuery>,
) -> DashboardResult<Json<Value>> {
    require_config(&state, &query.config).await?;
    Ok(Json(state.store.read_document(&query.config).await))
}

async fn raw_schema(
    State(state): State<DashboardState>,
    Query(query): Query<ConfigQuery>,
) -> DashboardResult<Json<Value>> {
    require_config(&state, &query.config).await?;
    Ok(Json(state.store.read_schema(&query.config).await?))
}

async fn channel_name(
    State(state): State<DashboardState>,
    Query(query): Query<ChannelQuery>,
) -> Json<Value> {
    let channel = match (&state.platform, query.id.trim().parse::<u64>()) {
        (Some(platform), Ok(id)) => platform.resolve_channel(id).await,
        _ => None,
    };
    match channel {
        Some(channel) => Json(json!({"channel": {"id": channel.id, "name": channel.name}})),
        None => Json(json!({"channel": {}})),
    }
}

async fn save_config(
    State(state): State<DashboardState>,
    Query(query): Query<ConfigQuery>,
    Json(document): Json<Value>,
) -> DashboardResult<(StatusCode, Json<Value>)> {
    if state.store.resolve(&query.config).await?.is_none() {
        return Err(DashboardError::UnknownSaveTarget(query.config));
    }

    let schema = state.store.read_schema(&query.config).await?;
    validate_against_schema(&schema, &document).map_err(DashboardError::SchemaMismatch)?;

    state.store.write_document(&query.config, &document).await?;
    info!("[dashboard] Saved {}", query.config);
    Ok((StatusCode::CREATED, Json(json!({"saved": true}))))
}

async fn require_config(state: &DashboardState, name: &str) -> DashboardResult<()> {
    match state.store.resolve(name).await? {
        Some(_) => Ok(()),
        None => Err(DashboardError::UnknownConfig(name.to_string())),
    }
}

async fn render_form(state: &DashboardState, name: &str) -> DashboardResult<Html<String>> {
    require_config(state, name).await?;
    let schema = state.store.read_schema(name).await?;
    let document = state.store.read_document(name).await;
    Ok(Html(form_page(name, &schema, &document)))
}

/// JSON safe to inline in a `<script>` block
fn script_json(value: &Value) -> String {
    value.to_string().replace("</", "<\\/")
}

fn form_page(name: &str, schema: &Value, document: &Value) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>{name} - ranger dashboard</title>
  <script src="https://cdn.jsdelivr.net/npm/@json-editor/json-editor@latest/dist/jsoneditor.min.js"></script>
</head>
<body>
  <h1>{name}</h1>
  <div id="editor"></div>
  <button id="save">Save</button>
  <pre id="status"></pre>
  <script>
    const editor = new JSONEditor(document.getElementById("editor"), {{
      schema: {schema},
      startval: {document},
      theme: "html",
      disable_edit_json: false
    }});
    document.getElementById("save").addEventListener("click", async () => {{
      const response = await fetch("/post/?config={name}", {{
        method: "POST",
        headers: {{"Content-Type": "application/json"}},
        body: JSON.stringify(editor.getValue())
      }});
      document.getElementById("status").textContent = JSON.stringify(await response.json(), null, 2);
    }});
  </script>
</body>
</html>
"#,
        name = name,
        schema = script_json(schema),
        document = script_json(document),
    )
}
