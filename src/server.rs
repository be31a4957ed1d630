use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State, rejection::{JsonRejection, QueryRejection}},
    http::request::Parts,
    routing::{get, post},
};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::signal;

use crate::broker::sqlite::SqliteConnector;
use crate::config::{self, EngineConfig};
use crate::console::{Console, DeleteSummary, ResubmitSummary, selection_from};
use crate::error::Error;
use crate::models::{
    EntityCounters, EntityRef, Inventory, MessagePage, SequenceNumber, SubQueue,
};

/// Run the HTTP server on the given port
pub async fn run_server(port: u16) -> anyhow::Result<()> {
    let engine_cfg = EngineConfig::from_env()?;
    let console = Arc::new(Console::new(Arc::new(SqliteConnector), engine_cfg));
    let app = app_router(console);

    let addr = SocketAddr::from((config::bind_ip(), port));
    tracing::info!("Listening on {} - Use Ctrl+C to quit.", addr);
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind address: {e}");
        anyhow!("Bind error: {e}")
    })?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, shutting down gracefully...");
            }
        })
        .await
        .map_err(|e| {
            tracing::error!("Server error: {e}");
            anyhow!("Server error: {e}")
        })?;
    Ok(())
}

/// Construct the Axum `Router` for the console API, injecting shared state.
pub fn app_router(console: Arc<Console>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/connect", post(connect))
        .route("/api/entities", get(list_entities))
        // Queues
        .route(
            "/api/queues/{queue}/messages",
            get(peek_messages).delete(delete_messages),
        )
        .route("/api/queues/{queue}/resubmit", post(resubmit_messages))
        .route("/api/queues/{queue}/details", get(entity_details))
        // Topic subscriptions
        .route(
            "/api/topics/{topic}/subscriptions/{subscription}/messages",
            get(peek_messages).delete(delete_messages),
        )
        .route(
            "/api/topics/{topic}/subscriptions/{subscription}/resubmit",
            post(resubmit_messages),
        )
        .route(
            "/api/topics/{topic}/subscriptions/{subscription}/details",
            get(entity_details),
        )
        .with_state(console)
}

/// Entity addressed by the route: `{queue}` or `{topic}` + `{subscription}`.
struct Entity(EntityRef);

impl<S> FromRequestParts<S> for Entity
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(params) = Path::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|e| Error::invalid(e.body_text()))?;
        let entity = match (
            params.get("queue"),
            params.get("topic"),
            params.get("subscription"),
        ) {
            (Some(queue), None, None) => EntityRef::queue(queue),
            (None, Some(topic), Some(sub)) => EntityRef::subscription(topic, sub),
            _ => return Err(Error::invalid("unrecognised entity path")),
        };
        Ok(Entity(entity))
    }
}

// Request payload for connecting to a broker
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectBody {
    connection_string: String,
}

// Query parameters for peeking messages
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeekParams {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    is_dlq: bool,
}

// Request payload for deleting messages
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteBody {
    #[serde(default)]
    sequence_numbers: Option<Vec<SequenceNumber>>,
    #[serde(default)]
    all: bool,
    #[serde(default)]
    is_dlq: bool,
}

// Request payload for resubmitting dead-lettered messages
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResubmitBody {
    #[serde(default)]
    sequence_numbers: Option<Vec<SequenceNumber>>,
    #[serde(default)]
    all: bool,
}

// Validate the credential and make it the active session
async fn connect(
    State(console): State<Arc<Console>>,
    body: Result<Json<ConnectBody>, JsonRejection>,
) -> Result<Json<Value>, Error> {
    let Json(body) = body?;
    console.connect(SecretString::from(body.connection_string)).await?;
    Ok(Json(json!({ "success": true })))
}

// Queues and topics with their subscriptions and counters
async fn list_entities(State(console): State<Arc<Console>>) -> Result<Json<Inventory>, Error> {
    Ok(Json(console.list_entities().await?))
}

// One page of messages from the active or dead-letter sub-queue
async fn peek_messages(
    Entity(entity): Entity,
    params: Result<Query<PeekParams>, QueryRejection>,
    State(console): State<Arc<Console>>,
) -> Result<Json<MessagePage>, Error> {
    let Query(params) = params?;
    let sub_queue = SubQueue::from_dlq_flag(params.is_dlq);
    let page = console.peek_messages(&entity, sub_queue, params.page).await?;
    Ok(Json(page))
}

// Fresh counters for a single entity
async fn entity_details(
    Entity(entity): Entity,
    State(console): State<Arc<Console>>,
) -> Result<Json<EntityCounters>, Error> {
    Ok(Json(console.entity_details(&entity).await?))
}

// Delete selected messages, or all of them
async fn delete_messages(
    Entity(entity): Entity,
    State(console): State<Arc<Console>>,
    body: Result<Json<DeleteBody>, JsonRejection>,
) -> Result<Json<DeleteSummary>, Error> {
    let Json(body) = body?;
    let selection = selection_from(body.sequence_numbers, body.all)?;
    let sub_queue = SubQueue::from_dlq_flag(body.is_dlq);
    let result = console.delete_messages(&entity, sub_queue, &selection).await?;
    Ok(Json(DeleteSummary::from(&result)))
}

// Resubmit dead-lettered messages to the entity's main path
async fn resubmit_messages(
    Entity(entity): Entity,
    State(console): State<Arc<Console>>,
    body: Result<Json<ResubmitBody>, JsonRejection>,
) -> Result<Json<ResubmitSummary>, Error> {
    let Json(body) = body?;
    let selection = selection_from(body.sequence_numbers, body.all)?;
    let result = console.resubmit_messages(&entity, &selection).await?;
    Ok(Json(ResubmitSummary::from(&result)))
}
