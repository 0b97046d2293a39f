use std::{fmt, net::SocketAddr, str::FromStr};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::{
    config::Config,
    document::DocumentStore,
    entity::{EntityKey, EntityType, Env},
    error::{Result, StoreError},
    events::{ChangeNotification, PushEnvelope},
    index::{self, IndexPointer, IndexWriter},
    object_store::{SharedStore, open_store},
    observability,
    rules::{Dispatcher, RulesEngine, secrets},
};

/// Which push handlers a service instance mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Indices,
    Rules,
    #[default]
    All,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Indices => "indices",
            Role::Rules => "rules",
            Role::All => "all",
        }
    }

    fn indexes(self) -> bool {
        matches!(self, Role::Indices | Role::All)
    }

    fn evaluates_rules(self) -> bool {
        matches!(self, Role::Rules | Role::All)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "indices" | "index" => Ok(Role::Indices),
            "rules" => Ok(Role::Rules),
            "all" => Ok(Role::All),
            other => Err(StoreError::Config(format!(
                "unknown role '{other}' (expected indices, rules or all)"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    store: SharedStore,
    documents: DocumentStore,
    indices: Option<IndexWriter>,
    rules: Option<RulesEngine>,
}

impl AppState {
    pub fn new(store: SharedStore, config: &Config, role: Role) -> Result<Self> {
        let indices = role
            .indexes()
            .then(|| IndexWriter::new(store.clone(), config.retry));
        let rules = if role.evaluates_rules() {
            let dispatcher = Dispatcher::new(&config.rules, secrets::from_config(config)?)?;
            Some(RulesEngine::new(
                store.clone(),
                config.retry,
                config.rules.clone(),
                dispatcher,
            ))
        } else {
            None
        };
        Ok(Self {
            documents: DocumentStore::new(store.clone(), config.retry),
            store,
            indices,
            rules,
        })
    }
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(observability::metrics_handler))
        .route("/v1/{env}/{entity}/{id}", get(get_snapshot))
        .route(
            "/v1/{env}/{entity}/indices/{dimension}/{bucket}",
            get(list_bucket),
        );
    if state.indices.is_some() {
        app = app.route("/v1/events/indices", post(index_event));
    }
    if state.rules.is_some() {
        app = app.route("/v1/events/rules", post(rules_event));
    }
    app.with_state(state)
        .layer(middleware::from_fn(observability::track_http_metrics))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(config: Config, role: Role) -> Result<()> {
    let store = open_store(&config.bucket, &config.gcp)?;
    let state = AppState::new(store, &config, role)?;
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, role = %role, bucket = %config.bucket, "starting bucketdb service");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| StoreError::Storage(err.to_string()))?;
    info!("bucketdb service stopped");
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

fn entity_key(env: &str, entity: &str, id: String) -> Result<EntityKey> {
    let env: Env = env.parse()?;
    let entity_type: EntityType = entity.parse()?;
    EntityKey::new(env, entity_type, id)
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path((env, entity, id)): Path<(String, String, String)>,
) -> Result<Json<Value>> {
    let key = entity_key(&env, &entity, id)?;
    match state.documents.get(&key).await? {
        Some(snapshot) => Ok(Json(snapshot.to_value())),
        None => Err(StoreError::NotFound(key.to_string())),
    }
}

async fn list_bucket(
    State(state): State<AppState>,
    Path((env, entity, dimension, bucket)): Path<(String, String, String, String)>,
) -> Result<Json<Vec<IndexPointer>>> {
    let env: Env = env.parse()?;
    let entity_type: EntityType = entity.parse()?;
    let pointers =
        index::read_bucket(state.store.as_ref(), env, entity_type, &dimension, &bucket).await?;
    Ok(Json(pointers))
}

/// Decodes a push body. Anything unusable is logged, counted and turned into
/// the acknowledgement body.
fn decode_push(handler: &'static str, body: &[u8]) -> std::result::Result<ChangeNotification, Value> {
    let envelope = match PushEnvelope::parse(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(handler, error = %err, "dropping undecodable push");
            observability::record_event(handler, "malformed");
            return Err(json!({ "status": "malformed", "message": err.to_string() }));
        }
    };
    match envelope.decode() {
        Ok(notification) => {
            debug!(handler, message_id = ?envelope.message_id(), object = %notification.name, "received change notification");
            Ok(notification)
        }
        Err(err) => {
            warn!(handler, message_id = ?envelope.message_id(), error = %err, "dropping push without a usable notification");
            observability::record_event(handler, "malformed");
            Err(json!({ "status": "malformed", "message": err.to_string() }))
        }
    }
}

// Push handlers always answer 200; failures are logged and counted instead.

async fn index_event(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    const HANDLER: &str = "indices";
    let notification = match decode_push(HANDLER, &body) {
        Ok(notification) => notification,
        Err(response) => return Json(response),
    };
    let Some(writer) = state.indices.as_ref() else {
        return Json(json!({ "status": "disabled" }));
    };
    match writer.handle(&notification).await {
        Ok(report) => {
            observability::record_event(HANDLER, "ok");
            Json(json!({ "status": "ok", "report": report }))
        }
        Err(err) => {
            error!(object = %notification.name, error = %err, "index update failed");
            observability::record_event(HANDLER, "error");
            Json(json!({ "status": "error", "message": err.to_string() }))
        }
    }
}

async fn rules_event(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    const HANDLER: &str = "rules";
    let notification = match decode_push(HANDLER, &body) {
        Ok(notification) => notification,
        Err(response) => return Json(response),
    };
    let Some(engine) = state.rules.as_ref() else {
        return Json(json!({ "status": "disabled" }));
    };
    match engine.handle(&notification).await {
        Ok(report) => {
            observability::record_event(HANDLER, "ok");
            Json(json!({ "status": "ok", "report": report }))
        }
        Err(err) => {
            error!(object = %notification.name, error = %err, "rule evaluation failed");
            observability::record_event(HANDLER, "error");
            Json(json!({ "status": "error", "message": err.to_string() }))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_parse_and_gate_handlers() {
        assert_eq!("Indices".parse::<Role>().unwrap(), Role::Indices);
        assert_eq!("rules".parse::<Role>().unwrap(), Role::Rules);
        assert!("both".parse::<Role>().is_err());
        assert!(Role::All.indexes() && Role::All.evaluates_rules());
        assert!(!Role::Rules.indexes());
        assert!(!Role::Indices.evaluates_rules());
    }
}
