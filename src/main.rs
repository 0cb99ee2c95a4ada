//! Collab Sync Server
//!
//! Serves the collaboration authority over:
//! - a JSON HTTP API with long-polling pulls
//! - a WebSocket bridge onto the in-process message bus
//!
//! Documents are plain text, persisted in a sled database.

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response as HttpResponse},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use collab_sync::storage::{DocumentMetadata, StorageError};
use collab_sync::sync::manager::ManagerStats;
use collab_sync::sync::protocol::{BusCodec, ErrorCode, Request, Response, PROTOCOL_VERSION};
use collab_sync::{
    serve, DocumentStore, Fail, LocalBus, Manager, ServerConfig, TextSchema, Transport,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    manager: Arc<Manager<TextSchema>>,
    store: DocumentStore,
    bus: LocalBus,
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    manager: ManagerStats,
    pending_writes: usize,
}

#[derive(Debug, Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentMetadata>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct CreateDocumentRequest {
    name: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct DocumentQuery {
    user: Option<String>,
}

#[derive(Debug, Serialize)]
struct DocumentResponse {
    doc: String,
    version: u64,
    users: usize,
    manager_id: String,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    version: u64,
    user: Option<String>,
    manager: String,
}

#[derive(Debug, Serialize)]
struct EventsResponse {
    version: u64,
    steps: Vec<String>,
    client_ids: Vec<String>,
    users: usize,
}

#[derive(Debug, Deserialize)]
struct PushRequest {
    version: u64,
    steps: Vec<String>,
    client_id: String,
    user: Option<String>,
    manager: String,
}

#[derive(Debug, Deserialize)]
struct BusQuery {
    address: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    error: String,
}

/// Error returned by the HTTP handlers
struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

impl From<Fail> for ApiError {
    fn from(fail: Fail) -> Self {
        let status = match fail {
            Fail::DocumentNotFound(_) => StatusCode::NOT_FOUND,
            Fail::OutdatedVersion => StatusCode::CONFLICT,
            Fail::HistoryNotAvailable => StatusCode::GONE,
            Fail::InvalidVersion | Fail::ApplyFailed(_) => StatusCode::BAD_REQUEST,
            Fail::IncorrectManager => StatusCode::PRECONDITION_FAILED,
            Fail::ManagerDestroyed | Fail::ManagerUnresponsive => StatusCode::SERVICE_UNAVAILABLE,
            Fail::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: ErrorCode::from(&fail),
            message: fail.to_string(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        let status = match err {
            StorageError::AlreadyExists(_) => StatusCode::CONFLICT,
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: ErrorCode::Storage,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        let body = ErrorBody {
            code: self.code as u16,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn unexpected(response: Response) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: ErrorCode::Unknown,
        message: format!("Unexpected response: {:?}", response),
    }
}

fn user_or_anonymous(user: Option<String>) -> String {
    user.unwrap_or_else(|| "anonymous".to_string())
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: if state.manager.is_destroyed() {
            "shutting-down".to_string()
        } else {
            "healthy".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        manager: state.manager.stats(),
        pending_writes: state.store.pending_writes(),
    })
}

/// List persisted documents
async fn list_documents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DocumentListResponse>, ApiError> {
    let documents = state.store.list_documents()?;
    let total = documents.len();
    Ok(Json(DocumentListResponse { documents, total }))
}

/// Create a document
async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentMetadata>), ApiError> {
    let meta = state
        .store
        .create_document(&payload.name, &payload.content)?;
    info!("Created document: {}", payload.name);
    Ok((StatusCode::CREATED, Json(meta)))
}

/// Fetch a document and the manager id
async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(doc_name): Path<String>,
    Query(query): Query<DocumentQuery>,
) -> Result<Json<DocumentResponse>, ApiError> {
    let request = Request::GetDocument {
        doc_name,
        user_id: user_or_anonymous(query.user),
    };
    match state.manager.handle_request(request).await? {
        Response::Document {
            doc,
            version,
            users,
            manager_id,
        } => Ok(Json(DocumentResponse {
            doc,
            version,
            users,
            manager_id,
        })),
        other => Err(unexpected(other)),
    }
}

/// Long-poll for steps after `version`
async fn pull_events(
    State(state): State<Arc<AppState>>,
    Path(doc_name): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let request = Request::PullEvents {
        doc_name,
        user_id: user_or_anonymous(query.user),
        version: query.version,
        manager_id: query.manager,
    };
    match state.manager.handle_request(request).await? {
        Response::Events {
            version,
            steps,
            client_ids,
            users,
        } => Ok(Json(EventsResponse {
            version,
            steps,
            client_ids,
            users,
        })),
        other => Err(unexpected(other)),
    }
}

/// Submit steps made against `version`
async fn push_events(
    State(state): State<Arc<AppState>>,
    Path(doc_name): Path<String>,
    Json(payload): Json<PushRequest>,
) -> Result<StatusCode, ApiError> {
    let request = Request::PushEvents {
        doc_name,
        user_id: user_or_anonymous(payload.user),
        version: payload.version,
        steps: payload.steps,
        client_id: payload.client_id,
        manager_id: payload.manager,
    };
    match state.manager.handle_request(request).await? {
        Response::Pushed => Ok(StatusCode::NO_CONTENT),
        other => Err(unexpected(other)),
    }
}

// ============================================================================
// WEBSOCKET BUS BRIDGE
// ============================================================================

/// Check that a socket may bind `address`: not empty, not one of the
/// manager's addresses, and not held by another socket.
fn check_bus_address(state: &AppState, address: &str) -> Result<(), ApiError> {
    if address.is_empty() || address == state.manager.address() || address == state.manager.id()
    {
        return Err(ApiError {
            status: StatusCode::FORBIDDEN,
            code: ErrorCode::Unknown,
            message: format!("Bus address {:?} is reserved", address),
        });
    }
    if state.bus.subscriber_count(address) > 0 {
        return Err(ApiError {
            status: StatusCode::CONFLICT,
            code: ErrorCode::Unknown,
            message: format!("Bus address {:?} is already bound", address),
        });
    }
    Ok(())
}

/// WebSocket upgrade handler
async fn bus_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<BusQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<HttpResponse, ApiError> {
    check_bus_address(&state, &query.address)?;
    info!("Bus connection for address: {}", query.address);
    Ok(ws.on_upgrade(move |socket| handle_bus_socket(socket, query.address, state)))
}

/// Relay frames between one socket and the bus.
///
/// Messages from the socket are sent from `address`; replies go back in
/// the encoding the client last used.
async fn handle_bus_socket(socket: WebSocket, address: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut inbox = state.bus.subscribe(&address);
    let mut json = false;

    loop {
        tokio::select! {
            Some(message) = inbox.recv() => {
                let frame = if json {
                    BusCodec::encode_json(&message).map(Message::Text)
                } else {
                    BusCodec::encode(&message).map(|bytes| Message::Binary(bytes.to_vec()))
                };
                match frame {
                    Ok(frame) => {
                        if ws_sender.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode message for {}: {}", address, e),
                }
            }
            incoming = ws_receiver.next() => {
                let decoded = match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        json = false;
                        BusCodec::decode(&data)
                    }
                    Some(Ok(Message::Text(text))) => {
                        json = true;
                        BusCodec::decode_json(&text)
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered automatically
                    Some(Ok(_)) => continue,
                };

                match decoded {
                    Ok(mut message) => {
                        message.from = address.clone();
                        if let Err(e) = state.bus.transmit(message) {
                            warn!("Failed to relay message from {}: {}", address, e);
                        }
                    }
                    Err(e) => debug!("Invalid frame from {}: {}", address, e),
                }
            }
        }
    }

    info!("Bus connection {} closed", address);
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

/// Wait for ctrl-c, then destroy the manager. Parked pulls are answered
/// before connections drain.
async fn shutdown_signal(manager: Arc<Manager<TextSchema>>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    manager.destroy().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_sync=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    info!("Initializing storage at: {}", config.storage.path);
    let store = DocumentStore::open(config.storage.clone()).context("Failed to open storage")?;

    let manager = Arc::new(Manager::new(
        TextSchema,
        Arc::new(store.clone()),
        config.manager.clone(),
    ));
    manager.start_background_tasks();

    let bus = LocalBus::new();
    let _bus_server = serve(manager.clone(), Arc::new(bus.clone()));

    let state = Arc::new(AppState {
        manager: manager.clone(),
        store: store.clone(),
        bus,
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/docs", get(list_documents).post(create_document))
        .route("/api/docs/:name", get(get_document))
        .route("/api/docs/:name/events", get(pull_events).post(push_events))
        .route("/bus", get(bus_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Collab Sync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Manager: {} (bus address {})", manager.id(), manager.address());
    info!("   Listening on: http://{}", addr);
    info!("   Bus: ws://{}/bus?address=<client>", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager.clone()))
        .await
        .context("Server error")?;

    store.flush_db().context("Failed to flush storage")?;
    info!("Server stopped");
    Ok(())
}
