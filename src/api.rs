//! HTTP and WebSocket API for focus-sync server

use axum::{
    Extension, Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::conflict;
use crate::db::Database;
use crate::error::SyncError;
use crate::hub::{HubHandle, Hubs};
use crate::models::{
    ClientMessage, CommandOutcome, CommandRequest, SessionResetEvent, SessionSnapshot,
    ServerMessage,
};

/// Application state shared across handlers
pub struct AppState {
    pub hubs: Arc<Hubs>,
    pub db: Arc<Database>,
    pub config: Config,
}

impl AppState {
    pub fn new(hubs: Arc<Hubs>, db: Arc<Database>, config: Config) -> Arc<Self> {
        Arc::new(Self { hubs, db, config })
    }
}

/// Account resolved from the bearer token; names the session
#[derive(Debug, Clone)]
pub struct Account(pub String);

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/session", get(fetch_session))
        .route("/api/v1/session/commands", post(submit_command))
        .route("/api/v1/session/resets", get(list_resets))
        .route("/api/v1/session/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "focus-sync",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Auth middleware - validates Bearer token and attaches the account
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Skip auth for health check
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token,
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Missing or invalid Authorization header" })),
            )
                .into_response();
        }
    };

    let account = match state.config.validate_token(token) {
        Some(entry) => Account(entry.account().to_string()),
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Invalid API token" })),
            )
                .into_response();
        }
    };

    request.extensions_mut().insert(account);
    next.run(request).await
}

/// Authoritative state pull, used on reconnect
async fn fetch_session(
    State(state): State<Arc<AppState>>,
    Extension(account): Extension<Account>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let hub = state.hubs.get_or_create(&account.0).await?;
    Ok(Json(hub.fetch().await?))
}

async fn submit_command(
    State(state): State<Arc<AppState>>,
    Extension(account): Extension<Account>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<CommandOutcome>, ApiError> {
    let hub = state.hubs.get_or_create(&account.0).await?;
    hub.registry()
        .touch(&request.device_id, state.hubs.clock().now())
        .await;

    let outcome = hub.submit(request.command, &request.device_id).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct ResetRange {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn list_resets(
    State(state): State<Arc<AppState>>,
    Extension(account): Extension<Account>,
    Query(range): Query<ResetRange>,
) -> Result<Json<Vec<SessionResetEvent>>, ApiError> {
    let events = state
        .db
        .list_reset_events(&account.0, range.from, range.to)?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
struct DeviceQuery {
    device_id: String,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(account): Extension<Account>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    if query.device_id.trim().is_empty() {
        return Err(SyncError::InvalidInput("device_id must not be empty".to_string()).into());
    }

    let hub = state.hubs.get_or_create(&account.0).await?;
    let hubs = state.hubs.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, hubs, query.device_id)))
}

/// Drive one device connection.
///
/// Registers the device, pushes the current snapshot, then forwards
/// broadcasts while processing inbound commands on this task. Any inbound
/// frame counts as liveness. Disconnecting only unregisters the device;
/// commands already handed to the hub still complete.
async fn handle_socket(socket: WebSocket, hub: HubHandle, hubs: Arc<Hubs>, device_id: String) {
    let clock = hubs.clock().clone();
    let lease = hub.registry().register(&device_id, clock.now()).await;
    let generation = lease.generation;
    let mut updates = lease.updates;
    tracing::info!(session_id = %hub.session_id(), device_id = %device_id, "Device connected");

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();

    // A freshly connected device always starts from a pulled snapshot.
    match hub.fetch().await {
        Ok(snapshot) => {
            let _ = reply_tx.send(ServerMessage::State { snapshot });
        }
        Err(e) => {
            let _ = reply_tx.send(error_message(None, &e));
        }
    }

    let sender_device = device_id.clone();
    let send_task = tokio::spawn(async move {
        let mut last_sent: Option<u64> = None;
        loop {
            let message = tokio::select! {
                biased;
                reply = reply_rx.recv() => match reply {
                    Some(message) => message,
                    None => break,
                },
                update = updates.recv() => match update {
                    Some(snapshot) => {
                        if !conflict::supersedes(snapshot.revision, last_sent) {
                            continue;
                        }
                        ServerMessage::State { snapshot }
                    }
                    // Registration dropped: swept as idle or replaced
                    None => break,
                },
            };

            if let ServerMessage::State { snapshot } = &message {
                last_sent = Some(last_sent.map_or(snapshot.revision, |r| r.max(snapshot.revision)));
            }

            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                tracing::debug!(device_id = %sender_device, "WebSocket sink closed");
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(device_id = %device_id, error = %e, "WebSocket receive error");
                break;
            }
        };

        hub.registry().touch(&device_id, clock.now()).await;

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(ClientMessage::Command {
                request_id,
                command,
            }) => match hub.submit(command, &device_id).await {
                Ok(outcome) => ServerMessage::Ack {
                    request_id,
                    revision: outcome.snapshot.revision,
                    applied: outcome.applied,
                },
                Err(e) => error_message(Some(request_id), &e),
            },
            Ok(ClientMessage::Fetch) => match hub.fetch().await {
                Ok(snapshot) => ServerMessage::State { snapshot },
                Err(e) => error_message(None, &e),
            },
            Ok(ClientMessage::Ping) => ServerMessage::Pong,
            Err(e) => ServerMessage::Error {
                request_id: None,
                code: "bad_message".to_string(),
                message: e.to_string(),
            },
        };

        if reply_tx.send(reply).is_err() {
            break;
        }
    }

    hub.registry().release(&device_id, generation).await;
    send_task.abort();
    tracing::info!(session_id = %hub.session_id(), device_id = %device_id, "Device disconnected");
}

fn error_message(request_id: Option<String>, error: &SyncError) -> ServerMessage {
    ServerMessage::Error {
        request_id,
        code: error.code().to_string(),
        message: error.to_string(),
    }
}

/// API error type
#[derive(Debug)]
pub struct ApiError(SyncError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::InvalidInput(_) | SyncError::TimezoneResolution(_) => StatusCode::BAD_REQUEST,
            SyncError::InvalidTransition(_) => StatusCode::CONFLICT,
            SyncError::HubUnavailable | SyncError::AckTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "API error");
        }

        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "code": self.0.code(),
            })),
        )
            .into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(SyncError::Store(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SharedClock};
    use crate::config::{TokenConfig, hash_token};
    use crate::hub::HubSettings;
    use crate::notify::Notifier;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const TOKEN: &str = "fst_test_token";

    struct TestServer {
        router: Router,
        hubs: Arc<Hubs>,
        clock: Arc<ManualClock>,
    }

    fn server() -> TestServer {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
        ));
        let shared: SharedClock = clock.clone();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let settings = HubSettings {
            tick_interval: None,
            ..Default::default()
        };
        let hubs = Arc::new(Hubs::new(settings, shared, db.clone(), Notifier::new(16)));

        let mut config = Config::default();
        config.tokens.push(TokenConfig {
            name: "phone".to_string(),
            token_hash: hash_token(TOKEN).unwrap(),
            account: Some("alice".to_string()),
        });

        TestServer {
            router: create_router(AppState::new(hubs.clone(), db, config)),
            hubs,
            clock,
        }
    }

    fn app() -> Router {
        server().router
    }

    fn authed(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN));
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_or_wrong_token_is_rejected() {
        let app = app();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/v1/session").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/session")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn fetch_returns_account_session() {
        let response = app()
            .oneshot(authed("GET", "/api/v1/session", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["session_id"], "alice");
        assert_eq!(body["timer"]["session_type"], "work");
        assert_eq!(body["revision"], 0);
    }

    #[tokio::test]
    async fn command_round_trip_and_validation() {
        let app = app();

        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                "/api/v1/session/commands",
                Some(serde_json::json!({ "device_id": "phone", "command": { "type": "start" } })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["applied"], true);
        assert_eq!(body["snapshot"]["timer"]["is_running"], true);
        assert_eq!(body["snapshot"]["revision"], 1);

        let response = app
            .oneshot(authed(
                "POST",
                "/api/v1/session/commands",
                Some(serde_json::json!({
                    "device_id": "phone",
                    "command": { "type": "set_count", "count": 1001 }
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "invalid_input");
    }

    #[tokio::test]
    async fn reset_events_listed_for_account() {
        let app = app();
        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                "/api/v1/session/commands",
                Some(serde_json::json!({ "device_id": "phone", "command": { "type": "reset_count" } })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(authed(
                "GET",
                "/api/v1/session/resets?from=2026-03-01T00:00:00Z",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["trigger_kind"], "manual");
    }

    mod socket {
        use super::*;
        use tokio_tungstenite::tungstenite::{
            self,
            client::IntoClientRequest,
            http::{HeaderValue, header::AUTHORIZATION},
        };

        type Client = tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >;

        async fn serve(router: Router) -> std::net::SocketAddr {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            addr
        }

        async fn connect(addr: std::net::SocketAddr, device_id: &str) -> Client {
            let url = format!("ws://{}/api/v1/session/ws?device_id={}", addr, device_id);
            let mut request = url.into_client_request().unwrap();
            request.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", TOKEN)).unwrap(),
            );
            let (client, _) = tokio_tungstenite::connect_async(request).await.unwrap();
            client
        }

        async fn send(client: &mut Client, message: serde_json::Value) {
            client
                .send(tungstenite::Message::Text(message.to_string().into()))
                .await
                .unwrap();
        }

        async fn next_message(client: &mut Client) -> ServerMessage {
            loop {
                let frame = tokio::time::timeout(std::time::Duration::from_secs(5), client.next())
                    .await
                    .expect("no frame within 5s")
                    .unwrap()
                    .unwrap();
                if let tungstenite::Message::Text(text) = frame {
                    return serde_json::from_str(text.as_str()).unwrap();
                }
            }
        }

        #[tokio::test]
        async fn connect_pushes_current_snapshot() {
            let s = server();
            let addr = serve(s.router).await;
            let mut phone = connect(addr, "phone").await;

            match next_message(&mut phone).await {
                ServerMessage::State { snapshot } => {
                    assert_eq!(snapshot.session_id, "alice");
                    assert_eq!(snapshot.revision, 0);
                }
                other => panic!("expected state, got {:?}", other),
            }

            let hub = s.hubs.get_or_create("alice").await.unwrap();
            assert!(hub.registry().connection("phone").await.is_some());
        }

        #[tokio::test]
        async fn commands_are_acked_and_broadcast_to_other_devices() {
            let s = server();
            let addr = serve(s.router).await;
            let mut phone = connect(addr, "phone").await;
            let mut laptop = connect(addr, "laptop").await;
            next_message(&mut phone).await;
            next_message(&mut laptop).await;

            send(
                &mut phone,
                serde_json::json!({ "type": "command", "request_id": "r1", "command": { "type": "start" } }),
            )
            .await;

            let mut acked = false;
            let mut pushed = false;
            for _ in 0..2 {
                match next_message(&mut phone).await {
                    ServerMessage::Ack {
                        request_id,
                        revision,
                        applied,
                    } => {
                        assert_eq!(request_id, "r1");
                        assert_eq!(revision, 1);
                        assert!(applied);
                        acked = true;
                    }
                    ServerMessage::State { snapshot } => {
                        assert_eq!(snapshot.revision, 1);
                        pushed = true;
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            assert!(acked && pushed);

            match next_message(&mut laptop).await {
                ServerMessage::State { snapshot } => {
                    assert_eq!(snapshot.revision, 1);
                    assert!(snapshot.timer.is_running);
                }
                other => panic!("expected state, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn malformed_frames_get_bad_message() {
            let s = server();
            let addr = serve(s.router).await;
            let mut phone = connect(addr, "phone").await;
            next_message(&mut phone).await;

            phone
                .send(tungstenite::Message::Text("not json".into()))
                .await
                .unwrap();
            match next_message(&mut phone).await {
                ServerMessage::Error {
                    request_id, code, ..
                } => {
                    assert_eq!(request_id, None);
                    assert_eq!(code, "bad_message");
                }
                other => panic!("expected error, got {:?}", other),
            }

            send(
                &mut phone,
                serde_json::json!({ "type": "command", "request_id": "r2", "command": { "type": "set_count", "count": -1 } }),
            )
            .await;
            match next_message(&mut phone).await {
                ServerMessage::Error {
                    request_id, code, ..
                } => {
                    assert_eq!(request_id.as_deref(), Some("r2"));
                    assert_eq!(code, "invalid_input");
                }
                other => panic!("expected error, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn inbound_traffic_refreshes_last_seen() {
            let s = server();
            let addr = serve(s.router).await;
            let mut phone = connect(addr, "phone").await;
            next_message(&mut phone).await;

            let hub = s.hubs.get_or_create("alice").await.unwrap();
            let connected = hub.registry().connection("phone").await.unwrap();

            s.clock.advance(chrono::Duration::seconds(40));
            send(&mut phone, serde_json::json!({ "type": "ping" })).await;
            assert!(matches!(next_message(&mut phone).await, ServerMessage::Pong));

            let seen = hub.registry().connection("phone").await.unwrap();
            assert_eq!(seen.connected_at_utc, connected.connected_at_utc);
            assert_eq!(seen.last_seen_at_utc, s.clock.now());
            assert!(seen.last_seen_at_utc > connected.last_seen_at_utc);
        }
    }
}
