use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::{
    ApiError, AssignmentResult, ClickRecord, ClickRequest, DisqualifyRequest, ErrorCode,
    EventType, GameEvent, ManualQualifyRequest, Participant, QualifyOutcome, QualifyRequest,
    RegisterRequest, Room, RosterSnapshot, RoundSettings, SetRoundRequest, SCHEMA_VERSION_V1,
};
use hunt_core::admission::{AdmissionController, AdmissionError};
use hunt_core::assignment;
use hunt_core::store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};

use crate::persistence::SqliteParticipantStore;

const STREAM_CHANNEL_CAPACITY: usize = 4096;
const DEFAULT_SQLITE_PATH: &str = "hunt_game.sqlite";

#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Store(StoreError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "server io error: {err}"),
            Self::Store(err) => write!(f, "server store error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<StoreError> for ServerError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Runtime configuration, environment-driven. An unset admin token leaves
/// the admin surface open, for local development only.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub sqlite_path: String,
    pub admin_token: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            admin_token: std::env::var("HUNT_ADMIN_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
        }
    }
}

pub fn default_sqlite_path() -> String {
    std::env::var("HUNT_SQLITE_PATH")
        .ok()
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_string())
}

#[derive(Clone)]
struct AppState {
    inner: Arc<Mutex<ServerInner>>,
    stream_tx: broadcast::Sender<StreamMessage>,
    admin_token: Option<String>,
}

impl AppState {
    fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = SqliteParticipantStore::open(&config.sqlite_path)?;
        let (stream_tx, _) = broadcast::channel(STREAM_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Mutex::new(ServerInner {
                controller: AdmissionController::new(store),
                emitted_event_count: 0,
            })),
            stream_tx,
            admin_token: config.admin_token,
        })
    }
}

#[derive(Debug)]
struct ServerInner {
    controller: AdmissionController<SqliteParticipantStore>,
    emitted_event_count: usize,
}

#[derive(Debug)]
struct HttpApiError {
    status: StatusCode,
    error: ApiError,
}

impl HttpApiError {
    fn invalid_request(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::new(ErrorCode::InvalidRequest, message, details),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: ApiError::new(
                ErrorCode::Unauthorized,
                "admin authorization missing or invalid",
                None,
            ),
        }
    }

    fn from_admission(err: AdmissionError) -> Self {
        match err {
            AdmissionError::RoundNotActive { active_round } => Self {
                status: StatusCode::FORBIDDEN,
                error: ApiError::new(
                    ErrorCode::RoundNotActive,
                    "Round 1 is not currently active. Please wait for the round to start.",
                    Some(format!("active_round={active_round}")),
                ),
            },
            AdmissionError::ParticipantNotFound { participant_id } => Self {
                status: StatusCode::NOT_FOUND,
                error: ApiError::new(
                    ErrorCode::ParticipantNotFound,
                    "Participant not found. Please register first.",
                    Some(format!("participant_id={participant_id}")),
                ),
            },
            AdmissionError::InvalidDestination { claimed } => Self {
                status: StatusCode::BAD_REQUEST,
                error: ApiError::new(
                    ErrorCode::InvalidDestination,
                    "Invalid link. Please try again.",
                    Some(format!("claimed={claimed}")),
                ),
            },
            AdmissionError::InvalidRound { round } => Self {
                status: StatusCode::BAD_REQUEST,
                error: ApiError::new(
                    ErrorCode::InvalidRound,
                    "Invalid round number. Must be 0, 1, 2, or 3.",
                    Some(format!("round={round}")),
                ),
            },
            AdmissionError::QuotaInvariantViolated { counted } => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: ApiError::new(
                    ErrorCode::QuotaInvariantViolated,
                    "qualified count exceeds the admission quota; request aborted",
                    Some(format!("counted={counted}")),
                ),
            },
            AdmissionError::Store(err) if err.is_transient() => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                error: ApiError::new(
                    ErrorCode::StoreUnavailable,
                    "The game store is temporarily unavailable. Please try again.",
                    Some(err.to_string()),
                ),
            },
            AdmissionError::Store(err) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: ApiError::new(
                    ErrorCode::InternalError,
                    "store operation failed",
                    Some(err.to_string()),
                ),
            },
        }
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}

pub async fn serve(addr: SocketAddr, config: ServerConfig) -> Result<(), ServerError> {
    let state = AppState::new(config)?;
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "hunt api listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/register", post(register))
        .route("/api/v1/assignments/{participant_id}", get(get_assignments))
        .route("/api/v1/game-state", get(get_game_state))
        .route("/api/v1/submit-link", post(submit_link))
        .route("/api/v1/clicks", post(record_click))
        .route("/api/v1/clicks/{participant_id}", get(get_clicks))
        .route("/api/v1/admin/set-round", post(admin_set_round))
        .route("/api/v1/admin/participants", get(admin_list_participants))
        .route("/api/v1/admin/qualify", post(admin_qualify))
        .route("/api/v1/admin/disqualify", post(admin_disqualify))
        .route("/api/v1/admin/reset", post(admin_reset))
        .route("/api/v1/stream", get(stream_game))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-max-age"),
        HeaderValue::from_static("3600"),
    );
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), HttpApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        // No token configured: open dev mode.
        return Ok(());
    };

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if presented == Some(expected) {
        Ok(())
    } else {
        Err(HttpApiError::unauthorized())
    }
}

#[derive(Debug, Serialize)]
struct ParticipantResponse {
    schema_version: String,
    message: String,
    participant: Participant,
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<ParticipantResponse>, HttpApiError> {
    if request.participant_id.trim().is_empty() || request.display_name.trim().is_empty() {
        return Err(HttpApiError::invalid_request(
            "participant_id and display_name are required",
            None,
        ));
    }

    let (response, messages) = {
        let mut inner = state.inner.lock().await;
        let participant = inner
            .controller
            .register(&request.participant_id, &request.display_name)
            .map_err(HttpApiError::from_admission)?;

        let messages = collect_delta_messages(&mut inner);
        (
            ParticipantResponse {
                schema_version: SCHEMA_VERSION_V1.to_string(),
                message: "Participant registered.".to_string(),
                participant,
            },
            messages,
        )
    };

    broadcast_messages(&state, messages);

    Ok(Json(response))
}

#[derive(Debug, Deserialize, Default)]
struct AssignmentQuery {
    page: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssignmentsResponse {
    schema_version: String,
    participant_id: String,
    assignments: Vec<AssignmentResult>,
}

/// Pure computation: no lock, no store. Safe to serve at any concurrency.
async fn get_assignments(
    Path(participant_id): Path<String>,
    Query(query): Query<AssignmentQuery>,
) -> Json<AssignmentsResponse> {
    let assignments = match query.page.as_deref() {
        Some(page) => assignment::assignments_for_page(&participant_id, page),
        None => assignment::assignments_for_participant(&participant_id),
    };

    Json(AssignmentsResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        participant_id,
        assignments,
    })
}

#[derive(Debug, Serialize)]
struct RoundStateResponse {
    schema_version: String,
    message: String,
    round_settings: RoundSettings,
}

async fn get_game_state(
    State(state): State<AppState>,
) -> Result<Json<RoundStateResponse>, HttpApiError> {
    let settings = {
        let mut inner = state.inner.lock().await;
        inner
            .controller
            .active_round()
            .map_err(HttpApiError::from_admission)?
    };

    Ok(Json(RoundStateResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        message: round_label(settings.active_round),
        round_settings: settings,
    }))
}

async fn submit_link(
    State(state): State<AppState>,
    Json(request): Json<QualifyRequest>,
) -> Result<Json<QualifyOutcome>, HttpApiError> {
    if request.participant_id.trim().is_empty() || request.claimed_destination.trim().is_empty() {
        return Err(HttpApiError::invalid_request(
            "participant_id and claimed_destination are required",
            None,
        ));
    }

    let (outcome, messages) = {
        let mut inner = state.inner.lock().await;
        let outcome = inner
            .controller
            .attempt_qualify(&request)
            .map_err(HttpApiError::from_admission)?;

        let messages = collect_delta_messages(&mut inner);
        (outcome, messages)
    };

    broadcast_messages(&state, messages);

    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct ClickResponse {
    schema_version: String,
    recorded: bool,
}

/// Fire-and-forget audit logging: a store failure is reported to the admin
/// room and the log, never to the player.
async fn record_click(
    State(state): State<AppState>,
    Json(request): Json<ClickRequest>,
) -> Result<Json<ClickResponse>, HttpApiError> {
    if request.participant_id.trim().is_empty() || request.link_id.trim().is_empty() {
        return Err(HttpApiError::invalid_request(
            "participant_id and link_id are required",
            None,
        ));
    }

    let (recorded, warning) = {
        let mut inner = state.inner.lock().await;
        match inner.controller.record_click(
            &request.participant_id,
            &request.link_id,
            request.was_genuine,
        ) {
            Ok(()) => (true, None),
            Err(err) => {
                tracing::warn!(
                    participant_id = %request.participant_id,
                    link_id = %request.link_id,
                    error = %err,
                    "click audit insert failed"
                );
                let warning =
                    StreamMessage::warning(format!("click audit insert failed: {err}"));
                (false, Some(warning))
            }
        }
    };

    if let Some(warning) = warning {
        let _ = state.stream_tx.send(warning);
    }

    Ok(Json(ClickResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        recorded,
    }))
}

#[derive(Debug, Serialize)]
struct ClicksResponse {
    schema_version: String,
    participant_id: String,
    clicks: Vec<ClickRecord>,
}

async fn get_clicks(
    Path(participant_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ClicksResponse>, HttpApiError> {
    let clicks = {
        let inner = state.inner.lock().await;
        inner
            .controller
            .clicks_for_participant(&participant_id)
            .map_err(HttpApiError::from_admission)?
    };

    Ok(Json(ClicksResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        participant_id,
        clicks,
    }))
}

async fn admin_set_round(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SetRoundRequest>,
) -> Result<Json<RoundStateResponse>, HttpApiError> {
    require_admin(&state, &headers)?;

    let (settings, messages) = {
        let mut inner = state.inner.lock().await;
        let settings = inner
            .controller
            .set_active_round(request.round)
            .map_err(HttpApiError::from_admission)?;

        let messages = collect_delta_messages(&mut inner);
        (settings, messages)
    };

    broadcast_messages(&state, messages);

    Ok(Json(RoundStateResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        message: round_label(settings.active_round),
        round_settings: settings,
    }))
}

async fn admin_list_participants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RosterSnapshot>, HttpApiError> {
    require_admin(&state, &headers)?;

    let roster = {
        let mut inner = state.inner.lock().await;
        inner
            .controller
            .roster()
            .map_err(HttpApiError::from_admission)?
    };

    Ok(Json(roster))
}

async fn admin_qualify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ManualQualifyRequest>,
) -> Result<Json<QualifyOutcome>, HttpApiError> {
    require_admin(&state, &headers)?;

    if request.participant_id.trim().is_empty() {
        return Err(HttpApiError::invalid_request(
            "participant_id is required",
            None,
        ));
    }

    let (outcome, messages) = {
        let mut inner = state.inner.lock().await;
        let outcome = inner
            .controller
            .manual_qualify(&request.participant_id, request.display_name.as_deref())
            .map_err(HttpApiError::from_admission)?;

        let messages = collect_delta_messages(&mut inner);
        (outcome, messages)
    };

    broadcast_messages(&state, messages);

    Ok(Json(outcome))
}

async fn admin_disqualify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DisqualifyRequest>,
) -> Result<Json<ParticipantResponse>, HttpApiError> {
    require_admin(&state, &headers)?;

    let (participant, messages) = {
        let mut inner = state.inner.lock().await;
        let participant = inner
            .controller
            .disqualify(&request.participant_id)
            .map_err(HttpApiError::from_admission)?;

        let messages = collect_delta_messages(&mut inner);
        (participant, messages)
    };

    broadcast_messages(&state, messages);

    Ok(Json(ParticipantResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        message: format!("{} has been disqualified.", participant.display_name),
        participant,
    }))
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    schema_version: String,
    message: String,
}

async fn admin_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ResetResponse>, HttpApiError> {
    require_admin(&state, &headers)?;

    let messages = {
        let mut inner = state.inner.lock().await;
        inner
            .controller
            .reset_game()
            .map_err(HttpApiError::from_admission)?;

        collect_delta_messages(&mut inner)
    };

    broadcast_messages(&state, messages);

    Ok(Json(ResetResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        message: "Game reset. All participants must register again.".to_string(),
    }))
}

#[derive(Debug, Deserialize, Default)]
struct StreamQuery {
    room: Option<String>,
    participant_id: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Clone)]
struct Subscription {
    admin: bool,
    participant_id: Option<String>,
}

async fn stream_game(
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, HttpApiError> {
    let admin = matches!(query.room.as_deref(), Some("admin"));
    if admin {
        if let Some(expected) = state.admin_token.as_deref() {
            if query.token.as_deref() != Some(expected) {
                return Err(HttpApiError::unauthorized());
            }
        }
    }

    let subscription = Subscription {
        admin,
        participant_id: query.participant_id,
    };

    // Connecting clients reconcile against current authoritative state
    // before the event stream starts.
    let initial_message = {
        let mut inner = state.inner.lock().await;
        let settings = inner
            .controller
            .active_round()
            .map_err(HttpApiError::from_admission)?;
        StreamMessage::round_status(&settings)
    };

    Ok(ws.on_upgrade(move |socket| stream_socket(socket, state, subscription, initial_message)))
}

async fn stream_socket(
    mut socket: WebSocket,
    state: AppState,
    subscription: Subscription,
    initial_message: StreamMessage,
) {
    if send_stream_message(&mut socket, &initial_message)
        .await
        .is_err()
    {
        return;
    }

    let mut rx = state.stream_tx.subscribe();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Ok(message) => {
                        if !should_deliver(&message, &subscription) {
                            continue;
                        }

                        if send_stream_message(&mut socket, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let warning = StreamMessage::warning(format!(
                            "stream client lagged and skipped {skipped} message(s); \
                             refresh state from the full-state endpoints"
                        ));

                        if send_stream_message(&mut socket, &warning).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }
}

async fn send_stream_message(
    socket: &mut WebSocket,
    message: &StreamMessage,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}

/// Admin subscribers see every room; player subscribers see the broadcast
/// room plus anything targeted at their own participant id.
fn should_deliver(message: &StreamMessage, subscription: &Subscription) -> bool {
    if subscription.admin {
        return true;
    }

    match message.room {
        Room::Broadcast => true,
        Room::Admin => {
            message.participant_id.is_some()
                && message.participant_id == subscription.participant_id
        }
    }
}

/// Ship the controller's event-log tail as stream messages. Called with the
/// state lock held, so the tail is consistent with the store writes that
/// produced it; actual sending happens after the lock is released.
fn collect_delta_messages(inner: &mut ServerInner) -> Vec<StreamMessage> {
    let events = inner.controller.events();
    let messages = events[inner.emitted_event_count..]
        .iter()
        .map(StreamMessage::from_event)
        .collect();
    inner.emitted_event_count = events.len();
    messages
}

fn broadcast_messages(state: &AppState, messages: Vec<StreamMessage>) {
    for message in messages {
        // Send fails only when no subscriber is connected; that is fine.
        let _ = state.stream_tx.send(message);
    }
}

fn round_label(round: u8) -> String {
    match round {
        0 => "No round is active.".to_string(),
        n => format!("Round {n} is active."),
    }
}

#[derive(Debug, Clone, Serialize)]
struct StreamMessage {
    schema_version: String,
    #[serde(rename = "type")]
    message_type: String,
    room: Room,
    participant_id: Option<String>,
    sequence: Option<u64>,
    payload: Value,
}

impl StreamMessage {
    fn from_event(event: &GameEvent) -> Self {
        let message_type = match event.event_type {
            EventType::RoundChanged => "round.changed",
            EventType::ParticipantQualified => "participant.qualified",
            EventType::ParticipantUpdated => "participant.updated",
            EventType::ParticipantDisqualified => "participant.disqualified",
            EventType::GameReset => "game.reset",
        };

        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            message_type: message_type.to_string(),
            room: event.room,
            participant_id: event.participant_id.clone(),
            sequence: Some(event.sequence),
            payload: event.payload.clone(),
        }
    }

    fn round_status(settings: &RoundSettings) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            message_type: "round.status".to_string(),
            room: Room::Broadcast,
            participant_id: None,
            sequence: None,
            payload: json!(settings),
        }
    }

    fn warning(message: String) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            message_type: "warning".to_string(),
            room: Room::Admin,
            participant_id: None,
            sequence: None,
            payload: json!({ "message": message }),
        }
    }
}
