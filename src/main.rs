//! # session-sync
//!
//! HTTP host for the session reconciliation engine.
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check
//! - `GET /api/projects/{project}/sessions?provider=` - Session summaries (index cache)
//! - `GET /api/projects/{project}/sessions/{id}?provider=&since=&tailCompactions=&beforeMessageId=` - Session read
//! - `GET /api/projects/{project}/sessions/{id}/live?provider=&tailCompactions=&beforeMessageId=` - Merged live view
//! - `GET /api/sessions/{id}/stream?project=&provider=` - SSE push stream (starts a follower when project is given)
//! - `POST /api/sessions/{id}/events` - Publish an agent event

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use session_sync::config::Config;
use session_sync::events::{AgentState, EventHub, SessionEvent};
use session_sync::follow::{self, FollowerHandle, SessionSource};
use session_sync::index::SessionIndexCache;
use session_sync::merge::MergeEngine;
use session_sync::normalizer;
use session_sync::pagination::{slice_at_compactions, PageInfo};
use session_sync::sessions::{NormalizedMessage, Provider, Session, SessionSummary};
use session_sync::{watcher, SyncError};
use std::{
    convert::Infallible,
    net::SocketAddr,
    process::ExitCode,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// App State - Shared state across all request handlers
// ============================================================================

struct AppState {
    start_time: Instant,
    config: Config,
    index: Arc<SessionIndexCache>,
    merge: Arc<MergeEngine>,
    hub: Arc<EventHub>,
    followers: DashMap<String, Follower>,
}

/// A follower shared by every SSE stream watching the same session
struct Follower {
    _handle: FollowerHandle,
    subscribers: usize,
}

/// Held by an SSE stream; the last one dropped stops the follower
struct FollowGuard {
    state: Arc<AppState>,
    session_id: String,
}

impl Drop for FollowGuard {
    fn drop(&mut self) {
        let idle = match self.state.followers.get_mut(&self.session_id) {
            Some(mut follower) => {
                follower.subscribers = follower.subscribers.saturating_sub(1);
                follower.subscribers == 0
            }
            None => false,
        };
        if idle {
            self.state
                .followers
                .remove_if(&self.session_id, |_, f| f.subscribers == 0);
            debug!("Last viewer left {}", self.session_id);
        }
    }
}

impl AppState {
    fn retain_follower(self: &Arc<Self>, source: SessionSource) -> FollowGuard {
        let session_id = source.session_id.clone();
        let mut follower = self.followers.entry(session_id.clone()).or_insert_with(|| Follower {
            _handle: follow::spawn(
                self.merge.clone(),
                self.hub.clone(),
                source,
                self.config.poll_interval,
            ),
            subscribers: 0,
        });
        follower.subscribers += 1;
        drop(follower);
        FollowGuard {
            state: Arc::clone(self),
            session_id,
        }
    }

    fn session_source(&self, project_id: &str, provider: Provider, session_id: &str) -> Result<SessionSource, ApiError> {
        let dir = self
            .config
            .session_dir(provider, project_id)
            .ok_or_else(|| ApiError::NotFound(format!("unknown project {}", project_id)))?;
        Ok(SessionSource {
            dir,
            project_id: project_id.to_string(),
            provider,
            session_id: session_id.to_string(),
        })
    }
}

// ============================================================================
// Errors
// ============================================================================

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        if e.is_not_found() {
            return ApiError::NotFound(e.to_string());
        }
        match &e {
            SyncError::UnknownProvider(_) => ApiError::BadRequest(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => {
                error!("Request failed: {}", m);
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn parse_provider(raw: Option<&str>) -> Result<Provider, ApiError> {
    Ok(raw.map(str::parse::<Provider>).transpose()?.unwrap_or(Provider::Claude))
}

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    followed_sessions: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        followed_sessions: state.followers.len(),
    })
}

// ============================================================================
// Session Endpoints
// ============================================================================

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    provider: Option<String>,
    since: Option<String>,
    tail_compactions: Option<usize>,
    before_message_id: Option<String>,
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<SessionSummary>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let provider = parse_provider(query.provider.as_deref())?;
    let dir = state
        .config
        .session_dir(provider, &project_id)
        .ok_or_else(|| ApiError::NotFound(format!("unknown project {}", project_id)))?;
    let sessions = state.index.get_summaries(&dir, &project_id, provider).await;
    Ok(Json(SessionsResponse { sessions }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    #[serde(flatten)]
    session: Session,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_info: Option<PageInfo>,
}

/// Apply `tailCompactions` / `beforeMessageId` when requested.
fn paginate(messages: Vec<NormalizedMessage>, query: &SessionQuery) -> (Vec<NormalizedMessage>, Option<PageInfo>) {
    match query.tail_compactions {
        Some(tail) => {
            let (page, info) = slice_at_compactions(&messages, tail, query.before_message_id.as_deref());
            (page.to_vec(), Some(info))
        }
        None => (messages, None),
    }
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path((project_id, session_id)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SessionResponse>, ApiError> {
    let provider = parse_provider(query.provider.as_deref())?;
    let source = state.session_source(&project_id, provider, &session_id)?;
    let session = normalizer::get_session(
        &source.dir,
        &project_id,
        provider,
        &session_id,
        query.since.as_deref(),
    )
    .await?;

    let (messages, page_info) = paginate(session.messages, &query);
    Ok(Json(SessionResponse {
        session: Session {
            summary: session.summary,
            messages,
        },
        page_info,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LiveResponse {
    messages: Vec<NormalizedMessage>,
    state: AgentState,
    permission_mode: String,
    mode_version: u64,
    complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_info: Option<PageInfo>,
}

/// The merged view of a followed session
async fn live_session(
    State(state): State<Arc<AppState>>,
    Path((_project_id, session_id)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<LiveResponse>, ApiError> {
    let not_followed = || ApiError::NotFound(format!("session {} is not being followed", session_id));
    let messages = state.merge.messages(&session_id).ok_or_else(not_followed)?;
    let (status, complete) = state.merge.status(&session_id).ok_or_else(not_followed)?;
    let (messages, page_info) = paginate(messages, &query);
    Ok(Json(LiveResponse {
        messages,
        state: status.state,
        permission_mode: status.permission_mode,
        mode_version: status.mode_version,
        complete,
        page_info,
    }))
}

// ============================================================================
// Push Stream
// ============================================================================

#[derive(Deserialize, Default)]
struct StreamQuery {
    project: Option<String>,
    provider: Option<String>,
}

fn sse_event(seq: u64, event: &SessionEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        warn!("Failed to serialize {} event: {}", event.name(), e);
        "{}".to_string()
    });
    Event::default().event(event.name()).id(seq.to_string()).data(data)
}

/// SSE stream for one session: `connected`, then hub events and heartbeats.
async fn stream_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let guard = match query.project.as_deref() {
        Some(project_id) => {
            let provider = parse_provider(query.provider.as_deref())?;
            let source = state.session_source(project_id, provider, &session_id)?;
            Some(state.retain_follower(source))
        }
        None => None,
    };

    let rx = state.hub.subscribe(&session_id);

    let init_seq = state.hub.next_seq();
    let init_event = sse_event(init_seq, &state.hub.connected(&session_id));
    let init = stream::once(async move { Ok(init_event) });

    let hub = state.hub.clone();
    let heartbeat = stream::unfold((), move |()| {
        let hub = hub.clone();
        async move {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            let seq = hub.next_seq();
            Some((Ok(sse_event(seq, &SessionEvent::heartbeat())), ()))
        }
    });

    let sid = session_id.clone();
    let updates = stream::unfold((rx, guard), move |(mut rx, guard)| {
        let sid = sid.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok((seq, event)) => return Some((Ok(sse_event(seq, &event)), (rx, guard))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("SSE client for {} lagged by {} events", sid, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    });

    let merged = init.chain(tokio_stream::StreamExt::merge(heartbeat, updates));
    Ok(Sse::new(merged).keep_alive(KeepAlive::default()))
}

#[derive(Serialize)]
struct PublishResponse {
    seq: u64,
}

/// Entry point for the agent bridge
async fn publish_event(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(event): Json<SessionEvent>,
) -> Json<PublishResponse> {
    let seq = state.hub.publish(&session_id, event);
    Json(PublishResponse { seq })
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("session_sync=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env();

    let index = SessionIndexCache::new(config.index_config());
    if let Err(e) = index.initialize().await {
        error!("Cannot start: {}", e);
        return ExitCode::FAILURE;
    }
    let merge = Arc::new(MergeEngine::new());
    merge.initialize();
    let hub = Arc::new(EventHub::new(EVENT_CHANNEL_CAPACITY));

    let state = Arc::new(AppState {
        start_time: Instant::now(),
        config: config.clone(),
        index: index.clone(),
        merge: merge.clone(),
        hub: hub.clone(),
        followers: DashMap::new(),
    });

    // Start file watcher (feeds index invalidations)
    let watch_cache = index.clone();
    let roots = config.roots();
    let debounce = config.watch_debounce;
    tokio::spawn(async move {
        watcher::run(watch_cache, roots, debounce).await;
    });

    // Drop event channels with no subscribers
    let prune_hub = hub.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            prune_hub.prune();
        }
    });

    // Build router
    let app = Router::new()
        // Health
        .route("/health", get(health))
        // Pull
        .route("/api/projects/{project_id}/sessions", get(list_sessions))
        .route("/api/projects/{project_id}/sessions/{session_id}", get(get_session))
        .route("/api/projects/{project_id}/sessions/{session_id}/live", get(live_session))
        // Push
        .route("/api/sessions/{session_id}/stream", get(stream_session))
        .route("/api/sessions/{session_id}/events", post(publish_event))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    info!("session-sync v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await;

    state.followers.clear();
    merge.dispose();
    index.dispose().await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
