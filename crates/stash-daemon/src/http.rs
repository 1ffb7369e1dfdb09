use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use stash_proto::form::FormField;
use stash_proto::playback::PlaybackSession;
use stash_proto::protocol::Command;
use stash_proto::state::{AppState, StateManager};
use stash_proto::stations::StationRecord;
use stash_proto::StashError;

use crate::core::{CoreHandle, Reply};
use crate::search::{mark_saved, SearchResult, StationSearch};

#[derive(Clone)]
pub struct HttpState {
    pub state_manager: Arc<StateManager>,
    pub core: CoreHandle,
    pub search: Option<Arc<StationSearch>>,
}

/// A rejected request.  User mistakes map to 4xx, everything else to 500.
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl From<StashError> for ApiError {
    fn from(e: StashError) -> Self {
        Self(e.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<StashError>() {
            Some(StashError::EmptyUrl)
            | Some(StashError::MalformedUrl { .. })
            | Some(StashError::MissingIdentity) => StatusCode::BAD_REQUEST,
            Some(StashError::StationNotFound { .. }) => StatusCode::NOT_FOUND,
            Some(StashError::DuplicateStation { .. }) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("HTTP API: {}", self.0);
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
struct StationView {
    #[serde(flatten)]
    station: StationRecord,
    label: String,
    location: String,
}

#[derive(Serialize)]
struct PlaybackView {
    #[serde(flatten)]
    playback: PlaybackSession,
    status_line: String,
}

#[derive(Deserialize)]
struct UrlQuery {
    url: String,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Deserialize)]
struct PlayBody {
    url: String,
}

#[derive(Deserialize)]
struct FieldBody {
    field: FormField,
    value: String,
}

#[derive(Deserialize)]
struct SignInBody {
    email: String,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route(
            "/api/stations",
            get(list_stations)
                .post(add_station)
                .put(update_station)
                .delete(delete_station),
        )
        .route("/api/import", post(import_playlist))
        .route("/api/playback", get(get_playback))
        .route("/api/play", post(play))
        .route("/api/pause", get(pause).post(pause))
        .route("/api/toggle", get(toggle).post(toggle))
        .route("/api/volume/:value", get(set_volume).post(set_volume))
        .route("/api/mute", get(toggle_mute).post(toggle_mute))
        .route("/api/form/add", post(open_add_form))
        .route("/api/form/edit", post(open_edit_form))
        .route("/api/form/field", post(update_form_field))
        .route("/api/form/reset", post(reset_form))
        .route("/api/form/submit", post(submit_form))
        .route("/api/form/close", post(close_form))
        .route("/api/auth/sign-in", post(sign_in))
        .route("/api/auth/sign-out", post(sign_out))
        .route("/api/search", get(search))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn send(state: &HttpState, cmd: Command) -> ApiResult<Reply> {
    Ok(Json(state.core.request(cmd).await?))
}

async fn get_state(State(state): State<HttpState>) -> Json<AppState> {
    Json(state.state_manager.snapshot().await)
}

async fn list_stations(State(state): State<HttpState>) -> Json<Vec<StationView>> {
    let views: Vec<StationView> = state
        .state_manager
        .read(|s| {
            s.collection
                .list()
                .iter()
                .map(|station| StationView {
                    label: station.label(),
                    location: station.location(),
                    station: station.clone(),
                })
                .collect()
        })
        .await;
    Json(views)
}

async fn add_station(
    State(state): State<HttpState>,
    Json(station): Json<StationRecord>,
) -> ApiResult<Reply> {
    info!("HTTP API: add {}", station.url);
    send(&state, Command::AddStation { station }).await
}

async fn update_station(
    State(state): State<HttpState>,
    Query(query): Query<UrlQuery>,
    Json(station): Json<StationRecord>,
) -> ApiResult<Reply> {
    info!("HTTP API: update {}", query.url);
    send(
        &state,
        Command::UpdateStation {
            original_url: query.url,
            station,
        },
    )
    .await
}

async fn delete_station(
    State(state): State<HttpState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Reply> {
    info!("HTTP API: delete {}", query.url);
    send(&state, Command::DeleteStation { url: query.url }).await
}

async fn import_playlist(State(state): State<HttpState>, content: String) -> ApiResult<Reply> {
    info!("HTTP API: import playlist ({} bytes)", content.len());
    send(&state, Command::ImportPlaylist { content }).await
}

async fn get_playback(State(state): State<HttpState>) -> Json<PlaybackView> {
    let playback = state.state_manager.read(|s| s.playback.clone()).await;
    Json(PlaybackView {
        status_line: playback.status_line(),
        playback,
    })
}

async fn play(State(state): State<HttpState>, Json(body): Json<PlayBody>) -> ApiResult<Reply> {
    info!("HTTP API: play {}", body.url);
    send(&state, Command::PlayUrl { url: body.url }).await
}

async fn pause(State(state): State<HttpState>) -> ApiResult<Reply> {
    send(&state, Command::Pause).await
}

async fn toggle(State(state): State<HttpState>) -> ApiResult<Reply> {
    send(&state, Command::TogglePlayPause).await
}

async fn set_volume(State(state): State<HttpState>, Path(value): Path<i64>) -> ApiResult<Reply> {
    info!("HTTP API: volume {}", value);
    send(&state, Command::Volume { value }).await
}

async fn toggle_mute(State(state): State<HttpState>) -> ApiResult<Reply> {
    send(&state, Command::ToggleMute).await
}

async fn open_add_form(State(state): State<HttpState>) -> ApiResult<Reply> {
    send(&state, Command::OpenAddForm).await
}

async fn open_edit_form(
    State(state): State<HttpState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Reply> {
    send(&state, Command::OpenEditForm { url: query.url }).await
}

async fn update_form_field(
    State(state): State<HttpState>,
    Json(body): Json<FieldBody>,
) -> ApiResult<Reply> {
    send(
        &state,
        Command::UpdateFormField {
            field: body.field,
            value: body.value,
        },
    )
    .await
}

async fn reset_form(State(state): State<HttpState>) -> ApiResult<Reply> {
    send(&state, Command::ResetForm).await
}

async fn submit_form(State(state): State<HttpState>) -> ApiResult<Reply> {
    send(&state, Command::SubmitForm).await
}

async fn close_form(State(state): State<HttpState>) -> ApiResult<Reply> {
    send(&state, Command::CloseForm).await
}

async fn sign_in(State(state): State<HttpState>, Json(body): Json<SignInBody>) -> ApiResult<Reply> {
    send(&state, Command::SignIn { email: body.email }).await
}

async fn sign_out(State(state): State<HttpState>) -> ApiResult<Reply> {
    send(&state, Command::SignOut).await
}

async fn search(
    State(state): State<HttpState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Vec<SearchResult>> {
    let Some(search) = state.search.as_ref() else {
        warn!("HTTP API: search requested but the directory client is unavailable");
        return Ok(Json(Vec::new()));
    };
    let records = search.search(&query.q).await?;
    let results = state
        .state_manager
        .read(|s| mark_saved(records, &s.collection))
        .await;
    Ok(Json(results))
}
