//! Axum JSON boundary between the board and whatever renders it.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use twubric_core::{BoardState, DateRange, Phase, RecordId, Scores, SortKey};
use twubric_pipeline::{Board, BoardConfig, BoardEvent};

pub const CRATE_NAME: &str = "twubric-web";

#[derive(Clone)]
pub struct AppState {
    pub board: Arc<Board>,
}

impl AppState {
    pub fn new(board: Arc<Board>) -> Self {
        Self { board }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordRow {
    pub id: RecordId,
    pub username: String,
    pub fullname: Option<String>,
    pub image: Option<String>,
    pub scores: Scores,
    pub join_date: Option<NaiveDate>,
    pub joined: String,
}

/// What the view layer renders: the displayed list plus the active bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardView {
    pub phase: Phase,
    pub range: DateRange,
    pub sort_key: Option<SortKey>,
    pub failure: Option<String>,
    pub records: Vec<RecordRow>,
}

impl From<&BoardState> for BoardView {
    fn from(state: &BoardState) -> Self {
        Self {
            phase: state.phase().clone(),
            range: state.range(),
            sort_key: state.sort_key(),
            failure: state.failure().map(ToString::to_string),
            records: state
                .displayed()
                .iter()
                .map(|r| RecordRow {
                    id: r.id.clone(),
                    username: r.display_name.clone(),
                    fullname: r.fullname.clone(),
                    image: r.image.clone(),
                    scores: r.scores,
                    join_date: r.join_date(),
                    joined: r.join_date_label(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SortRequest {
    key: String,
}

#[derive(Debug, Deserialize, Default)]
struct RangeRequest {
    start: Option<String>,
    end: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/board", get(board_handler))
        .route("/board/sort", post(sort_handler))
        .route("/board/range", post(range_handler))
        .route("/board/records/{id}", delete(delete_handler))
        .route("/board/reload", post(reload_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = BoardConfig::from_env();
    let board = Arc::new(Board::from_config(&config)?);
    board.bootstrap().await;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving board");
    axum::serve(listener, app(AppState::new(board))).await?;
    Ok(())
}

async fn board_handler(State(state): State<Arc<AppState>>) -> Response {
    let board = state.board.bootstrap().await;
    render_board(&board)
}

async fn sort_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SortRequest>,
) -> Response {
    let key = match req.key.parse::<SortKey>() {
        Ok(key) => key,
        Err(err) => return bad_request(err.to_string()),
    };
    let board = state.board.dispatch(BoardEvent::SortKeySelected(key)).await;
    render_board(&board)
}

async fn range_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RangeRequest>,
) -> Response {
    let range = match (parse_bound(req.start.as_deref()), parse_bound(req.end.as_deref())) {
        (Ok(start), Ok(end)) => DateRange::new(start, end),
        (Err(msg), _) | (_, Err(msg)) => return bad_request(msg),
    };
    let board = state.board.dispatch(BoardEvent::DateRangeChanged(range)).await;
    render_board(&board)
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_id): AxumPath<String>,
) -> Response {
    let id = state
        .board
        .current()
        .await
        .resolve_id(&raw_id)
        .unwrap_or(RecordId::Text(raw_id));
    let board = state.board.dispatch(BoardEvent::DeleteRequested(id)).await;
    render_board(&board)
}

async fn reload_handler(State(state): State<Arc<AppState>>) -> Response {
    let board = state.board.dispatch(BoardEvent::ReloadRequested).await;
    render_board(&board)
}

fn render_board(state: &BoardState) -> Response {
    Json(BoardView::from(state)).into_response()
}

fn bad_request(msg: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": msg.into() })),
    )
        .into_response()
}

fn parse_bound(raw: Option<&str>) -> Result<Option<NaiveDate>, String> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(text) => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(Some)
            .map_err(|err| format!("invalid date `{text}`: {err}")),
    }
}
