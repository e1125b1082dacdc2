//! Board orchestration: bootstrap from the snapshot or the feed, then react to
//! sort / date-range / delete events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, info_span, warn, Instrument};
use twubric_core::{BoardState, DateRange, Phase, Record, RecordId, RecordOrigin, SortKey, TransitionError};
use twubric_storage::{FeedFetcher, FetchError, HttpClientConfig, SnapshotStore};
use uuid::Uuid;

pub const CRATE_NAME: &str = "twubric-pipeline";

pub const DEFAULT_FEED_URL: &str = "https://gist.githubusercontent.com/pandemonia/21703a6a303e0487a73b2610c8db41ab/raw/82e3ef99cde5b6e313922a5ccce7f38e17f790ac/twubric.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    pub feed_url: String,
    pub data_dir: PathBuf,
    pub snapshot_slot: String,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
    pub web_port: u16,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl BoardConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            feed_url: lookup("TWUBRIC_FEED_URL").unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            data_dir: lookup("TWUBRIC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            snapshot_slot: lookup("TWUBRIC_SNAPSHOT_SLOT")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "twubric".to_string()),
            user_agent: lookup("TWUBRIC_USER_AGENT")
                .unwrap_or_else(|| "twubric-board/0.1".to_string()),
            http_timeout_secs: lookup("TWUBRIC_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            web_port: lookup("TWUBRIC_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Where the canonical record list comes from when there is no snapshot.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Record>, FetchError>;
}

/// Durable slot for the record list. Reads degrade to "absent" and writes never
/// fail the caller; implementations log instead.
#[async_trait]
pub trait SnapshotGateway: Send + Sync {
    async fn read_snapshot(&self) -> Option<Vec<Record>>;
    async fn write_snapshot(&self, records: &[Record]);
}

#[async_trait]
impl RecordSource for FeedFetcher {
    async fn load(&self) -> Result<Vec<Record>, FetchError> {
        self.fetch().await.map(|feed| feed.records)
    }
}

#[async_trait]
impl SnapshotGateway for SnapshotStore {
    async fn read_snapshot(&self) -> Option<Vec<Record>> {
        match self.read().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "snapshot unreadable; treating as cache miss");
                None
            }
        }
    }

    async fn write_snapshot(&self, records: &[Record]) {
        match self.write(records).await {
            Ok(stored) => debug!(
                path = %stored.path.display(),
                records = stored.record_count,
                unchanged = stored.unchanged,
                hash = %stored.content_hash,
                "snapshot written"
            ),
            Err(err) => warn!(error = %err, "snapshot write failed; keeping in-memory state"),
        }
    }
}

/// Inbound events from the view layer.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    SortKeySelected(SortKey),
    DateRangeChanged(DateRange),
    DeleteRequested(RecordId),
    ReloadRequested,
}

/// Owns the current [`BoardState`] and the I/O collaborators around it.
pub struct Board {
    session_id: Uuid,
    source: Arc<dyn RecordSource>,
    gateway: Arc<dyn SnapshotGateway>,
    state: Mutex<Arc<BoardState>>,
    bootstrap: OnceCell<()>,
    reload_gate: Mutex<()>,
}

impl Board {
    pub fn new(source: Arc<dyn RecordSource>, gateway: Arc<dyn SnapshotGateway>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            source,
            gateway,
            state: Mutex::new(Arc::new(BoardState::new())),
            bootstrap: OnceCell::new(),
            reload_gate: Mutex::new(()),
        }
    }

    pub fn from_config(config: &BoardConfig) -> Result<Self> {
        let fetcher = FeedFetcher::new(config.feed_url.clone(), config.http_client_config())?;
        let store = SnapshotStore::new(config.data_dir.clone(), config.snapshot_slot.clone());
        Ok(Self::new(Arc::new(fetcher), Arc::new(store)))
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub async fn current(&self) -> Arc<BoardState> {
        self.state.lock().await.clone()
    }

    /// Load the record list once per board. Concurrent callers share the same
    /// in-flight bootstrap; later calls return the settled state.
    pub async fn bootstrap(&self) -> Arc<BoardState> {
        self.bootstrap
            .get_or_init(|| {
                let span = info_span!("bootstrap", session = %self.session_id);
                self.run_bootstrap().instrument(span)
            })
            .await;
        self.current().await
    }

    /// Fetch from the feed regardless of the snapshot and replace the store.
    pub async fn reload(&self) -> Arc<BoardState> {
        self.bootstrap().await;
        let _gate = self.reload_gate.lock().await;
        let span = info_span!("reload", session = %self.session_id);
        if let Err(err) = self.reload_steps().instrument(span).await {
            warn!(error = %err, "reload rejected");
        }
        self.current().await
    }

    /// Make sure the board holds feed data fetched during this session.
    ///
    /// A bootstrap that already went to the network is not repeated; only a
    /// board served from the snapshot is reloaded.
    pub async fn refresh(&self) -> Arc<BoardState> {
        let state = self.bootstrap().await;
        match state.phase() {
            Phase::Ready {
                origin: RecordOrigin::Snapshot,
            } => self.reload().await,
            _ => {
                debug!(phase = state.phase().name(), "bootstrap already hit the feed");
                state
            }
        }
    }

    pub async fn select_sort_key(&self, key: SortKey) -> Arc<BoardState> {
        debug!(%key, "sort key selected");
        self.update(|s| s.apply_sort(key)).await
    }

    pub async fn change_date_range(&self, range: DateRange) -> Arc<BoardState> {
        debug!(start = ?range.start, end = ?range.end, "date range changed");
        self.update(|s| s.apply_filter(range)).await
    }

    /// Delete from the displayed list and persist the result as the new baseline.
    pub async fn request_delete(&self, id: &RecordId) -> Arc<BoardState> {
        let mut guard = self.state.lock().await;
        let Some(next) = guard.apply_delete(id) else {
            debug!(%id, "delete ignored; id not displayed");
            return guard.clone();
        };
        let next = Arc::new(next);
        *guard = next.clone();
        info!(%id, remaining = next.store().len(), "record deleted");
        self.gateway.write_snapshot(next.store()).await;
        next
    }

    pub async fn dispatch(&self, event: BoardEvent) -> Arc<BoardState> {
        match event {
            BoardEvent::SortKeySelected(key) => self.select_sort_key(key).await,
            BoardEvent::DateRangeChanged(range) => self.change_date_range(range).await,
            BoardEvent::DeleteRequested(id) => self.request_delete(&id).await,
            BoardEvent::ReloadRequested => self.reload().await,
        }
    }

    async fn run_bootstrap(&self) {
        if let Err(err) = self.bootstrap_steps().await {
            warn!(error = %err, "bootstrap rejected");
        }
    }

    async fn bootstrap_steps(&self) -> Result<(), TransitionError> {
        self.transition(|s| s.with_phase(Phase::CacheCheck)).await?;
        if let Some(records) = self.gateway.read_snapshot().await {
            info!(records = records.len(), "loaded records from snapshot");
            self.transition(|s| s.with_phase(Phase::Cached)).await?;
            self.transition(|s| s.apply_reload(records, RecordOrigin::Snapshot))
                .await?;
            return Ok(());
        }
        self.transition(|s| s.with_phase(Phase::Fetching)).await?;
        self.acquire().await
    }

    async fn reload_steps(&self) -> Result<(), TransitionError> {
        self.transition(|s| s.with_phase(Phase::Fetching)).await?;
        self.acquire().await
    }

    async fn acquire(&self) -> Result<(), TransitionError> {
        match self.source.load().await {
            Ok(records) => {
                info!(records = records.len(), "loaded records from feed");
                self.gateway.write_snapshot(&records).await;
                self.transition(|s| s.apply_reload(records, RecordOrigin::Network))
                    .await?;
            }
            Err(err) => {
                warn!(error = %err, status = ?err.status(), "feed fetch failed");
                self.transition(|s| s.apply_failure(err.to_string())).await?;
            }
        }
        Ok(())
    }

    async fn transition<F>(&self, step: F) -> Result<(), TransitionError>
    where
        F: FnOnce(&BoardState) -> Result<BoardState, TransitionError>,
    {
        let mut guard = self.state.lock().await;
        let next = step(&guard)?;
        debug!(from = guard.phase().name(), to = next.phase().name(), "phase transition");
        *guard = Arc::new(next);
        Ok(())
    }

    async fn update<F>(&self, step: F) -> Arc<BoardState>
    where
        F: FnOnce(&BoardState) -> BoardState,
    {
        let mut guard = self.state.lock().await;
        let next = Arc::new(step(&guard));
        *guard = next.clone();
        next
    }
}

/// Build a board from `TWUBRIC_*` env vars and run its bootstrap.
pub async fn bootstrap_from_env() -> Result<Board> {
    let config = BoardConfig::from_env();
    let board = Board::from_config(&config)?;
    board.bootstrap().await;
    Ok(board)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{http::StatusCode, routing::get, Router};
    use chrono::NaiveDate;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    const FEED: &str = r#"[
        {"uid": 1, "username": "one", "twubric": {"total": 10, "friends": 3, "influence": 4, "chirpiness": 3}, "join_date": "2020-01-01"},
        {"uid": 2, "username": "two", "twubric": {"total": 20, "friends": 8, "influence": 6, "chirpiness": 6}, "join_date": "2021-01-01"}
    ]"#;

    fn feed_records() -> Vec<Record> {
        serde_json::from_str(FEED).unwrap()
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r.id.to_string()).collect()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    struct FakeSource {
        calls: AtomicUsize,
        delay: Duration,
        fail_with: Option<u16>,
    }

    impl FakeSource {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail_with: None,
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                fail_with: Some(status),
                ..Self::ok()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecordSource for FakeSource {
        async fn load(&self) -> Result<Vec<Record>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.fail_with {
                Some(status) => Err(FetchError::HttpStatus {
                    status,
                    status_text: "Internal Server Error".into(),
                    url: "http://feed.test/".into(),
                }),
                None => Ok(feed_records()),
            }
        }
    }

    #[derive(Default)]
    struct MemoryGateway {
        slot: std::sync::Mutex<Option<Vec<Record>>>,
        writes: AtomicUsize,
    }

    impl MemoryGateway {
        fn seeded(records: Vec<Record>) -> Self {
            Self {
                slot: std::sync::Mutex::new(Some(records)),
                writes: AtomicUsize::new(0),
            }
        }

        fn stored(&self) -> Option<Vec<Record>> {
            self.slot.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SnapshotGateway for MemoryGateway {
        async fn read_snapshot(&self) -> Option<Vec<Record>> {
            self.stored()
        }

        async fn write_snapshot(&self, records: &[Record]) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            *self.slot.lock().unwrap() = Some(records.to_vec());
        }
    }

    fn board_with(source: Arc<FakeSource>, gateway: Arc<MemoryGateway>) -> Board {
        Board::new(source, gateway)
    }

    #[tokio::test]
    async fn cold_bootstrap_fetches_and_persists() {
        let source = Arc::new(FakeSource::ok());
        let gateway = Arc::new(MemoryGateway::default());
        let board = board_with(source.clone(), gateway.clone());

        let state = board.bootstrap().await;
        assert_eq!(ids(state.displayed()), ["1", "2"]);
        assert_eq!(
            state.phase(),
            &Phase::Ready {
                origin: RecordOrigin::Network
            }
        );
        assert_eq!(gateway.stored().map(|r| ids(&r)), Some(vec!["1".to_string(), "2".to_string()]));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn cached_snapshot_skips_network() {
        let source = Arc::new(FakeSource::ok());
        let gateway = Arc::new(MemoryGateway::seeded(feed_records()[..1].to_vec()));
        let board = board_with(source.clone(), gateway.clone());

        let state = board.bootstrap().await;
        assert_eq!(ids(state.displayed()), ["1"]);
        assert_eq!(
            state.phase(),
            &Phase::Ready {
                origin: RecordOrigin::Snapshot
            }
        );
        assert_eq!(source.calls(), 0);
        assert_eq!(gateway.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn date_range_then_sort_then_delete() {
        let gateway = Arc::new(MemoryGateway::default());
        let board = board_with(Arc::new(FakeSource::ok()), gateway.clone());
        board.bootstrap().await;

        let filtered = board
            .change_date_range(DateRange::between(date("2020-06-01"), date("2021-12-31")))
            .await;
        assert_eq!(ids(filtered.displayed()), ["2"]);

        let cleared = board.change_date_range(DateRange::unbounded()).await;
        assert_eq!(ids(cleared.displayed()), ["1", "2"]);

        let sorted = board.select_sort_key(SortKey::Total).await;
        assert_eq!(ids(sorted.displayed()), ["2", "1"]);

        let after = board.dispatch(BoardEvent::DeleteRequested(RecordId::Int(2))).await;
        assert_eq!(ids(after.displayed()), ["1"]);
        assert_eq!(gateway.stored().map(|r| ids(&r)), Some(vec!["1".to_string()]));
    }

    #[tokio::test]
    async fn deleting_unknown_id_writes_nothing() {
        let gateway = Arc::new(MemoryGateway::default());
        let board = board_with(Arc::new(FakeSource::ok()), gateway.clone());
        board.bootstrap().await;
        let writes_after_bootstrap = gateway.writes.load(Ordering::SeqCst);

        let state = board.request_delete(&RecordId::Int(99)).await;
        assert_eq!(ids(state.displayed()), ["1", "2"]);
        assert_eq!(gateway.writes.load(Ordering::SeqCst), writes_after_bootstrap);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_board_empty() {
        let gateway = Arc::new(MemoryGateway::default());
        let board = board_with(Arc::new(FakeSource::failing(500)), gateway.clone());

        let state = board.bootstrap().await;
        assert!(state.displayed().is_empty());
        assert!(state.failure().unwrap().contains("500"));
        assert!(gateway.stored().is_none());

        let again = board.bootstrap().await;
        assert_eq!(again.phase(), state.phase());
    }

    #[tokio::test]
    async fn concurrent_bootstraps_share_one_fetch() {
        let source = Arc::new(FakeSource {
            delay: Duration::from_millis(50),
            ..FakeSource::ok()
        });
        let board = board_with(source.clone(), Arc::new(MemoryGateway::default()));

        let (a, b) = tokio::join!(board.bootstrap(), board.bootstrap());
        assert_eq!(source.calls(), 1);
        assert_eq!(ids(a.displayed()), ids(b.displayed()));
        assert_eq!(board.bootstrap().await.displayed().len(), 2);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn reload_refetches_and_keeps_view_settings() {
        let source = Arc::new(FakeSource::ok());
        let gateway = Arc::new(MemoryGateway::seeded(feed_records()[..1].to_vec()));
        let board = board_with(source.clone(), gateway.clone());
        board.bootstrap().await;
        board.select_sort_key(SortKey::Total).await;

        let state = board.dispatch(BoardEvent::ReloadRequested).await;
        assert_eq!(source.calls(), 1);
        assert_eq!(ids(state.displayed()), ["2", "1"]);
        assert_eq!(state.sort_key(), Some(SortKey::Total));
        assert_eq!(gateway.stored().map(|r| r.len()), Some(2));
    }

    #[tokio::test]
    async fn corrupt_snapshot_falls_through_to_feed() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), "twubric");
        std::fs::write(store.slot_path(), b"{ definitely not a list").unwrap();
        let source = Arc::new(FakeSource::ok());
        let board = Board::new(source.clone(), Arc::new(store.clone()));

        let state = board.bootstrap().await;
        assert_eq!(source.calls(), 1);
        assert_eq!(state.displayed().len(), 2);
        assert_eq!(store.read().await.unwrap().map(|r| r.len()), Some(2));
    }

    #[tokio::test]
    async fn snapshot_write_failure_keeps_memory_state() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let store = SnapshotStore::new(blocker.join("data"), "twubric");
        let board = Board::new(Arc::new(FakeSource::ok()), Arc::new(store));

        let state = board.bootstrap().await;
        assert_eq!(ids(state.displayed()), ["1", "2"]);
        let after = board.request_delete(&RecordId::Int(1)).await;
        assert_eq!(ids(after.displayed()), ["2"]);
    }

    #[tokio::test]
    async fn http_500_end_to_end_through_real_fetcher() {
        let app = Router::new().route(
            "/feed",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "down") }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempdir().unwrap();
        let config = BoardConfig::from_lookup(|key| match key {
            "TWUBRIC_FEED_URL" => Some(format!("http://{addr}/feed")),
            "TWUBRIC_DATA_DIR" => Some(dir.path().display().to_string()),
            _ => None,
        });
        let board = Board::from_config(&config).unwrap();
        let state = board.bootstrap().await;

        assert!(state.displayed().is_empty());
        assert!(matches!(state.phase(), Phase::FetchFailed { .. }));
        assert!(!dir.path().join("twubric.json").exists());
    }

    #[tokio::test]
    async fn refresh_on_cold_start_fetches_once() {
        let source = Arc::new(FakeSource::ok());
        let gateway = Arc::new(MemoryGateway::default());
        let board = board_with(source.clone(), gateway.clone());

        let state = board.refresh().await;
        assert_eq!(ids(state.displayed()), ["1", "2"]);
        assert_eq!(source.calls(), 1);
        assert_eq!(gateway.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_over_cached_snapshot_hits_the_feed() {
        let source = Arc::new(FakeSource::ok());
        let gateway = Arc::new(MemoryGateway::seeded(feed_records()[..1].to_vec()));
        let board = board_with(source.clone(), gateway.clone());

        let state = board.refresh().await;
        assert_eq!(source.calls(), 1);
        assert_eq!(ids(state.displayed()), ["1", "2"]);
        assert_eq!(
            state.phase(),
            &Phase::Ready {
                origin: RecordOrigin::Network
            }
        );
        assert_eq!(gateway.stored().map(|r| r.len()), Some(2));
    }

    #[tokio::test]
    async fn refresh_after_failed_bootstrap_does_not_retry() {
        let source = Arc::new(FakeSource::failing(500));
        let board = board_with(source.clone(), Arc::new(MemoryGateway::default()));

        let state = board.refresh().await;
        assert_eq!(source.calls(), 1);
        assert!(matches!(state.phase(), Phase::FetchFailed { .. }));
    }

    #[tokio::test]
    async fn partial_feed_records_reach_ready_board() {
        const PARTIAL: &str = r#"[
            {"uid": 1, "username": "one", "twubric": {"total": 10, "friends": 3, "influence": 4, "chirpiness": 3}, "join_date": "2020-01-01"},
            {"uid": 2, "twubric": {"total": 20, "friends": 8, "influence": 6}, "join_date": "2021-01-01"}
        ]"#;
        let app = Router::new().route("/feed", get(|| async { PARTIAL }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempdir().unwrap();
        let config = BoardConfig::from_lookup(|key| match key {
            "TWUBRIC_FEED_URL" => Some(format!("http://{addr}/feed")),
            "TWUBRIC_DATA_DIR" => Some(dir.path().display().to_string()),
            _ => None,
        });
        let board = Board::from_config(&config).unwrap();
        let state = board.bootstrap().await;

        assert_eq!(
            state.phase(),
            &Phase::Ready {
                origin: RecordOrigin::Network
            }
        );
        assert_eq!(ids(state.displayed()), ["1", "2"]);
        assert_eq!(state.displayed()[1].display_name, "");
        assert_eq!(state.displayed()[1].score(SortKey::Chirpiness), 0.0);

        let sorted = board.select_sort_key(SortKey::Chirpiness).await;
        assert_eq!(ids(sorted.displayed()), ["1", "2"]);
        let persisted = SnapshotStore::new(dir.path(), "twubric").read().await.unwrap();
        assert_eq!(persisted.map(|r| r.len()), Some(2));
    }

    #[test]
    fn config_lookup_applies_defaults_and_overrides() {
        let defaults = BoardConfig::default();
        assert_eq!(defaults.feed_url, DEFAULT_FEED_URL);
        assert_eq!(defaults.snapshot_slot, "twubric");
        assert_eq!(defaults.web_port, 8000);
        assert_eq!(defaults.http_client_config().timeout, None);

        let custom = BoardConfig::from_lookup(|key| match key {
            "TWUBRIC_HTTP_TIMEOUT_SECS" => Some("7".into()),
            "TWUBRIC_WEB_PORT" => Some("not-a-port".into()),
            "TWUBRIC_SNAPSHOT_SLOT" => Some("  ".into()),
            _ => None,
        });
        assert_eq!(custom.http_client_config().timeout, Some(Duration::from_secs(7)));
        assert_eq!(custom.web_port, 8000);
        assert_eq!(custom.snapshot_slot, "twubric");
    }
}
