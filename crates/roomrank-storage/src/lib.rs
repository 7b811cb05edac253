//! Staging files, durable state records, and HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roomrank-storage";

/// Write `bytes` to `path` through a sibling temp file and an atomic rename.
///
/// When `modified` is given it is stamped on the temp file before the rename, so the final
/// path never carries new content with an old mtime or the reverse.
pub async fn atomic_write(
    path: &Path,
    bytes: &[u8],
    modified: Option<SystemTime>,
) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;

    if let Some(modified) = modified {
        let std_file = file.into_std().await;
        let stamped = tokio::task::spawn_blocking(move || std_file.set_modified(modified))
            .await
            .context("joining mtime task")?;
        if let Err(err) = stamped {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("setting mtime on {}", temp_path.display()));
        }
    } else {
        drop(file);
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

fn system_time_of(ts: DateTime<Utc>) -> SystemTime {
    let secs = ts.timestamp();
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn whole_seconds(time: SystemTime) -> Option<i64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

/// File-backed handoff area between the downloader and the persistence process.
///
/// A staged file is ready for a given logical timestamp exactly when its mtime equals that
/// timestamp (whole seconds). Writers only ever publish through [`atomic_write`].
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    pub async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        logical_timestamp: DateTime<Utc>,
    ) -> anyhow::Result<PathBuf> {
        let path = self.path_for(key);
        atomic_write(&path, bytes, Some(system_time_of(logical_timestamp))).await?;
        Ok(path)
    }

    /// Whether the file for `key` has been published for `expected`.
    pub async fn poll_ready(&self, key: &str, expected: DateTime<Utc>) -> anyhow::Result<bool> {
        let path = self.path_for(key);
        match fs::metadata(&path).await {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .with_context(|| format!("reading mtime of {}", path.display()))?;
                Ok(whole_seconds(modified) == Some(expected.timestamp()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
        }
    }

    /// Read the staged bytes only if they were published for `expected`.
    ///
    /// The mtime check and the read go through one open handle, so a concurrent rename can not
    /// pair the old content with the new timestamp.
    pub async fn read_if_ready(
        &self,
        key: &str,
        expected: DateTime<Utc>,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("opening {}", path.display())),
        };
        let modified = file
            .metadata()
            .await
            .and_then(|m| m.modified())
            .with_context(|| format!("reading mtime of {}", path.display()))?;
        if whole_seconds(modified) != Some(expected.timestamp()) {
            return Ok(None);
        }
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(bytes))
    }
}

/// Small durable JSON records addressed by slash-separated keys.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        let path = self.path_for(key);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    pub async fn write<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let path = self.path_for(key);
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing state record {key}"))?;
        atomic_write(&path, &bytes, None).await
    }

    /// Returns whether a record existed.
    pub async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shutting down")]
    Closed,
}

impl FetchError {
    /// Whether the failure came from the server side and a later request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            FetchError::Closed => false,
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url, headers).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let resp_result = self
                .client
                .get(url)
                .headers(headers.clone())
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::get;
    use axum::Router;
    use chrono::TimeZone;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn slot(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn staged_file_is_ready_only_for_its_logical_timestamp() {
        let dir = tempdir().expect("tempdir");
        let staging = StagingArea::new(dir.path());

        assert!(!staging.poll_ready("ranking/1", slot(3)).await.unwrap());

        staging.put("ranking/1", b"[]", slot(3)).await.expect("put");
        assert!(staging.poll_ready("ranking/1", slot(3)).await.unwrap());
        assert!(!staging.poll_ready("ranking/1", slot(4)).await.unwrap());
        assert_eq!(
            staging.read_if_ready("ranking/1", slot(3)).await.unwrap(),
            Some(b"[]".to_vec())
        );
        assert_eq!(staging.read_if_ready("ranking/1", slot(4)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_reader_never_sees_content_from_another_slot() {
        let dir = tempdir().expect("tempdir");
        let staging = StagingArea::new(dir.path());
        staging.put("rising/0", b"slot-1", slot(1)).await.expect("seed");

        let writer = {
            let staging = staging.clone();
            tokio::spawn(async move {
                for round in 0..200 {
                    let (body, ts): (&[u8], _) = if round % 2 == 0 {
                        (b"slot-2", slot(2))
                    } else {
                        (b"slot-1", slot(1))
                    };
                    staging.put("rising/0", body, ts).await.expect("put");
                    tokio::task::yield_now().await;
                }
            })
        };

        while !writer.is_finished() {
            if let Some(bytes) = staging.read_if_ready("rising/0", slot(2)).await.unwrap() {
                assert_eq!(bytes, b"slot-2");
            }
            if let Some(bytes) = staging.read_if_ready("rising/0", slot(1)).await.unwrap() {
                assert_eq!(bytes, b"slot-1");
            }
            tokio::task::yield_now().await;
        }
        writer.await.expect("writer");

        let leftovers = std::fs::read_dir(dir.path().join("rising"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker {
        date: String,
    }

    #[tokio::test]
    async fn state_records_round_trip_and_remove() {
        let dir = tempdir().expect("tempdir");
        let state = StateStore::new(dir.path());

        assert_eq!(state.read::<Marker>("rollup/ja").await.unwrap(), None);
        state
            .write("rollup/ja", &Marker { date: "2026-03-01".into() })
            .await
            .unwrap();
        assert_eq!(
            state.read::<Marker>("rollup/ja").await.unwrap(),
            Some(Marker { date: "2026-03-01".into() })
        );
        assert!(state.remove("rollup/ja").await.unwrap());
        assert!(!state.remove("rollup/ja").await.unwrap());
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let server = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test".into(),
        };
        let client = FetchError::HttpStatus {
            status: 404,
            url: "https://example.test".into(),
        };
        assert!(server.is_transient());
        assert!(!client.is_transient());
    }

    #[derive(Clone)]
    struct ScriptedUpstream {
        statuses: Arc<Vec<u16>>,
        hits: Arc<AtomicUsize>,
    }

    async fn scripted_page(
        State(upstream): State<ScriptedUpstream>,
    ) -> (axum::http::StatusCode, &'static str) {
        let hit = upstream.hits.fetch_add(1, Ordering::SeqCst);
        let code = upstream
            .statuses
            .get(hit)
            .or(upstream.statuses.last())
            .copied()
            .unwrap_or(200);
        (axum::http::StatusCode::from_u16(code).unwrap(), "page")
    }

    /// Serves the given statuses in order, repeating the last one.
    async fn serve_statuses(statuses: &[u16]) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/page", get(scripted_page))
            .with_state(ScriptedUpstream {
                statuses: Arc::new(statuses.to_vec()),
                hits: hits.clone(),
            });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/page"), hits)
    }

    fn fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn backoff_doubles_per_attempt_up_to_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };
        let delays: Vec<Duration> = (0..4).map(|i| policy.delay_for_attempt(i)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn transient_statuses_are_retried_until_success() {
        let (url, hits) = serve_statuses(&[503, 502, 200]).await;
        let resp = fetcher(3)
            .fetch_bytes(Uuid::new_v4(), &url, &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"page");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_the_policy_limit() {
        let (url, hits) = serve_statuses(&[503]).await;
        let err = fetcher(2)
            .fetch_bytes(Uuid::new_v4(), &url, &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert!(err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hits) = serve_statuses(&[404, 200]).await;
        let err = fetcher(3)
            .fetch_bytes(Uuid::new_v4(), &url, &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
