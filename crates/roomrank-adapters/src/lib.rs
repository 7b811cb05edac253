//! Ranking feed contract, the provider HTTP feed, and the category download pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use roomrank_core::{Cell, RankType, StagedEntry};
use roomrank_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roomrank-adapters";

/// Consecutive transient page failures tolerated before a category is cut short.
pub const MAX_CONSECUTIVE_SKIPS: usize = 3;

/// Hard stop for a misbehaving continuation chain.
pub const MAX_PAGES_PER_CATEGORY: usize = 1_000;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed feed page for {cell}: {source}")]
    Parse {
        cell: Cell,
        #[source]
        source: serde_json::Error,
    },
    #[error("continuation token `{0}` is not an offset")]
    Token(String),
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Fetch(err) if err.is_transient())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub entries: Vec<StagedEntry>,
    pub next_token: Option<String>,
}

/// Paginated leaderboard source for one locale.
#[async_trait]
pub trait RankingFeed: Send + Sync {
    async fn fetch_page(&self, cell: Cell, token: &str) -> Result<FeedPage, FeedError>;

    fn first_token(&self) -> String {
        "0".to_string()
    }

    /// Token of the page after `token`, used to step over a page that failed to load.
    fn skip_token(&self, _token: &str) -> Option<String> {
        None
    }
}

fn default_page_limit() -> usize {
    40
}

/// Per-locale feed endpoint and static request headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedProfile {
    pub base_url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

pub struct HttpRankingFeed {
    http: Arc<HttpFetcher>,
    profile: FeedProfile,
    headers: HeaderMap,
    run_id: Uuid,
}

impl HttpRankingFeed {
    pub fn new(http: Arc<HttpFetcher>, profile: FeedProfile, run_id: Uuid) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &profile.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid feed header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for feed header {name}"))?;
            headers.insert(name, value);
        }
        Ok(Self {
            http,
            profile,
            headers,
            run_id,
        })
    }

    pub fn page_url(&self, cell: Cell, token: &str) -> String {
        let sort = match cell.rank_type {
            RankType::Ranking => "RANKING",
            RankType::Rising => "RISING",
        };
        format!(
            "{}/api/category/{}?sort={}&limit={}&ct={}",
            self.profile.base_url.trim_end_matches('/'),
            cell.category,
            sort,
            self.profile.page_limit,
            token
        )
    }
}

#[async_trait]
impl RankingFeed for HttpRankingFeed {
    async fn fetch_page(&self, cell: Cell, token: &str) -> Result<FeedPage, FeedError> {
        let offset: usize = token
            .parse()
            .map_err(|_| FeedError::Token(token.to_string()))?;
        let url = self.page_url(cell, token);
        let response = self.http.fetch_bytes(self.run_id, &url, &self.headers).await?;
        parse_feed_page(&response.body, offset)
            .map_err(|source| FeedError::Parse { cell, source })
    }

    fn skip_token(&self, token: &str) -> Option<String> {
        token
            .parse::<usize>()
            .ok()
            .map(|offset| (offset + self.profile.page_limit).to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPage {
    #[serde(default)]
    squares: Vec<RawItem>,
    #[serde(default)]
    continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    square: RawSquare,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSquare {
    emid: String,
    name: String,
    member_count: i32,
}

/// Parse one feed page. Positions continue from `offset`, the number of entries before this page.
pub fn parse_feed_page(body: &[u8], offset: usize) -> Result<FeedPage, serde_json::Error> {
    let raw: RawPage = serde_json::from_slice(body)?;
    let entries = raw
        .squares
        .into_iter()
        .enumerate()
        .map(|(index, item)| StagedEntry {
            external_id: item.square.emid,
            name: item.square.name,
            member_count: item.square.member_count,
            position: (offset + index + 1) as i32,
        })
        .collect();
    let next_token = raw.continuation_token.filter(|t| !t.trim().is_empty());
    Ok(FeedPage {
        entries,
        next_token,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryStats {
    pub pages: usize,
    pub entries: usize,
    pub skipped_pages: usize,
}

/// Walk one cell's continuation chain, handing every page to `on_page` as it arrives.
///
/// Transient page failures are stepped over via [`RankingFeed::skip_token`]; any other failure
/// ends the category with an error and the caller decides what to keep.
pub async fn download_category<F, C>(
    feed: &F,
    cell: Cell,
    mut on_page: C,
) -> Result<CategoryStats, FeedError>
where
    F: RankingFeed + ?Sized,
    C: FnMut(Vec<StagedEntry>) + Send,
{
    let mut stats = CategoryStats::default();
    let mut token = feed.first_token();
    let mut consecutive_skips = 0;

    for _ in 0..MAX_PAGES_PER_CATEGORY {
        match feed.fetch_page(cell, &token).await {
            Ok(page) => {
                consecutive_skips = 0;
                if page.entries.is_empty() {
                    break;
                }
                stats.pages += 1;
                stats.entries += page.entries.len();
                on_page(page.entries);
                match page.next_token {
                    Some(next) if next != token => token = next,
                    _ => break,
                }
            }
            Err(err) if err.is_transient() => {
                stats.skipped_pages += 1;
                consecutive_skips += 1;
                warn!(%cell, token = token.as_str(), error = %err, "skipping feed page");
                if consecutive_skips >= MAX_CONSECUTIVE_SKIPS {
                    warn!(%cell, "too many consecutive page failures; keeping partial category");
                    break;
                }
                match feed.skip_token(&token) {
                    Some(next) => token = next,
                    None => break,
                }
            }
            Err(err) => return Err(err),
        }
    }

    debug!(%cell, pages = stats.pages, entries = stats.entries, "category downloaded");
    Ok(stats)
}

/// Receiver of downloaded entries, one in-memory batch per cell.
#[async_trait]
pub trait CellSink: Send + Sync {
    fn add(&self, cell: Cell, entries: Vec<StagedEntry>);

    /// Drop whatever was buffered for `cell`.
    fn discard(&self, cell: Cell);

    /// Publish the cell's batch; returns the number of entries published.
    async fn commit(&self, cell: Cell) -> anyhow::Result<usize>;
}

/// Cells to download, alternating rank types with rising walking the categories backwards.
pub fn work_order(categories: &[i32]) -> Vec<Cell> {
    let ranking = categories.iter().map(|c| Cell::new(*c, RankType::Ranking));
    let rising = categories.iter().rev().map(|c| Cell::new(*c, RankType::Rising));
    ranking
        .zip(rising)
        .flat_map(|(a, b)| [a, b])
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub cells: usize,
    pub entries: usize,
    pub skipped_pages: usize,
    pub failed_cells: Vec<Cell>,
}

/// Download every cell with at most `batch_size` categories in flight and commit each one.
///
/// A cell that fails outright is committed empty so its consumer still sees it as finished.
pub async fn download_all<F, S>(
    feed: &F,
    sink: &S,
    categories: &[i32],
    batch_size: usize,
) -> anyhow::Result<DownloadSummary>
where
    F: RankingFeed + ?Sized,
    S: CellSink + ?Sized,
{
    let order = work_order(categories);
    let results: Vec<_> = stream::iter(order.into_iter().map(|cell| async move {
        let outcome = download_category(feed, cell, |page| sink.add(cell, page)).await;
        let stats = match outcome {
            Ok(stats) => Some(stats),
            Err(err) => {
                warn!(%cell, error = %err, "category download failed; staging it empty");
                sink.discard(cell);
                None
            }
        };
        let committed = sink
            .commit(cell)
            .await
            .with_context(|| format!("committing staged batch for {cell}"));
        (cell, stats, committed)
    }))
    .buffer_unordered(batch_size.max(1))
    .collect()
    .await;

    let mut summary = DownloadSummary::default();
    for (cell, stats, committed) in results {
        summary.cells += 1;
        committed?;
        match stats {
            Some(stats) => {
                summary.entries += stats.entries;
                summary.skipped_pages += stats.skipped_pages;
            }
            None => summary.failed_cells.push(cell),
        }
    }
    info!(
        cells = summary.cells,
        entries = summary.entries,
        skipped_pages = summary.skipped_pages,
        failed = summary.failed_cells.len(),
        "download pass complete"
    );
    Ok(summary)
}
