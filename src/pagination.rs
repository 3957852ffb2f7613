//! Lazy, resumable pagination over remote listings
//!
//! A [`Listing`] fetches one page given an opaque continuation token. The
//! [`Paginator`] drives it one batch at a time through a
//! [`RetryExecutor`], tracking a [`PageCursor`] (last token + records
//! yielded). When a page fetch fails, the error carries the cursor of the
//! last successful batch; [`Paginator::resume`] picks up from there without
//! re-yielding earlier records, provided the upstream order is stable for
//! the lifetime of the query.

use std::future::Future;
use std::marker::PhantomData;

use async_stream::try_stream;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::retry::RetryExecutor;
use crate::{Error, Result};

/// Resume point of a pagination run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    /// Continuation token for the next page; `None` before the first page
    pub token: Option<String>,
    /// Records yielded so far in this logical query
    pub yielded: u64,
}

impl PageCursor {
    /// Cursor positioned before the first page
    #[must_use]
    pub fn start() -> Self {
        Self::default()
    }

    /// Whether nothing has been yielded yet
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.token.is_none() && self.yielded == 0
    }
}

/// One page returned by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Records on this page, in upstream order
    pub records: Vec<T>,
    /// Token for the following page; `None` on the last page
    pub next: Option<String>,
}

/// A remote listing that can be fetched page by page
#[async_trait]
pub trait Listing: Send + Sync {
    /// Record type
    type Item: Send;

    /// Fetch the page after `cursor` (the first page when `None`)
    async fn fetch(&self, cursor: Option<&str>, page_size: usize) -> Result<Page<Self::Item>>;
}

/// Drives a [`Listing`] as a forward-only sequence of batches
pub struct Paginator<L> {
    listing: L,
    executor: RetryExecutor,
    page_size: usize,
    cursor: PageCursor,
    done: bool,
}

impl<L: Listing> Paginator<L> {
    /// Start a fresh run
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero page size.
    pub fn new(listing: L, executor: RetryExecutor, page_size: usize) -> Result<Self> {
        Self::resume(listing, executor, page_size, PageCursor::start())
    }

    /// Continue a run from a cursor surfaced by an earlier failure
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero page size.
    pub fn resume(
        listing: L,
        executor: RetryExecutor,
        page_size: usize,
        cursor: PageCursor,
    ) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::Config("page size must be positive".into()));
        }
        // A cursor past the start without a token means the run had finished
        let done = cursor.token.is_none() && cursor.yielded > 0;
        Ok(Self {
            listing,
            executor,
            page_size,
            cursor,
            done,
        })
    }

    /// Cursor after the last successfully fetched batch
    #[must_use]
    pub fn cursor(&self) -> &PageCursor {
        &self.cursor
    }

    /// Whether the listing is exhausted
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch the next non-empty batch, or `None` once the listing is exhausted
    ///
    /// # Errors
    ///
    /// Returns [`Error::PaginationInterrupted`] carrying the cursor to resume
    /// from, or [`Error::PaginationCursorInvalid`] if the listing hands back
    /// the cursor it was given.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<L::Item>>> {
        while !self.done {
            let token = self.cursor.token.clone();
            let listing = &self.listing;
            let page_size = self.page_size;

            let page = self
                .executor
                .execute("page_fetch", || listing.fetch(token.as_deref(), page_size))
                .await
                .map_err(|e| Error::PaginationInterrupted {
                    cursor: self.cursor.clone(),
                    source: Box::new(e),
                })?;

            if page.next.is_some() && page.next == token {
                return Err(Error::PaginationCursorInvalid(format!(
                    "listing returned the same cursor after {} records",
                    self.cursor.yielded
                )));
            }

            self.cursor.yielded += page.records.len() as u64;
            self.done = page.next.is_none();
            self.cursor.token = page.next;
            debug!(
                records = page.records.len(),
                yielded = self.cursor.yielded,
                done = self.done,
                "Fetched page"
            );

            if !page.records.is_empty() {
                return Ok(Some(page.records));
            }
        }
        Ok(None)
    }

    /// Turn the paginator into a stream of batches
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Vec<L::Item>>> {
        try_stream! {
            while let Some(batch) = self.next_batch().await? {
                yield batch;
            }
        }
    }
}

/// Listing backed by a closure taking the continuation token
pub struct CursorListing<F, T> {
    fetch: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> CursorListing<F, T> {
    /// Wrap `fetch(cursor, page_size)`
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, T> Listing for CursorListing<F, T>
where
    F: Fn(Option<String>, usize) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Page<T>>> + Send,
    T: Send,
{
    type Item = T;

    async fn fetch(&self, cursor: Option<&str>, page_size: usize) -> Result<Page<T>> {
        (self.fetch)(cursor.map(str::to_string), page_size).await
    }
}

/// Listing over an offset/limit remote operation; the continuation token is
/// an encoded offset cursor
pub struct OffsetListing<F, T> {
    fetch: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> OffsetListing<F, T> {
    /// Wrap `fetch(offset, limit)`
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, T> Listing for OffsetListing<F, T>
where
    F: Fn(u64, usize) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<T>>> + Send,
    T: Send,
{
    type Item = T;

    async fn fetch(&self, cursor: Option<&str>, page_size: usize) -> Result<Page<T>> {
        let offset = match cursor {
            Some(token) => decode_offset_cursor(token)?.0,
            None => 0,
        };
        let records = (self.fetch)(offset, page_size).await?;
        // A short page is the last one
        let next = (records.len() >= page_size)
            .then(|| encode_offset_cursor(offset + records.len() as u64, page_size));
        Ok(Page { records, next })
    }
}

#[derive(Deserialize)]
struct OffsetToken {
    #[serde(rename = "o")]
    offset: u64,
    #[serde(rename = "p")]
    page_size: usize,
}

/// Encode an offset cursor as URL-safe base64 JSON
#[must_use]
pub fn encode_offset_cursor(offset: u64, page_size: usize) -> String {
    let json = serde_json::json!({ "o": offset, "p": page_size }).to_string();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode an offset cursor into `(offset, page_size)`
///
/// # Errors
///
/// Returns [`Error::PaginationCursorInvalid`] if the cursor is malformed.
pub fn decode_offset_cursor(cursor: &str) -> Result<(u64, usize)> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim_end_matches('='))
        .map_err(|e| Error::PaginationCursorInvalid(format!("not base64: {e}")))?;
    let token: OffsetToken = serde_json::from_slice(&bytes)
        .map_err(|e| Error::PaginationCursorInvalid(format!("bad cursor payload: {e}")))?;
    if token.page_size == 0 {
        return Err(Error::PaginationCursorInvalid("zero page size".into()));
    }
    Ok((token.offset, token.page_size))
}

/// Position and navigation data for an in-memory page window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    /// Total records in the underlying list
    pub total_records: usize,
    /// Records per page
    pub page_size: usize,
    /// 1-based page number
    pub current_page: usize,
    /// Total number of pages
    pub total_pages: usize,
    /// Index of the first record in this window
    pub start_index: usize,
    /// Index one past the last record in this window
    pub end_index: usize,
    /// Whether a later page exists
    pub has_next: bool,
    /// Whether an earlier page exists
    pub has_previous: bool,
    /// Cursor for the next page
    pub next_cursor: Option<String>,
    /// Cursor for the previous page
    pub previous_cursor: Option<String>,
}

/// One window over an already-materialized list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageWindow<T> {
    /// Records in the window
    pub records: Vec<T>,
    /// Navigation data
    pub info: PageInfo,
}

/// Cut a bounded window out of `items`, starting at `cursor` (or the
/// beginning). A cursor's page size overrides `page_size`.
///
/// # Errors
///
/// Returns [`Error::PaginationCursorInvalid`] for a malformed cursor and
/// [`Error::Config`] for a zero page size.
pub fn paginate_slice<T: Clone>(
    items: &[T],
    cursor: Option<&str>,
    page_size: usize,
) -> Result<PageWindow<T>> {
    let (offset, page_size) = match cursor {
        Some(token) => decode_offset_cursor(token)?,
        None => (0, page_size),
    };
    if page_size == 0 {
        return Err(Error::Config("page size must be positive".into()));
    }

    let total = items.len();
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(total);
    let end = start.saturating_add(page_size).min(total);
    let has_next = end < total;
    let has_previous = start > 0;

    Ok(PageWindow {
        records: items[start..end].to_vec(),
        info: PageInfo {
            total_records: total,
            page_size,
            current_page: start / page_size + 1,
            total_pages: total.div_ceil(page_size).max(1),
            start_index: start,
            end_index: end,
            has_next,
            has_previous,
            next_cursor: has_next.then(|| encode_offset_cursor(end as u64, page_size)),
            previous_cursor: has_previous
                .then(|| encode_offset_cursor(start.saturating_sub(page_size) as u64, page_size)),
        },
    })
}

pub mod soql {
    //! LIMIT/OFFSET helpers for SOQL queries

    use std::sync::LazyLock;

    use regex::Regex;

    static LIMIT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\s+LIMIT\s+\d+").expect("valid LIMIT regex"));
    static OFFSET_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\s+OFFSET\s+\d+").expect("valid OFFSET regex"));
    static LIMIT_VALUE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)").expect("valid LIMIT regex"));
    static OFFSET_VALUE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\bOFFSET\s+(\d+)").expect("valid OFFSET regex"));

    /// Append `LIMIT` (if absent) and `OFFSET` (if absent and non-zero)
    #[must_use]
    pub fn add_limit_offset(query: &str, limit: usize, offset: u64) -> String {
        let mut query = query.trim().to_string();
        if !LIMIT_RE.is_match(&query) {
            query = format!("{query} LIMIT {limit}");
        }
        if offset > 0 && !OFFSET_RE.is_match(&query) {
            query = format!("{query} OFFSET {offset}");
        }
        query
    }

    /// Remove any `LIMIT n` / `OFFSET n` clauses
    #[must_use]
    pub fn strip_limit_offset(query: &str) -> String {
        let query = LIMIT_RE.replace_all(query.trim(), "");
        OFFSET_RE.replace_all(&query, "").into_owned()
    }

    /// `(limit, offset)` already present in a query
    #[must_use]
    pub fn extract_limit_offset(query: &str) -> (Option<usize>, u64) {
        let limit = LIMIT_VALUE_RE
            .captures(query)
            .and_then(|c| c[1].parse().ok());
        let offset = OFFSET_VALUE_RE
            .captures(query)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0);
        (limit, offset)
    }

    /// Query for the page after `current_offset`, or `None` when `total`
    /// says there is nothing left
    #[must_use]
    pub fn next_page_query(
        base: &str,
        current_offset: u64,
        page_size: usize,
        total: Option<u64>,
    ) -> Option<String> {
        let next_offset = current_offset + page_size as u64;
        if total.is_some_and(|t| next_offset >= t) {
            return None;
        }
        Some(add_limit_offset(&strip_limit_offset(base), page_size, next_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fixed dataset served in pages; fails once on the configured call
    struct FlakyListing {
        data: Vec<u32>,
        calls: AtomicU32,
        fail_on_call: Option<u32>,
    }

    #[async_trait]
    impl Listing for FlakyListing {
        type Item = u32;

        async fn fetch(&self, cursor: Option<&str>, page_size: usize) -> Result<Page<u32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_call == Some(call) {
                return Err(Error::NonRetryableRemoteFailure {
                    error_code: "INVALID_QUERY_LOCATOR".into(),
                    category: crate::error::ErrorCategory::Syntax,
                    message: "locator expired".into(),
                    status: Some(400),
                });
            }
            let start: usize = cursor.map_or(0, |c| c.parse().unwrap());
            let end = (start + page_size).min(self.data.len());
            Ok(Page {
                records: self.data[start..end].to_vec(),
                next: (end < self.data.len()).then(|| end.to_string()),
            })
        }
    }

    fn executor() -> RetryExecutor {
        RetryExecutor::new(RetryPolicy::no_retry())
    }

    async fn drain<L: Listing>(paginator: &mut Paginator<L>) -> Result<Vec<L::Item>> {
        let mut all = Vec::new();
        while let Some(batch) = paginator.next_batch().await? {
            all.extend(batch);
        }
        Ok(all)
    }

    #[tokio::test]
    async fn test_full_run_yields_everything_in_batches() {
        let listing = FlakyListing {
            data: (0..25).collect(),
            calls: AtomicU32::new(0),
            fail_on_call: None,
        };
        let mut paginator = Paginator::new(listing, executor(), 10).unwrap();

        let first = paginator.next_batch().await.unwrap().unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(paginator.cursor().yielded, 10);

        let rest = drain(&mut paginator).await.unwrap();
        assert_eq!(rest, (10..25).collect::<Vec<_>>());
        assert!(paginator.is_done());
        assert_eq!(paginator.next_batch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lazy_fetching() {
        let listing = FlakyListing {
            data: (0..100).collect(),
            calls: AtomicU32::new(0),
            fail_on_call: None,
        };
        let mut paginator = Paginator::new(listing, executor(), 10).unwrap();
        assert_eq!(paginator.listing.calls.load(Ordering::SeqCst), 0);

        paginator.next_batch().await.unwrap();
        assert_eq!(paginator.listing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_after_failure_has_no_gaps_or_duplicates() {
        let data: Vec<u32> = (0..47).collect();
        let listing = FlakyListing {
            data: data.clone(),
            calls: AtomicU32::new(0),
            fail_on_call: Some(3),
        };
        let mut paginator = Paginator::new(listing, executor(), 10).unwrap();

        let mut seen = Vec::new();
        let err = loop {
            match paginator.next_batch().await {
                Ok(Some(batch)) => seen.extend(batch),
                Ok(None) => panic!("listing should have failed"),
                Err(e) => break e,
            }
        };
        let cursor = err.cursor().cloned().unwrap();
        assert_eq!(cursor.yielded, 20);
        assert_eq!(seen.len(), 20);

        let listing = FlakyListing {
            data: data.clone(),
            calls: AtomicU32::new(0),
            fail_on_call: None,
        };
        let mut resumed = Paginator::resume(listing, executor(), 10, cursor).unwrap();
        seen.extend(drain(&mut resumed).await.unwrap());

        assert_eq!(seen, data);
        assert_eq!(resumed.cursor().yielded, 47);
    }

    #[tokio::test]
    async fn test_stream_adapter() {
        use futures::TryStreamExt;

        let listing = FlakyListing {
            data: (0..12).collect(),
            calls: AtomicU32::new(0),
            fail_on_call: None,
        };
        let batches: Vec<Vec<u32>> = Paginator::new(listing, executor(), 5)
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec![10, 11]);
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_rejected() {
        let listing = CursorListing::new(|_cursor: Option<String>, _size| async {
            Ok(Page {
                records: vec![1u32],
                next: Some("same".to_string()),
            })
        });
        let mut paginator = Paginator::new(listing, executor(), 1).unwrap();
        paginator.next_batch().await.unwrap();
        let err = paginator.next_batch().await.unwrap_err();
        assert!(matches!(err, Error::PaginationCursorInvalid(_)));
    }

    #[tokio::test]
    async fn test_offset_listing() {
        let data: Arc<Vec<u32>> = Arc::new((0..23).collect());
        let source = Arc::clone(&data);
        let listing = OffsetListing::new(move |offset: u64, limit: usize| {
            let source = Arc::clone(&source);
            async move {
                let start = usize::try_from(offset).unwrap().min(source.len());
                let end = (start + limit).min(source.len());
                Ok(source[start..end].to_vec())
            }
        });
        let mut paginator = Paginator::new(listing, executor(), 10).unwrap();
        assert_eq!(drain(&mut paginator).await.unwrap(), *data);
    }

    #[test]
    fn test_offset_cursor_codec() {
        let cursor = encode_offset_cursor(200, 50);
        assert_eq!(decode_offset_cursor(&cursor).unwrap(), (200, 50));
        assert!(matches!(
            decode_offset_cursor("not a cursor!"),
            Err(Error::PaginationCursorInvalid(_))
        ));
        let garbage = URL_SAFE_NO_PAD.encode("{\"x\":1}");
        assert!(decode_offset_cursor(&garbage).is_err());
    }

    #[test]
    fn test_paginate_slice_navigation() {
        let items: Vec<u32> = (0..25).collect();
        let first = paginate_slice(&items, None, 10).unwrap();
        assert_eq!(first.records, (0..10).collect::<Vec<_>>());
        assert_eq!(first.info.total_pages, 3);
        assert!(first.info.has_next);
        assert!(!first.info.has_previous);

        let second = paginate_slice(&items, first.info.next_cursor.as_deref(), 99).unwrap();
        assert_eq!(second.info.page_size, 10);
        assert_eq!(second.info.current_page, 2);
        assert_eq!(second.records[0], 10);

        let back = paginate_slice(&items, second.info.previous_cursor.as_deref(), 10).unwrap();
        assert_eq!(back.info.start_index, 0);
    }

    #[test]
    fn test_soql_helpers() {
        use soql::*;

        assert_eq!(
            add_limit_offset("SELECT Id FROM Account", 100, 0),
            "SELECT Id FROM Account LIMIT 100"
        );
        assert_eq!(
            add_limit_offset("SELECT Id FROM Account", 100, 200),
            "SELECT Id FROM Account LIMIT 100 OFFSET 200"
        );
        assert_eq!(
            add_limit_offset("SELECT Id FROM Account limit 5", 100, 0),
            "SELECT Id FROM Account limit 5"
        );
        assert_eq!(
            strip_limit_offset("SELECT Id FROM Account LIMIT 10 OFFSET 20"),
            "SELECT Id FROM Account"
        );
        assert_eq!(
            extract_limit_offset("SELECT Id FROM Account LIMIT 10 OFFSET 20"),
            (Some(10), 20)
        );
        assert_eq!(
            next_page_query("SELECT Id FROM Account LIMIT 10", 0, 10, Some(50)).as_deref(),
            Some("SELECT Id FROM Account LIMIT 10 OFFSET 10")
        );
        assert_eq!(next_page_query("SELECT Id FROM Account", 40, 10, Some(50)), None);
    }
}
