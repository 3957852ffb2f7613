//! Org-scoped metadata cache
//!
//! [`MetadataCache`] wraps the generic [`Cache`] with keys made of
//! (org, resource kind, resource name), per-kind default TTLs, org- and
//! object-scoped invalidation, and bulk prefetch for large-object analyses.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{Cache, CacheStatsSnapshot};
use crate::config::CacheConfig;
use crate::session::OrgId;
use crate::{Error, Result};

static FROM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bFROM\s+(\w+)").expect("valid FROM regex"));

const CASE_INSENSITIVE: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Kind of cached resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// sObject describe results
    ObjectMetadata,
    /// Field definitions of an object
    FieldDefinitions,
    /// Validation rules of an object
    ValidationRules,
    /// Apex classes
    ApexClasses,
    /// SOQL result sets
    QueryResults,
    /// Org-level information
    OrgInfo,
    /// Any other resource, by name
    Other(String),
}

impl ResourceKind {
    /// TTL applied when the caller does not give one; `None` falls back to
    /// the cache default
    #[must_use]
    pub fn default_ttl(&self) -> Option<Duration> {
        match self {
            Self::ObjectMetadata | Self::FieldDefinitions => Some(Duration::from_secs(600)),
            Self::ValidationRules | Self::ApexClasses => Some(Duration::from_secs(300)),
            Self::QueryResults => Some(Duration::from_secs(60)),
            Self::OrgInfo => Some(Duration::from_secs(3600)),
            Self::Other(_) => None,
        }
    }

    /// Kinds scoped to a single object
    fn is_object_scoped(&self) -> bool {
        matches!(
            self,
            Self::ObjectMetadata | Self::FieldDefinitions | Self::ValidationRules
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjectMetadata => f.write_str("object_metadata"),
            Self::FieldDefinitions => f.write_str("field_definitions"),
            Self::ValidationRules => f.write_str("validation_rules"),
            Self::ApexClasses => f.write_str("apex_classes"),
            Self::QueryResults => f.write_str("query_results"),
            Self::OrgInfo => f.write_str("org_info"),
            Self::Other(name) => write!(f, "other.{name}"),
        }
    }
}

/// Composite cache key: (org, kind, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Owning org
    pub org: OrgId,
    /// Resource kind
    pub kind: ResourceKind,
    /// Resource name; for queries, the whitespace-normalised query text
    pub name: String,
}

impl CacheKey {
    /// Key for `kind`/`name` in `org`
    pub fn new(org: OrgId, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            org,
            kind,
            name: name.into(),
        }
    }

    /// Key for a SOQL result set
    #[must_use]
    pub fn query(org: OrgId, soql: &str) -> Self {
        let normalised = soql.split_whitespace().collect::<Vec<_>>().join(" ");
        Self::new(org, ResourceKind::QueryResults, normalised)
    }

    /// Whether a query key reads from `object`, in its main query or a
    /// subquery
    fn reads_from(&self, object: &str) -> bool {
        FROM_RE
            .captures_iter(&self.name)
            .any(|c| c[1].eq_ignore_ascii_case(object))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == ResourceKind::QueryResults {
            let digest = hex::encode(Sha256::digest(self.name.as_bytes()));
            write!(f, "{}:{}:#{}", self.org, self.kind, &digest[..16])
        } else {
            write!(f, "{}:{}:{}", self.org, self.kind, self.name)
        }
    }
}

/// Outcome of a bulk prefetch
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PrefetchReport {
    /// Names fetched from the platform
    pub fetched: Vec<String>,
    /// Names that were already live in the cache
    pub cached: Vec<String>,
    /// Names whose fetch failed, with the failure
    pub failed: Vec<(String, String)>,
}

/// Metadata cache keyed by org, resource kind and resource name
#[derive(Debug)]
pub struct MetadataCache {
    cache: Arc<Cache<CacheKey, Value>>,
    prefetch_concurrency: usize,
}

impl MetadataCache {
    /// Create the cache
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid cache settings or a zero
    /// prefetch concurrency.
    pub fn new(config: &CacheConfig, prefetch_concurrency: usize) -> Result<Self> {
        if prefetch_concurrency == 0 {
            return Err(Error::Config("prefetch concurrency must be positive".into()));
        }
        Ok(Self {
            cache: Arc::new(Cache::new(config)?),
            prefetch_concurrency,
        })
    }

    /// Underlying cache
    #[must_use]
    pub fn cache(&self) -> &Arc<Cache<CacheKey, Value>> {
        &self.cache
    }

    /// TTL used for `kind` when none is given
    #[must_use]
    pub fn ttl_for(&self, kind: &ResourceKind) -> Duration {
        kind.default_ttl().unwrap_or_else(|| self.cache.default_ttl())
    }

    /// Live value for `key`
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.cache.get(key)
    }

    /// Write through with the kind's TTL
    pub fn put(&self, key: CacheKey, value: Value) {
        let ttl = self.ttl_for(&key.kind);
        self.cache.put(key, value, ttl);
    }

    /// Cached value for `key`, or the result of `producer` which is then
    /// cached for `ttl` (the kind's default when `None`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheProducerFailed`] if the producer fails.
    pub async fn cached_fetch<F, Fut>(
        &self,
        key: CacheKey,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(&key.kind));
        self.cache.get_or_compute(key, ttl, producer).await
    }

    /// Drop one entry
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.cache.invalidate(key)
    }

    /// Drop every entry of `org`
    pub fn invalidate_org(&self, org: &OrgId) -> usize {
        let removed = self.cache.invalidate_matching(|key| &key.org == org);
        info!(org = %org, removed, "Invalidated org cache");
        removed
    }

    /// Drop every entry of `kind` in `org`
    pub fn invalidate_kind(&self, org: &OrgId, kind: &ResourceKind) -> usize {
        self.cache
            .invalidate_matching(|key| &key.org == org && &key.kind == kind)
    }

    /// Drop entries of `kind` in `org` whose name matches a glob such as
    /// `*Account*` (case-insensitive)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a malformed pattern.
    pub fn invalidate_matching(
        &self,
        org: &OrgId,
        kind: &ResourceKind,
        pattern: &str,
    ) -> Result<usize> {
        let pattern = Pattern::new(pattern)
            .map_err(|e| Error::Config(format!("invalid pattern {pattern:?}: {e}")))?;
        let removed = self.cache.invalidate_matching(|key| {
            &key.org == org
                && &key.kind == kind
                && pattern.matches_with(&key.name, CASE_INSENSITIVE)
        });
        debug!(org = %org, kind = %kind, pattern = %pattern, removed, "Invalidated by pattern");
        Ok(removed)
    }

    /// Drop everything cached about `object` in `org`: its describe, fields,
    /// validation rules, and query results reading from it
    pub fn invalidate_object(&self, org: &OrgId, object: &str) -> usize {
        let removed = self.cache.invalidate_matching(|key| {
            if &key.org != org {
                return false;
            }
            if key.kind.is_object_scoped() {
                key.name.eq_ignore_ascii_case(object)
            } else if key.kind == ResourceKind::QueryResults {
                key.reads_from(object)
            } else {
                false
            }
        });
        info!(org = %org, object, removed, "Invalidated object cache");
        removed
    }

    /// Warm the cache for `names` of `kind` in `org`, running at most
    /// `prefetch_concurrency` producers at once. Live entries are skipped
    /// and failures are reported per name.
    pub async fn prefetch<I, F, Fut>(
        &self,
        org: &OrgId,
        kind: ResourceKind,
        names: I,
        producer: F,
    ) -> PrefetchReport
    where
        I: IntoIterator<Item = String>,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let producer = &producer;
        let kind = &kind;
        let outcomes: Vec<(String, Option<Result<()>>)> = stream::iter(names)
            .map(|name| async move {
                let key = CacheKey::new(org.clone(), kind.clone(), name.clone());
                if self.cache.contains(&key) {
                    return (name, None);
                }
                let ttl = self.ttl_for(kind);
                let fetch_name = name.clone();
                let result = self
                    .cache
                    .get_or_compute(key, ttl, || producer(fetch_name))
                    .await
                    .map(|_| ());
                (name, Some(result))
            })
            .buffer_unordered(self.prefetch_concurrency)
            .collect()
            .await;

        let mut report = PrefetchReport::default();
        for (name, outcome) in outcomes {
            match outcome {
                None => report.cached.push(name),
                Some(Ok(())) => report.fetched.push(name),
                Some(Err(e)) => report.failed.push((name, e.to_string())),
            }
        }
        info!(
            org = %org,
            kind = %kind,
            fetched = report.fetched.len(),
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Prefetch finished"
        );
        report
    }

    /// Drop expired entries now
    pub fn evict_expired(&self) -> usize {
        self.cache.evict_expired()
    }

    /// Start a background sweep of expired entries
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        self.cache.spawn_sweeper(interval)
    }

    /// Cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }
}
