//! Inbound surface for the tool layer
//!
//! [`OrgCore`] owns the session registry, the metadata cache, the retry
//! executor and the platform client. Tool code authenticates through it,
//! borrows sessions with [`OrgCore::with_session`], and routes remote calls,
//! cached lookups and paginated listings through it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheStatsSnapshot;
use crate::config::Config;
use crate::metadata::{CacheKey, MetadataCache, PrefetchReport, ResourceKind};
use crate::pagination::{Listing, PageCursor, Paginator};
use crate::platform::{
    HttpPlatformClient, JobRef, JobStatus, PlatformClient, QueryListing, RequestSpec,
    SoqlOffsetListing,
};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::session::{
    Credentials, OrgId, RegistryStatsSnapshot, Session, SessionInfo, SessionRegistry,
    ValidationReport,
};
use crate::{Error, ErrorKind, Result};

/// Shared platform client handle
pub type SharedClient = Arc<dyn PlatformClient>;

/// What to log out of
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutTarget {
    /// One org
    Org(OrgId),
    /// Every org
    All,
}

/// Combined registry and cache counters
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    /// Session registry counters
    pub sessions: RegistryStatsSnapshot,
    /// Metadata cache counters
    pub cache: CacheStatsSnapshot,
}

/// Multi-org connection and resource core
pub struct OrgCore {
    config: Config,
    client: SharedClient,
    registry: SessionRegistry,
    metadata: MetadataCache,
    executor: RetryExecutor,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl OrgCore {
    /// Build the core around `client`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: Config, client: SharedClient) -> Result<Self> {
        config.validate()?;
        let policy =
            RetryPolicy::new(&config.retry)?.with_attempt_timeout(config.platform.request_timeout);
        let executor = RetryExecutor::new(policy);
        let registry = SessionRegistry::new(config.session.clone(), executor.clone())?;
        let metadata = MetadataCache::new(&config.cache, config.platform.prefetch_concurrency)?;

        info!(
            cache_capacity = config.cache.capacity,
            max_sessions = config.session.max_sessions,
            max_attempts = config.retry.max_attempts,
            "Org core initialized"
        );
        Ok(Self {
            config,
            client,
            registry,
            metadata,
            executor,
            sweeper: Mutex::new(None),
        })
    }

    /// Build the core with the reqwest platform client
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn with_http_client(config: Config) -> Result<Self> {
        let client = HttpPlatformClient::new(&config.platform)?;
        Self::new(config, Arc::new(client))
    }

    /// Start the expired-entry sweeper if `cache.sweep_interval` is set and
    /// a tokio runtime is available. Returns whether a sweeper is running.
    pub fn start_sweeper(&self) -> bool {
        let Some(interval) = self.config.cache.sweep_interval else {
            return false;
        };
        if Handle::try_current().is_err() {
            debug!("No runtime, cache sweeper not started");
            return false;
        }
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(self.metadata.spawn_sweeper(interval));
        }
        true
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Session registry
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Metadata cache
    #[must_use]
    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    /// Retry executor shared by every remote call
    #[must_use]
    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Platform client
    #[must_use]
    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    /// Log in and register the resulting session. Re-authenticating an org
    /// drops its cached metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if the platform rejects the
    /// credentials, or a network failure after retries.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<OrgId> {
        let session = self
            .executor
            .execute("authenticate", || self.client.authenticate(credentials))
            .await?;
        let org = session.org.clone();

        let registration = self.registry.register(session);
        if registration.replaced.is_some() {
            self.metadata.invalidate_org(&org);
        }
        if let Some(evicted) = &registration.evicted {
            self.metadata.invalidate_org(evicted);
        }
        Ok(org)
    }

    /// Run `f` with the session for `org` (the active org when `None`).
    /// Session-level failures are recorded against the org.
    ///
    /// # Errors
    ///
    /// [`Error::NoActiveSession`] / [`Error::UnknownOrg`] if no session
    /// resolves, otherwise whatever `f` returns.
    pub async fn with_session<F, Fut, T>(&self, org: Option<&OrgId>, f: F) -> Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.registry.get(org)?;
        let id = session.org.clone();

        match f(session).await {
            Ok(value) => {
                self.registry.record_success(&id);
                Ok(value)
            }
            Err(e) => {
                if counts_against_session(&e) {
                    self.registry.record_failure(&id, &e);
                }
                Err(e.for_org(&id))
            }
        }
    }

    /// Issue one remote call for `org` through the retry executor
    ///
    /// # Errors
    ///
    /// Returns the classified platform failure.
    pub async fn call(&self, org: Option<&OrgId>, request: &RequestSpec) -> Result<Value> {
        self.with_session(org, |session| async move {
            self.executor
                .execute("issue_call", || self.client.issue_call(&session, request))
                .await
        })
        .await
    }

    /// Cached value for `key`, or the result of `producer`
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
        self.metadata.cached_fetch(key, ttl, producer).await
    }

    /// Describe an sObject, cached per org
    ///
    /// # Errors
    ///
    /// Session lookup failures, or [`Error::CacheProducerFailed`].
    pub async fn describe_object(&self, org: Option<&OrgId>, object: &str) -> Result<Value> {
        let org = self.resolve(org)?;
        let key = CacheKey::new(org.clone(), ResourceKind::ObjectMetadata, object);
        let request = RequestSpec::get(format!("sobjects/{object}/describe"));
        self.cached_fetch(key, None, || self.call(Some(&org), &request))
            .await
    }

    /// Field definitions of an sObject, cached per org
    ///
    /// # Errors
    ///
    /// Session lookup failures, or [`Error::CacheProducerFailed`].
    pub async fn field_definitions(&self, org: Option<&OrgId>, object: &str) -> Result<Value> {
        let org = self.resolve(org)?;
        let key = CacheKey::new(org.clone(), ResourceKind::FieldDefinitions, object);
        let org = &org;
        self.cached_fetch(key, None, || async move {
            let describe = self.describe_object(Some(org), object).await?;
            Ok(fields_of(describe))
        })
        .await
    }

    /// Run a SOQL query once and cache the first page of results
    ///
    /// # Errors
    ///
    /// Session lookup failures, or [`Error::CacheProducerFailed`].
    pub async fn cached_query(&self, org: Option<&OrgId>, soql: &str) -> Result<Value> {
        let org = self.resolve(org)?;
        let key = CacheKey::query(org.clone(), soql);
        let request = RequestSpec::query(soql);
        self.cached_fetch(key, None, || self.call(Some(&org), &request))
            .await
    }

    /// Warm field definitions for many objects with bounded concurrency
    ///
    /// # Errors
    ///
    /// Session lookup failures; per-object failures land in the report.
    pub async fn prefetch_fields(
        &self,
        org: Option<&OrgId>,
        objects: Vec<String>,
    ) -> Result<PrefetchReport> {
        let org = self.resolve(org)?;
        let report = self
            .metadata
            .prefetch(&org, ResourceKind::FieldDefinitions, objects, |object| {
                let org = org.clone();
                async move {
                    let describe = self.describe_object(Some(&org), &object).await?;
                    Ok(fields_of(describe))
                }
            })
            .await;
        Ok(report)
    }

    /// Paginate any listing through the shared retry executor
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero page size.
    pub fn paginate<L: Listing>(&self, listing: L, page_size: usize) -> Result<Paginator<L>> {
        Paginator::new(listing, self.executor.clone(), page_size)
    }

    /// Resume a listing from a cursor surfaced by a failure
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero page size.
    pub fn resume<L: Listing>(
        &self,
        listing: L,
        page_size: usize,
        cursor: PageCursor,
    ) -> Result<Paginator<L>> {
        Paginator::resume(listing, self.executor.clone(), page_size, cursor)
    }

    /// Paginate a SOQL query via `nextRecordsUrl`
    ///
    /// # Errors
    ///
    /// Session lookup failures, or [`Error::Config`] for a zero page size.
    pub fn query_pages(
        &self,
        org: Option<&OrgId>,
        soql: &str,
        page_size: usize,
    ) -> Result<Paginator<QueryListing<SharedClient>>> {
        let session = self.registry.get(org)?;
        self.paginate(
            QueryListing::new(Arc::clone(&self.client), session, soql),
            page_size,
        )
    }

    /// Paginate a SOQL query with `LIMIT`/`OFFSET`
    ///
    /// # Errors
    ///
    /// Session lookup failures, or [`Error::Config`] for a zero page size.
    pub fn query_offset_pages(
        &self,
        org: Option<&OrgId>,
        soql: &str,
        page_size: usize,
    ) -> Result<Paginator<SoqlOffsetListing<SharedClient>>> {
        let session = self.registry.get(org)?;
        self.paginate(
            SoqlOffsetListing::new(Arc::clone(&self.client), session, soql),
            page_size,
        )
    }

    /// Run `f` under the shared retry policy
    ///
    /// # Errors
    ///
    /// Same as [`RetryExecutor::execute`].
    pub async fn retrying<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.executor.execute(operation, f).await
    }

    /// Make `org` the default target
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOrg`] if `org` is not registered.
    pub fn switch_org(&self, org: &OrgId) -> Result<()> {
        self.registry.set_active(org)
    }

    /// Drop sessions and their cached metadata
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOrg`] if a single org is not registered.
    pub fn logout(&self, target: LogoutTarget) -> Result<Vec<OrgId>> {
        match target {
            LogoutTarget::Org(org) => {
                self.registry
                    .evict(&org)
                    .ok_or_else(|| Error::UnknownOrg(org.clone()))?;
                self.metadata.invalidate_org(&org);
                info!(org = %org, "Logged out");
                Ok(vec![org])
            }
            LogoutTarget::All => {
                let orgs = self.registry.clear();
                let removed = self.metadata.cache().clear();
                info!(orgs = orgs.len(), removed, "Logged out of every org");
                Ok(orgs)
            }
        }
    }

    /// Poll a long-running job once
    ///
    /// # Errors
    ///
    /// Session lookup or remote failures, or [`Error::Internal`] for an
    /// unreadable status response.
    pub async fn check_job_status(&self, org: Option<&OrgId>, job: JobRef) -> Result<JobStatus> {
        let response = self.call(org, &job.status_request()).await?;
        let status = JobStatus::from_response(job, &response)?;
        debug!(job = status.job.id(), state = ?status.state, "Job status");
        Ok(status)
    }

    /// Validate one session against the platform
    ///
    /// # Errors
    ///
    /// [`Error::UnknownOrg`] or the failure of the remote check.
    pub async fn validate(&self, org: &OrgId) -> Result<()> {
        self.registry.validate(org, self.client.as_ref()).await
    }

    /// Validate every session
    pub async fn validate_all(&self) -> ValidationReport {
        self.registry.validate_all(self.client.as_ref()).await
    }

    /// Remove sessions idle past `session.idle_timeout`, with their cache
    pub fn evict_stale(&self) -> Vec<OrgId> {
        let evicted = self
            .registry
            .evict_stale(self.config.session.idle_timeout);
        for org in &evicted {
            self.metadata.invalidate_org(org);
        }
        evicted
    }

    /// Snapshot of every session
    #[must_use]
    pub fn list_orgs(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    /// Registry and cache counters
    #[must_use]
    pub fn stats(&self) -> CoreStats {
        CoreStats {
            sessions: self.registry.stats(),
            cache: self.metadata.stats(),
        }
    }

    fn resolve(&self, org: Option<&OrgId>) -> Result<OrgId> {
        match org {
            Some(org) if self.registry.contains(org) => Ok(org.clone()),
            Some(org) => Err(Error::UnknownOrg(org.clone())),
            None => self.registry.active().ok_or(Error::NoActiveSession),
        }
    }
}

impl Drop for OrgCore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for OrgCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrgCore")
            .field("registry", &self.registry)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

fn fields_of(mut describe: Value) -> Value {
    describe
        .get_mut("fields")
        .map_or_else(|| Value::Array(Vec::new()), Value::take)
}

/// Failures that say something about the session rather than the request
fn counts_against_session(error: &Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::SessionExpired
            | ErrorKind::AuthenticationFailed
            | ErrorKind::TransientNetworkFailure
    )
}
