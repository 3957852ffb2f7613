//! Salesforce org core
//!
//! Multi-tenant connection and resource management for Salesforce MCP
//! tooling: a registry of concurrently held org sessions, an org-scoped
//! metadata cache, a retry executor with exponential backoff, and a
//! resumable paginator.
//!
//! # Features
//!
//! - **Session registry**: one session per org, an active-org pointer,
//!   stale and unhealthy eviction, health tracking
//! - **Cache**: TTL + LRU bounds, single-flight `get_or_compute`, org and
//!   object scoped invalidation, bulk prefetch
//! - **Retries**: pluggable classification, longer minimum delay for rate
//!   limits, attempt and wait annotations on exhaustion
//! - **Pagination**: lazy batches, resumable cursors, SOQL offset helpers
//! - **Job polling**: single-shot status checks for bulk jobs and deploys

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod metadata;
pub mod org;
pub mod pagination;
pub mod platform;
pub mod retry;
pub mod session;

pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use metadata::{CacheKey, MetadataCache, ResourceKind};
pub use org::{CoreStats, LogoutTarget, OrgCore, SharedClient};
pub use pagination::{Listing, Page, PageCursor, Paginator};
pub use platform::{HttpPlatformClient, JobRef, JobState, JobStatus, PlatformClient, RequestSpec};
pub use retry::{RetryExecutor, RetryPolicy};
pub use session::{Credentials, OrgId, Session, SessionHealth, SessionRegistry};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `level` when set. `format` selects `"json"` or
/// plain text output.
///
/// # Errors
///
/// Returns [`Error::Config`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Config(format!("tracing already initialized: {e}")))
}
