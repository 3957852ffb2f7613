//! Error types for the org core
//!
//! Every surfaced failure carries enough structure (kind, org identity,
//! attempt count, pagination cursor) for the tool layer to render an
//! actionable message without this crate knowing about presentation.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::pagination::PageCursor;
use crate::session::OrgId;

/// Result type alias for the org core
pub type Result<T> = std::result::Result<T, Error>;

/// Org core errors
#[derive(Error, Debug)]
pub enum Error {
    /// No org identity given and no active org is set
    #[error("No active org session; log in or switch to an org first")]
    NoActiveSession,

    /// Explicit org identity is not registered
    #[error("Unknown org: {0}")]
    UnknownOrg(OrgId),

    /// Login was rejected by the platform
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        /// Org the login targeted, when known
        org: Option<OrgId>,
        /// Platform message
        message: String,
    },

    /// Session token is no longer accepted; the caller must re-authenticate
    #[error("Session expired for org {org}: {message}")]
    SessionExpired {
        /// Affected org
        org: OrgId,
        /// Platform message
        message: String,
    },

    /// Platform signalled an API limit or throttling response
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Delay the platform asked for, if it said
        retry_after: Option<Duration>,
        /// Platform message
        message: String,
    },

    /// Timeout, connection reset or transient server error
    #[error("Transient network failure: {0}")]
    TransientNetworkFailure(String),

    /// Malformed request, not found, permission failure and similar
    #[error("Remote call failed [{error_code}]: {message}")]
    NonRetryableRemoteFailure {
        /// Platform error code (e.g. `MALFORMED_QUERY`)
        error_code: String,
        /// Category derived from the error code
        category: ErrorCategory,
        /// Platform message
        message: String,
        /// HTTP status, when the failure came from an HTTP response
        status: Option<u16>,
    },

    /// Shared cache producer failed; the failure is not cached
    #[error("Cache producer failed for {key}: {source}")]
    CacheProducerFailed {
        /// Rendered cache key
        key: String,
        /// Failure returned by the producer, shared by every waiter
        #[source]
        source: Arc<Error>,
    },

    /// Pagination cursor could not be decoded
    #[error("Invalid pagination cursor: {0}")]
    PaginationCursorInvalid(String),

    /// Retryable failure that outlived the retry budget
    #[error("{operation} failed after {attempts} attempts ({}ms waited): {source}", waited.as_millis())]
    RetriesExhausted {
        /// Operation name
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Cumulative backoff wait
        waited: Duration,
        /// Last failure
        #[source]
        source: Box<Error>,
    },

    /// Page fetch failed mid-sequence; `cursor` resumes after the last good batch
    #[error("Pagination interrupted after {} records: {source}", cursor.yielded)]
    PaginationInterrupted {
        /// Last successfully obtained cursor
        cursor: PageCursor,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error that could not be classified further
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Flat error kind, stable for the tool layer to branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::NoActiveSession`]
    NoActiveSession,
    /// See [`Error::UnknownOrg`]
    UnknownOrg,
    /// See [`Error::AuthenticationFailed`]
    AuthenticationFailed,
    /// See [`Error::SessionExpired`]
    SessionExpired,
    /// See [`Error::RateLimited`]
    RateLimited,
    /// See [`Error::TransientNetworkFailure`]
    TransientNetworkFailure,
    /// See [`Error::NonRetryableRemoteFailure`]
    NonRetryableRemoteFailure,
    /// See [`Error::CacheProducerFailed`]
    CacheProducerFailed,
    /// See [`Error::PaginationCursorInvalid`]
    PaginationCursorInvalid,
    /// Configuration problems
    Config,
    /// IO, JSON, HTTP and internal failures
    Internal,
}

impl Error {
    /// Kind of the underlying failure, looking through retry and
    /// pagination annotations.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoActiveSession => ErrorKind::NoActiveSession,
            Self::UnknownOrg(_) => ErrorKind::UnknownOrg,
            Self::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            Self::SessionExpired { .. } => ErrorKind::SessionExpired,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::TransientNetworkFailure(_) => ErrorKind::TransientNetworkFailure,
            Self::NonRetryableRemoteFailure { .. } => ErrorKind::NonRetryableRemoteFailure,
            Self::CacheProducerFailed { .. } => ErrorKind::CacheProducerFailed,
            Self::PaginationCursorInvalid(_) => ErrorKind::PaginationCursorInvalid,
            Self::RetriesExhausted { source, .. } | Self::PaginationInterrupted { source, .. } => {
                source.kind()
            }
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) | Self::Json(_) | Self::Http(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Default retry classification: rate limits and transient network
    /// failures are worth another attempt, everything else is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::TransientNetworkFailure(_)
        )
    }

    /// Org identity involved in the failure, if any
    #[must_use]
    pub fn org(&self) -> Option<&OrgId> {
        match self {
            Self::UnknownOrg(org) | Self::SessionExpired { org, .. } => Some(org),
            Self::AuthenticationFailed { org, .. } => org.as_ref(),
            Self::CacheProducerFailed { source, .. } => source.org(),
            Self::RetriesExhausted { source, .. } | Self::PaginationInterrupted { source, .. } => {
                source.org()
            }
            _ => None,
        }
    }

    /// Attempts made before giving up, if the failure went through retries
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            Self::PaginationInterrupted { source, .. } => source.attempts(),
            Self::CacheProducerFailed { source, .. } => source.attempts(),
            _ => None,
        }
    }

    /// Resume cursor, if the failure interrupted a pagination run
    #[must_use]
    pub fn cursor(&self) -> Option<&PageCursor> {
        match self {
            Self::PaginationInterrupted { cursor, .. } => Some(cursor),
            _ => None,
        }
    }

    /// Attach an org identity to an authentication failure raised without one
    #[must_use]
    pub fn for_org(self, org: &OrgId) -> Self {
        match self {
            Self::AuthenticationFailed { org: None, message } => Self::AuthenticationFailed {
                org: Some(org.clone()),
                message,
            },
            other => other,
        }
    }
}

/// Categories of platform errors, derived from the platform error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Login or session problems
    Authentication,
    /// Missing permissions
    Authorization,
    /// Validation rules, triggers
    Validation,
    /// API limits and throttling
    ApiLimit,
    /// Required fields, duplicates, deleted records
    DataIntegrity,
    /// Unknown record, object or field
    NotFound,
    /// Locking, storage
    Configuration,
    /// Timeouts and resets
    Network,
    /// Malformed queries
    Syntax,
    /// Platform-side failures
    System,
    /// Anything unrecognised
    Unknown,
}

impl ErrorCategory {
    /// Categorise a platform error code such as `INVALID_SESSION_ID`
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "INVALID_SESSION_ID" | "INVALID_LOGIN" | "INVALID_GRANT" | "INVALID_AUTH_HEADER" => {
                Self::Authentication
            }
            "INSUFFICIENT_ACCESS" | "INSUFFICIENT_ACCESS_OR_READONLY" | "API_DISABLED_FOR_ORG" => {
                Self::Authorization
            }
            "FIELD_CUSTOM_VALIDATION_EXCEPTION" | "CANNOT_INSERT_UPDATE_ACTIVATE_ENTITY" => {
                Self::Validation
            }
            "REQUEST_LIMIT_EXCEEDED" | "QUERY_TIMEOUT" | "TOO_MANY_SOQL_QUERIES"
            | "CONCURRENT_REQUESTS_LIMIT_EXCEEDED" => Self::ApiLimit,
            "REQUIRED_FIELD_MISSING" | "DUPLICATE_VALUE" | "DELETE_FAILED" | "ENTITY_IS_DELETED" => {
                Self::DataIntegrity
            }
            "NOT_FOUND" | "INVALID_FIELD" | "INVALID_TYPE" | "INVALID_CROSS_REFERENCE_KEY" => {
                Self::NotFound
            }
            "MALFORMED_QUERY" | "INVALID_QUERY_FILTER_OPERATOR" | "INVALID_QUERY_LOCATOR" => {
                Self::Syntax
            }
            "UNABLE_TO_LOCK_ROW" | "STORAGE_LIMIT_EXCEEDED" => Self::Configuration,
            "CONNECTION_RESET" | "TIMEOUT" => Self::Network,
            "SERVER_UNAVAILABLE" | "UNKNOWN_EXCEPTION" => Self::System,
            _ => Self::Unknown,
        }
    }
}

/// Platform error codes that are safe to retry even though they arrive as
/// ordinary error responses.
pub(crate) fn is_transient_code(code: &str) -> bool {
    matches!(
        code,
        "UNABLE_TO_LOCK_ROW" | "CONNECTION_RESET" | "TIMEOUT" | "SERVER_UNAVAILABLE"
    )
}

/// Platform error codes that signal throttling
pub(crate) fn is_rate_limit_code(code: &str) -> bool {
    matches!(
        code,
        "REQUEST_LIMIT_EXCEEDED" | "CONCURRENT_REQUESTS_LIMIT_EXCEEDED"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_annotations() {
        let inner = Error::RateLimited {
            retry_after: None,
            message: "slow down".to_string(),
        };
        let err = Error::RetriesExhausted {
            operation: "query".to_string(),
            attempts: 3,
            waited: Duration::from_millis(300),
            source: Box::new(inner),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.attempts(), Some(3));
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TransientNetworkFailure("reset".into()).is_retryable());
        assert!(!Error::NoActiveSession.is_retryable());
        assert!(
            !Error::SessionExpired {
                org: OrgId::from("00D1"),
                message: "expired".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_org_context() {
        let err = Error::UnknownOrg(OrgId::from("00DA"));
        assert_eq!(err.org().map(OrgId::as_str), Some("00DA"));
        assert_eq!(err.kind(), ErrorKind::UnknownOrg);
        assert!(Error::NoActiveSession.org().is_none());
    }

    #[test]
    fn test_category_from_code() {
        assert_eq!(
            ErrorCategory::from_code("INVALID_SESSION_ID"),
            ErrorCategory::Authentication
        );
        assert_eq!(
            ErrorCategory::from_code("REQUEST_LIMIT_EXCEEDED"),
            ErrorCategory::ApiLimit
        );
        assert_eq!(ErrorCategory::from_code("MALFORMED_QUERY"), ErrorCategory::Syntax);
        assert_eq!(ErrorCategory::from_code("SOMETHING_NEW"), ErrorCategory::Unknown);
        assert!(is_transient_code("UNABLE_TO_LOCK_ROW"));
        assert!(is_rate_limit_code("REQUEST_LIMIT_EXCEEDED"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NoActiveSession).unwrap();
        assert_eq!(json, "\"no_active_session\"");
    }
}
