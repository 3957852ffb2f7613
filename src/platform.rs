//! Outbound platform client
//!
//! The core only talks to the platform through [`PlatformClient`]: log in,
//! issue one call, and classify the failure. [`HttpPlatformClient`] is the
//! reqwest implementation against the Salesforce REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::PlatformConfig;
use crate::error::{ErrorCategory, is_rate_limit_code, is_transient_code};
use crate::pagination::{Listing, Page, decode_offset_cursor, encode_offset_cursor, soql};
use crate::session::{AccessToken, Credentials, OrgId, Session};
use crate::{Error, Result};

/// One remote call
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    /// HTTP method
    pub method: Method,
    /// Path relative to the versioned data URL (`sobjects/Account/describe`),
    /// or absolute on the instance when it starts with `/`
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Value>,
}

impl RequestSpec {
    /// Request with `method` on `path`
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// `GET path`
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST path` with a JSON body
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    /// `PATCH path` with a JSON body
    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    /// `DELETE path`
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// SOQL query request
    pub fn query(soql: impl Into<String>) -> Self {
        Self::get("query").with_query("q", soql)
    }

    /// Add a query parameter
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the JSON body
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Narrow capability surface the core needs from the platform
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Exchange credentials for an authenticated session
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session>;

    /// Issue one call with an authenticated session. Failures come back
    /// already classified into the crate error taxonomy.
    async fn issue_call(&self, session: &Session, request: &RequestSpec) -> Result<Value>;

    /// Lightweight liveness check for a session
    async fn validate(&self, session: &Session) -> Result<()> {
        self.issue_call(session, &RequestSpec::get("limits"))
            .await
            .map(|_| ())
    }
}

/// Salesforce REST client over reqwest
#[derive(Debug, Clone)]
pub struct HttpPlatformClient {
    client: Client,
    config: PlatformConfig,
}

impl HttpPlatformClient {
    /// Create a client; every call is bounded by `request_timeout`
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the HTTP client cannot
    /// be built.
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn url_for(session: &Session, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{path}", session.instance_url)
        } else {
            format!("{}/{path}", session.data_url())
        }
    }

    async fn password_login(
        &self,
        username: &str,
        password: &str,
        security_token: Option<&str>,
        client_id: &str,
        client_secret: Option<&str>,
        login_url: Option<&str>,
    ) -> Result<Session> {
        let login_url = login_url.unwrap_or(&self.config.login_url);
        let token_url = format!("{}/services/oauth2/token", login_url.trim_end_matches('/'));
        let full_password = format!("{password}{}", security_token.unwrap_or_default());

        let mut form = vec![
            ("grant_type", "password"),
            ("client_id", client_id),
            ("username", username),
            ("password", full_password.as_str()),
        ];
        if let Some(secret) = client_secret {
            form.push(("client_secret", secret));
        }

        let response = self
            .client
            .post(&token_url)
            .form(&form)
            .send()
            .await
            .map_err(transport_failure)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_failure)?;

        if !status.is_success() {
            if status.is_server_error() {
                return Err(Error::TransientNetworkFailure(format!(
                    "login endpoint returned {status}"
                )));
            }
            let message = serde_json::from_str::<OAuthError>(&body).map_or_else(
                |_| format!("login rejected with {status}"),
                |e| format!("{}: {}", e.error, e.error_description.unwrap_or_default()),
            );
            return Err(Error::AuthenticationFailed { org: None, message });
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        let org = org_from_identity_url(&token.id).ok_or_else(|| Error::AuthenticationFailed {
            org: None,
            message: format!("unrecognised identity URL: {}", token.id),
        })?;

        info!(org = %org, username, "Password login succeeded");
        Ok(Session::new(
            org,
            username,
            token.instance_url,
            self.config.api_version.clone(),
            AccessToken::new(token.access_token),
        ))
    }

    async fn token_login(&self, instance_url: &str, access_token: &str) -> Result<Session> {
        // Provisional session so userinfo goes through the normal call path
        let provisional = Session::new(
            "unknown",
            "",
            instance_url,
            self.config.api_version.clone(),
            AccessToken::new(access_token),
        );
        let info = self
            .issue_call(&provisional, &RequestSpec::get("/services/oauth2/userinfo"))
            .await
            .map_err(|e| match e {
                Error::SessionExpired { message, .. } => Error::AuthenticationFailed {
                    org: None,
                    message,
                },
                other => other,
            })?;
        let info: UserInfo = serde_json::from_value(info)?;

        info!(org = %info.organization_id, "Access token login succeeded");
        Ok(Session::new(
            info.organization_id,
            info.preferred_username,
            instance_url,
            self.config.api_version.clone(),
            AccessToken::new(access_token),
        ))
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session> {
        match credentials {
            Credentials::AccessToken {
                instance_url,
                access_token,
            } => self.token_login(instance_url, access_token).await,
            Credentials::Password {
                username,
                password,
                security_token,
                client_id,
                client_secret,
                login_url,
            } => {
                self.password_login(
                    username,
                    password,
                    security_token.as_deref(),
                    client_id,
                    client_secret.as_deref(),
                    login_url.as_deref(),
                )
                .await
            }
        }
    }

    #[tracing::instrument(
        skip(self, session, request),
        fields(
            org = %session.org,
            method = %request.method,
            path = %request.path,
            request_id = %uuid::Uuid::new_v4()
        )
    )]
    async fn issue_call(&self, session: &Session, request: &RequestSpec) -> Result<Value> {
        let url = Self::url_for(session, &request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .bearer_auth(session.token.secret());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(transport_failure)?;
        let status = response.status();
        let retry_after = retry_after(response.headers());
        let body = response.text().await.map_err(transport_failure)?;
        debug!(status = status.as_u16(), bytes = body.len(), "Platform response");

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&body)?);
        }
        Err(classify_failure(&session.org, status, retry_after, &body))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
    id: String,
}

#[derive(Deserialize)]
struct OAuthError {
    error: String,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct UserInfo {
    organization_id: String,
    #[serde(default)]
    preferred_username: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

/// Org id from an identity URL such as
/// `https://login.salesforce.com/id/00Dxx0000001gPL/005xx000001Sv6e`
fn org_from_identity_url(identity: &str) -> Option<String> {
    let url = url::Url::parse(identity).ok()?;
    let mut segments = url.path_segments()?;
    match (segments.next(), segments.next()) {
        (Some("id"), Some(org)) if !org.is_empty() => Some(org.to_string()),
        _ => None,
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn transport_failure(error: reqwest::Error) -> Error {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        Error::TransientNetworkFailure(error.to_string())
    } else {
        Error::Http(error)
    }
}

/// Map an error response onto the crate taxonomy
pub(crate) fn classify_failure(
    org: &OrgId,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Error {
    // REST errors come as `[{"errorCode": .., "message": ..}]`, some
    // endpoints send a bare object
    let parsed = serde_json::from_str::<Vec<PlatformError>>(body)
        .ok()
        .and_then(|errors| errors.into_iter().next())
        .or_else(|| serde_json::from_str::<PlatformError>(body).ok());
    let (code, message) = match parsed {
        Some(e) if !e.error_code.is_empty() => (e.error_code, e.message),
        _ => (String::new(), body.chars().take(500).collect()),
    };

    if status == StatusCode::UNAUTHORIZED || code == "INVALID_SESSION_ID" {
        return Error::SessionExpired {
            org: org.clone(),
            message: if message.is_empty() {
                status.to_string()
            } else {
                message
            },
        };
    }
    if status == StatusCode::TOO_MANY_REQUESTS || is_rate_limit_code(&code) {
        return Error::RateLimited {
            retry_after,
            message,
        };
    }
    if is_transient_code(&code)
        || matches!(
            status,
            StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        )
    {
        return Error::TransientNetworkFailure(format!("{status}: {message}"));
    }

    let error_code = if code.is_empty() {
        status.canonical_reason().unwrap_or("HTTP_ERROR").to_uppercase().replace(' ', "_")
    } else {
        code
    };
    Error::NonRetryableRemoteFailure {
        category: ErrorCategory::from_code(&error_code),
        error_code,
        message,
        status: Some(status.as_u16()),
    }
}

/// SOQL listing that follows the platform's `nextRecordsUrl`
pub struct QueryListing<C> {
    client: C,
    session: Session,
    soql: String,
}

impl<C> QueryListing<C> {
    /// List the records of `soql`
    pub fn new(client: C, session: Session, soql: impl Into<String>) -> Self {
        Self {
            client,
            session,
            soql: soql.into(),
        }
    }
}

#[async_trait]
impl<C> Listing for QueryListing<C>
where
    C: std::ops::Deref + Send + Sync,
    C::Target: PlatformClient,
{
    type Item = Value;

    async fn fetch(&self, cursor: Option<&str>, page_size: usize) -> Result<Page<Value>> {
        let request = match cursor {
            Some(next_url) => RequestSpec::get(next_url),
            None => RequestSpec::query(&self.soql),
        }
        .with_header("Sforce-Query-Options", format!("batchSize={page_size}"));

        let response = self.client.issue_call(&self.session, &request).await?;
        let done = response.get("done").and_then(Value::as_bool).unwrap_or(true);
        let next = response
            .get("nextRecordsUrl")
            .and_then(Value::as_str)
            .filter(|_| !done)
            .map(str::to_string);
        Ok(Page {
            records: records_of(response),
            next,
        })
    }
}

/// SOQL listing paged with `LIMIT`/`OFFSET`; tokens are offset cursors
pub struct SoqlOffsetListing<C> {
    client: C,
    session: Session,
    base: String,
}

impl<C> SoqlOffsetListing<C> {
    /// List `soql`, discarding any `LIMIT`/`OFFSET` it already carries
    pub fn new(client: C, session: Session, soql: &str) -> Self {
        Self {
            client,
            session,
            base: soql::strip_limit_offset(soql),
        }
    }
}

#[async_trait]
impl<C> Listing for SoqlOffsetListing<C>
where
    C: std::ops::Deref + Send + Sync,
    C::Target: PlatformClient,
{
    type Item = Value;

    async fn fetch(&self, cursor: Option<&str>, page_size: usize) -> Result<Page<Value>> {
        let offset = match cursor {
            Some(token) => decode_offset_cursor(token)?.0,
            None => 0,
        };
        let query = soql::add_limit_offset(&self.base, page_size, offset);
        let response = self
            .client
            .issue_call(&self.session, &RequestSpec::query(query))
            .await?;
        let records = records_of(response);
        let next = (records.len() >= page_size)
            .then(|| encode_offset_cursor(offset + records.len() as u64, page_size));
        Ok(Page { records, next })
    }
}

fn records_of(mut response: Value) -> Vec<Value> {
    match response.get_mut("records").map(Value::take) {
        Some(Value::Array(records)) => records,
        _ => Vec::new(),
    }
}

/// Long-running remote job the caller polls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum JobRef {
    /// Bulk API 2.0 ingest job
    BulkIngest(String),
    /// Bulk API 2.0 query job
    BulkQuery(String),
    /// Metadata deploy request
    Deploy(String),
}

impl JobRef {
    /// Job id
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::BulkIngest(id) | Self::BulkQuery(id) | Self::Deploy(id) => id,
        }
    }

    /// Single status request for the job
    #[must_use]
    pub fn status_request(&self) -> RequestSpec {
        match self {
            Self::BulkIngest(id) => RequestSpec::get(format!("jobs/ingest/{id}")),
            Self::BulkQuery(id) => RequestSpec::get(format!("jobs/query/{id}")),
            Self::Deploy(id) => RequestSpec::get(format!("metadata/deployRequest/{id}"))
                .with_query("includeDetails", "false"),
        }
    }
}

/// Normalised job state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, accepting data
    Open,
    /// Data uploaded, waiting to run
    UploadComplete,
    /// Queued on the platform
    Queued,
    /// Running
    InProgress,
    /// Cancellation requested
    Canceling,
    /// Finished successfully
    Completed,
    /// Finished with some component failures
    PartiallySucceeded,
    /// Finished with failure
    Failed,
    /// Aborted or cancelled
    Aborted,
    /// State string this crate does not know
    Unknown(String),
}

impl JobState {
    /// Parse a platform state string (bulk `state` or deploy `status`)
    #[must_use]
    pub fn parse(state: &str) -> Self {
        match state {
            "Open" => Self::Open,
            "UploadComplete" => Self::UploadComplete,
            "Pending" | "Queued" => Self::Queued,
            "InProgress" => Self::InProgress,
            "Canceling" => Self::Canceling,
            "JobComplete" | "Succeeded" => Self::Completed,
            "SucceededPartial" => Self::PartiallySucceeded,
            "Failed" => Self::Failed,
            "Aborted" | "Canceled" => Self::Aborted,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Whether the job will not change state again
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallySucceeded | Self::Failed | Self::Aborted
        )
    }
}

/// Job status at poll time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    /// Job polled
    pub job: JobRef,
    /// Current state
    pub state: JobState,
    /// Whether polling can stop
    pub terminal: bool,
    /// Records or components processed
    pub processed: u64,
    /// Records or components that failed
    pub failed: u64,
    /// Platform error message, if any
    pub message: Option<String>,
}

impl JobStatus {
    /// Interpret a status response for `job`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the response carries no state.
    pub fn from_response(job: JobRef, response: &Value) -> Result<Self> {
        let count = |v: &Value, key: &str| v.get(key).and_then(Value::as_u64).unwrap_or(0);

        let (state, processed, failed, message) = match &job {
            JobRef::BulkIngest(_) | JobRef::BulkQuery(_) => (
                response.get("state"),
                count(response, "numberRecordsProcessed"),
                count(response, "numberRecordsFailed"),
                response.get("errorMessage"),
            ),
            JobRef::Deploy(_) => {
                let result = response.get("deployResult").unwrap_or(response);
                (
                    result.get("status"),
                    count(result, "numberComponentsDeployed"),
                    count(result, "numberComponentErrors"),
                    result.get("errorMessage"),
                )
            }
        };

        let state = state.and_then(Value::as_str).map(JobState::parse).ok_or_else(|| {
            Error::Internal(format!("status response for job {} has no state", job.id()))
        })?;
        Ok(Self {
            terminal: state.is_terminal(),
            state,
            processed,
            failed,
            message: message
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            job,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn org() -> OrgId {
        OrgId::from("00D000000000001")
    }

    #[test]
    fn test_classify_expired_session() {
        let body = r#"[{"message":"Session expired or invalid","errorCode":"INVALID_SESSION_ID"}]"#;
        let err = classify_failure(&org(), StatusCode::UNAUTHORIZED, None, body);
        assert!(matches!(err, Error::SessionExpired { ref message, .. } if message == "Session expired or invalid"));
        assert_eq!(err.org(), Some(&org()));
    }

    #[test]
    fn test_classify_rate_limit() {
        let body = r#"[{"message":"TotalRequests Limit exceeded.","errorCode":"REQUEST_LIMIT_EXCEEDED"}]"#;
        let err = classify_failure(&org(), StatusCode::FORBIDDEN, Some(Duration::from_secs(30)), body);
        assert!(matches!(
            err,
            Error::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(30)
        ));
        assert!(err.is_retryable());

        let err = classify_failure(&org(), StatusCode::TOO_MANY_REQUESTS, None, "");
        assert!(matches!(err, Error::RateLimited { .. }));
    }

    #[test]
    fn test_classify_transient() {
        let err = classify_failure(&org(), StatusCode::SERVICE_UNAVAILABLE, None, "<html>down</html>");
        assert!(matches!(err, Error::TransientNetworkFailure(_)));

        let body = r#"[{"message":"unable to obtain exclusive access","errorCode":"UNABLE_TO_LOCK_ROW"}]"#;
        let err = classify_failure(&org(), StatusCode::BAD_REQUEST, None, body);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_non_retryable() {
        let body = r#"[{"message":"unexpected token: FORM","errorCode":"MALFORMED_QUERY"}]"#;
        let err = classify_failure(&org(), StatusCode::BAD_REQUEST, None, body);
        match err {
            Error::NonRetryableRemoteFailure {
                error_code,
                category,
                status,
                ..
            } => {
                assert_eq!(error_code, "MALFORMED_QUERY");
                assert_eq!(category, ErrorCategory::Syntax);
                assert_eq!(status, Some(400));
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = classify_failure(&org(), StatusCode::NOT_FOUND, None, "");
        assert!(matches!(
            err,
            Error::NonRetryableRemoteFailure { ref error_code, .. } if error_code == "NOT_FOUND"
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_org_from_identity_url() {
        assert_eq!(
            org_from_identity_url("https://login.salesforce.com/id/00Dxx0000001gPL/005xx000001Sv6e"),
            Some("00Dxx0000001gPL".to_string())
        );
        assert_eq!(org_from_identity_url("https://login.salesforce.com/other"), None);
        assert_eq!(org_from_identity_url("not a url"), None);
    }

    #[test]
    fn test_request_urls() {
        let session = Session::new(
            org(),
            "me",
            "https://acme.my.salesforce.com",
            "62.0",
            AccessToken::new("t"),
        );
        assert_eq!(
            HttpPlatformClient::url_for(&session, "sobjects/Account/describe"),
            "https://acme.my.salesforce.com/services/data/v62.0/sobjects/Account/describe"
        );
        assert_eq!(
            HttpPlatformClient::url_for(&session, "/services/data/v62.0/query/01gxx-2000"),
            "https://acme.my.salesforce.com/services/data/v62.0/query/01gxx-2000"
        );
    }

    #[test]
    fn test_bulk_job_status() {
        let response = json!({
            "id": "750xx",
            "state": "InProgress",
            "numberRecordsProcessed": 1200,
            "numberRecordsFailed": 3,
        });
        let status = JobStatus::from_response(JobRef::BulkIngest("750xx".into()), &response).unwrap();
        assert_eq!(status.state, JobState::InProgress);
        assert!(!status.terminal);
        assert_eq!((status.processed, status.failed), (1200, 3));
        assert_eq!(status.message, None);
    }

    #[test]
    fn test_deploy_status() {
        let response = json!({
            "id": "0Afxx",
            "deployResult": {
                "status": "Failed",
                "numberComponentsDeployed": 4,
                "numberComponentErrors": 1,
                "errorMessage": "Apex test failure",
            }
        });
        let status = JobStatus::from_response(JobRef::Deploy("0Afxx".into()), &response).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.terminal);
        assert_eq!(status.message.as_deref(), Some("Apex test failure"));

        assert!(JobStatus::from_response(JobRef::Deploy("x".into()), &json!({})).is_err());
        assert_eq!(JobState::parse("Weird"), JobState::Unknown("Weird".into()));
    }
}
