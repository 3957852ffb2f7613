//! Scripted in-memory platform client shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sf_org_core::config::Config;
use sf_org_core::session::AccessToken;
use sf_org_core::{Credentials, Error, OrgCore, PlatformClient, RequestSpec, Result, Session};

type Handler = dyn Fn(&Session, &RequestSpec, u32) -> Result<Value> + Send + Sync;

/// Answers every call with `handler(session, request, call_number)` after a
/// fixed latency, and records the paths it saw
pub struct MockPlatform {
    handler: Box<Handler>,
    latency: Duration,
    calls: AtomicU32,
    logins: AtomicU32,
    paths: Mutex<Vec<String>>,
}

impl MockPlatform {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Session, &RequestSpec, u32) -> Result<Value> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            latency: Duration::from_millis(20),
            calls: AtomicU32::new(0),
            logins: AtomicU32::new(0),
            paths: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        match credentials {
            Credentials::AccessToken {
                instance_url,
                access_token,
            } => {
                let org = access_token
                    .strip_prefix("token-")
                    .ok_or_else(|| Error::AuthenticationFailed {
                        org: None,
                        message: "bad token".into(),
                    })?;
                Ok(Session::new(
                    org,
                    format!("user@{org}"),
                    instance_url.as_str(),
                    "62.0",
                    AccessToken::new(access_token.as_str()),
                ))
            }
            Credentials::Password { .. } => Err(Error::AuthenticationFailed {
                org: None,
                message: "INVALID_LOGIN".into(),
            }),
        }
    }

    async fn issue_call(&self, session: &Session, request: &RequestSpec) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.paths.lock().push(request.path.clone());
        tokio::time::sleep(self.latency).await;
        (self.handler)(session, request, call)
    }
}

/// Access-token credentials the mock resolves to org `org`
pub fn token_for(org: &str) -> Credentials {
    Credentials::AccessToken {
        instance_url: format!("https://{org}.my.salesforce.com"),
        access_token: format!("token-{org}"),
    }
}

/// Config with fast retries
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_secs(1);
    config.retry.jitter = Duration::ZERO;
    config.retry.rate_limit_min_delay = Duration::from_millis(50);
    config
}

pub fn core_with(platform: &Arc<MockPlatform>) -> OrgCore {
    OrgCore::new(fast_config(), Arc::clone(platform) as Arc<dyn PlatformClient>).unwrap()
}
