//! Session registry
//!
//! Holds at most one authenticated [`Session`] per org identity plus the
//! process-wide active-org pointer. Each session lives behind its own lock,
//! so work on different orgs never contends; the active pointer has its own
//! lock and is always acquired before the session map, which keeps
//! `get(None)` consistent with concurrent `set_active`/`evict` calls.
//!
//! Readers and in-place replacements take the pointer lock shared.
//! Membership changes take its upgradable read, which excludes other
//! membership changes but not readers, and upgrade to a write only when
//! the pointer itself has to move.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::platform::PlatformClient;
use crate::retry::RetryExecutor;
use crate::{Error, ErrorKind, Result};

/// Stable org identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(String);

impl OrgId {
    /// Wrap an identity string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrgId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for OrgId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Login material handed to the platform client
#[derive(Clone)]
pub enum Credentials {
    /// Pre-issued access token (e.g. from a CLI login)
    AccessToken {
        /// Instance base URL
        instance_url: String,
        /// Bearer token
        access_token: String,
    },
    /// OAuth username-password flow
    Password {
        /// Username
        username: String,
        /// Password
        password: String,
        /// Security token appended to the password, if the org requires one
        security_token: Option<String>,
        /// Connected app consumer key
        client_id: String,
        /// Connected app consumer secret
        client_secret: Option<String>,
        /// Login endpoint override (e.g. `https://test.salesforce.com`)
        login_url: Option<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessToken { instance_url, .. } => f
                .debug_struct("AccessToken")
                .field("instance_url", instance_url)
                .field("access_token", &"[REDACTED]")
                .finish(),
            Self::Password {
                username,
                login_url,
                ..
            } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .field("login_url", login_url)
                .finish_non_exhaustive(),
        }
    }
}

/// Bearer token of an authenticated session
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    /// Expiry, when the platform reported one
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Token without a known expiry
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            expires_at: None,
        }
    }

    /// Set the expiry
    #[must_use]
    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Raw token for the `Authorization` header
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Whether the token is past its expiry
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Health of a registered session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionHealth {
    /// Last use or validation succeeded
    Healthy,
    /// Token rejected or past expiry; re-authentication needed
    Expired,
    /// Repeated failures or a failed validation
    Invalid,
}

/// One authenticated connection to one org
#[derive(Debug, Clone)]
pub struct Session {
    /// Org identity
    pub org: OrgId,
    /// Display label (username or alias)
    pub label: String,
    /// Base endpoint
    pub instance_url: String,
    /// REST API version, without the `v` prefix
    pub api_version: String,
    /// Bearer token
    pub token: AccessToken,
    /// When the session was authenticated
    pub created_at: DateTime<Utc>,
    /// Last time the session was handed out
    pub last_used: DateTime<Utc>,
    /// Current health
    pub health: SessionHealth,
    /// Times the session was handed out
    pub use_count: u64,
    /// Failures recorded against the session
    pub error_count: u64,
    /// Most recent failure message
    pub last_error: Option<String>,
    consecutive_failures: u32,
}

impl Session {
    /// Fresh, healthy session
    pub fn new(
        org: impl Into<OrgId>,
        label: impl Into<String>,
        instance_url: impl Into<String>,
        api_version: impl Into<String>,
        token: AccessToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            org: org.into(),
            label: label.into(),
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
            token,
            created_at: now,
            last_used: now,
            health: SessionHealth::Healthy,
            use_count: 0,
            error_count: 0,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    /// Time since the session was last handed out
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_used).to_std().unwrap_or_default()
    }

    /// Time since the session was authenticated
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    /// `{instance_url}/services/data/v{api_version}`
    #[must_use]
    pub fn data_url(&self) -> String {
        format!("{}/services/data/v{}", self.instance_url, self.api_version)
    }

    fn touch(&mut self, max_age: Duration) {
        self.last_used = Utc::now();
        self.use_count += 1;
        if self.health == SessionHealth::Healthy
            && (self.token.is_expired() || self.age() >= max_age)
        {
            self.health = SessionHealth::Expired;
            debug!(org = %self.org, "Session past its token expiry or max age");
        }
    }

    fn snapshot(&self, active: bool) -> SessionInfo {
        SessionInfo {
            org: self.org.clone(),
            label: self.label.clone(),
            instance_url: self.instance_url.clone(),
            api_version: self.api_version.clone(),
            health: self.health,
            active,
            created_at: self.created_at,
            last_used: self.last_used,
            use_count: self.use_count,
            error_count: self.error_count,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only view of a registered session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Org identity
    pub org: OrgId,
    /// Display label
    pub label: String,
    /// Base endpoint
    pub instance_url: String,
    /// API version
    pub api_version: String,
    /// Health at snapshot time
    pub health: SessionHealth,
    /// Whether this is the active org
    pub active: bool,
    /// Authentication time
    pub created_at: DateTime<Utc>,
    /// Last use
    pub last_used: DateTime<Utc>,
    /// Times handed out
    pub use_count: u64,
    /// Failures recorded
    pub error_count: u64,
    /// Most recent failure
    pub last_error: Option<String>,
}

/// What a `register` call did
#[derive(Debug, Default)]
pub struct Registration {
    /// Session superseded for the same identity
    pub replaced: Option<Session>,
    /// Other org evicted to stay within `max_sessions`
    pub evicted: Option<OrgId>,
    /// Whether the org became active
    pub activated: bool,
}

/// Outcome of validating every session
#[derive(Debug, Default, Clone, Serialize)]
pub struct ValidationReport {
    /// Orgs that passed
    pub healthy: Vec<OrgId>,
    /// Orgs that failed, with their new health and the failure
    pub unhealthy: Vec<(OrgId, SessionHealth, String)>,
}

/// Registry counters
#[derive(Debug, Default)]
struct RegistryStats {
    lookups: AtomicU64,
    misses: AtomicU64,
    registrations: AtomicU64,
    replacements: AtomicU64,
    evictions: AtomicU64,
    switches: AtomicU64,
}

/// Point-in-time registry counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStatsSnapshot {
    /// Registered sessions
    pub sessions: usize,
    /// Session limit
    pub max_sessions: usize,
    /// Active org
    pub active: Option<OrgId>,
    /// `get` calls
    pub lookups: u64,
    /// `get` calls that failed
    pub misses: u64,
    /// New identities registered
    pub registrations: u64,
    /// Sessions replaced in place
    pub replacements: u64,
    /// Sessions removed
    pub evictions: u64,
    /// Active-org changes
    pub switches: u64,
}

type Slot = Arc<RwLock<Session>>;

/// Registry of authenticated sessions keyed by org identity
pub struct SessionRegistry {
    sessions: DashMap<OrgId, Slot>,
    active: RwLock<Option<OrgId>>,
    config: SessionConfig,
    executor: RetryExecutor,
    stats: RegistryStats,
}

impl SessionRegistry {
    /// Create an empty registry
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid.
    pub fn new(config: SessionConfig, executor: RetryExecutor) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sessions: DashMap::new(),
            active: RwLock::new(None),
            config,
            executor,
            stats: RegistryStats::default(),
        })
    }

    /// Registry configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Insert or replace the session for its org. The first registered org
    /// becomes active; a new org at capacity evicts the least recently used
    /// other org.
    pub fn register(&self, session: Session) -> Registration {
        let org = session.org.clone();
        let slot: Slot = Arc::new(RwLock::new(session));

        {
            let active = self.active.read();
            if active.is_some()
                && let Some(mut existing) = self.sessions.get_mut(&org)
            {
                // New slot so holders of the old one keep a consistent snapshot
                let previous = std::mem::replace(existing.value_mut(), slot);
                drop(existing);
                self.stats.replacements.fetch_add(1, Ordering::Relaxed);
                info!(org = %org, replaced = true, activated = false, "Registered session");
                return Registration {
                    replaced: Some(previous.read().clone()),
                    ..Registration::default()
                };
            }
        }

        // Scan outside the pointer lock; re-checked below
        let candidate = (self.sessions.len() >= self.config.max_sessions)
            .then(|| self.least_recently_used(&org))
            .flatten();

        let active = self.active.upgradable_read();
        let mut registration = Registration::default();
        let mut clear_pointer = false;

        if let Some(previous) = self.sessions.insert(org.clone(), slot) {
            registration.replaced = Some(previous.read().clone());
            self.stats.replacements.fetch_add(1, Ordering::Relaxed);
        } else {
            if self.sessions.len() > self.config.max_sessions {
                let victim = candidate
                    .filter(|victim| self.sessions.contains_key(victim))
                    .or_else(|| self.least_recently_used(&org));
                if let Some(victim) = victim
                    && self.sessions.remove(&victim).is_some()
                {
                    clear_pointer = active.as_ref() == Some(&victim);
                    warn!(org = %victim, "Session limit reached, evicted least recently used org");
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    registration.evicted = Some(victim);
                }
            }
            self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        }

        if clear_pointer || active.is_none() {
            let mut active = RwLockUpgradableReadGuard::upgrade(active);
            *active = Some(org.clone());
            registration.activated = true;
            self.stats.switches.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            org = %org,
            replaced = registration.replaced.is_some(),
            activated = registration.activated,
            "Registered session"
        );
        registration
    }

    /// Session for `org`, or for the active org when `None`. Marks the
    /// session used.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownOrg`] for an unregistered explicit org,
    /// [`Error::NoActiveSession`] when no org is given and none is active.
    pub fn get(&self, org: Option<&OrgId>) -> Result<Session> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);

        let slot = match org {
            Some(org) => self.slot(org).ok_or_else(|| Error::UnknownOrg(org.clone())),
            None => {
                let active = self.active.read();
                active
                    .as_ref()
                    .and_then(|org| self.slot(org))
                    .ok_or(Error::NoActiveSession)
            }
        };
        let slot = slot.inspect_err(|_| {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        })?;

        let mut session = slot.write();
        session.touch(self.config.max_age);
        Ok(session.clone())
    }

    /// Make `org` the default target
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOrg`] if `org` is not registered.
    pub fn set_active(&self, org: &OrgId) -> Result<()> {
        let active = self.active.upgradable_read();
        if !self.sessions.contains_key(org) {
            return Err(Error::UnknownOrg(org.clone()));
        }
        if active.as_ref() != Some(org) {
            let previous = RwLockUpgradableReadGuard::upgrade(active).replace(org.clone());
            self.stats.switches.fetch_add(1, Ordering::Relaxed);
            info!(
                org = %org,
                previous = previous.as_ref().map(OrgId::as_str),
                "Switched active org"
            );
        }
        Ok(())
    }

    /// Currently active org
    #[must_use]
    pub fn active(&self) -> Option<OrgId> {
        self.active.read().clone()
    }

    /// Whether `org` is registered
    #[must_use]
    pub fn contains(&self, org: &OrgId) -> bool {
        self.sessions.contains_key(org)
    }

    /// Number of registered sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all sessions, sorted by org identity
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let active = self.active.read().clone();
        let mut infos: Vec<SessionInfo> = self
            .slots()
            .into_iter()
            .map(|(org, slot)| slot.read().snapshot(active.as_ref() == Some(&org)))
            .collect();
        infos.sort_by(|a, b| a.org.cmp(&b.org));
        infos
    }

    /// Remove `org`, clearing the active pointer if it pointed there
    pub fn evict(&self, org: &OrgId) -> Option<Session> {
        let active = self.active.upgradable_read();
        let (_, slot) = self.sessions.remove(org)?;
        if active.as_ref() == Some(org) {
            *RwLockUpgradableReadGuard::upgrade(active) = None;
        }
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        info!(org = %org, "Evicted session");
        Some(slot.read().clone())
    }

    /// Remove every session idle for longer than `max_idle`
    pub fn evict_stale(&self, max_idle: Duration) -> Vec<OrgId> {
        self.evict_where("idle", |session| session.idle_for() > max_idle)
    }

    /// Remove every session that is not healthy
    pub fn evict_unhealthy(&self) -> Vec<OrgId> {
        self.evict_where("unhealthy", |session| {
            session.health != SessionHealth::Healthy
        })
    }

    /// Remove everything
    pub fn clear(&self) -> Vec<OrgId> {
        self.evict_where("logout", |_| true)
    }

    /// Check `org` with a lightweight remote call through the retry
    /// executor. Failure marks the session expired or invalid but leaves it
    /// registered.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownOrg`] if `org` is not registered, otherwise the
    /// failure of the remote check.
    pub async fn validate(&self, org: &OrgId, client: &dyn PlatformClient) -> Result<()> {
        let slot = self
            .slot(org)
            .ok_or_else(|| Error::UnknownOrg(org.clone()))?;
        let session = slot.read().clone();

        let result = self
            .executor
            .execute("validate_session", || client.validate(&session))
            .await;

        let mut current = slot.write();
        match &result {
            Ok(()) => {
                current.health = SessionHealth::Healthy;
                current.consecutive_failures = 0;
                debug!(org = %org, "Session validated");
            }
            Err(e) => {
                current.health = health_after(e);
                current.error_count += 1;
                current.last_error = Some(e.to_string());
                warn!(org = %org, health = ?current.health, error = %e, "Session validation failed");
            }
        }
        result
    }

    /// Validate every registered session concurrently
    pub async fn validate_all(&self, client: &dyn PlatformClient) -> ValidationReport {
        let orgs: Vec<OrgId> = self.slots().into_iter().map(|(org, _)| org).collect();
        let results = join_all(orgs.iter().map(|org| self.validate(org, client))).await;

        let mut report = ValidationReport::default();
        for (org, result) in orgs.into_iter().zip(results) {
            match result {
                Ok(()) => report.healthy.push(org),
                // Evicted while validating
                Err(Error::UnknownOrg(_)) => {}
                Err(e) => report.unhealthy.push((org, health_after(&e), e.to_string())),
            }
        }
        report
    }

    /// Record a failed call against `org`. An expired-session failure marks
    /// it expired at once; other failures mark it invalid after
    /// `failure_threshold` in a row.
    pub fn record_failure(&self, org: &OrgId, error: &Error) -> Option<SessionHealth> {
        let slot = self.slot(org)?;
        let mut session = slot.write();
        session.error_count += 1;
        session.consecutive_failures += 1;
        session.last_error = Some(error.to_string());

        if matches!(
            error.kind(),
            ErrorKind::SessionExpired | ErrorKind::AuthenticationFailed
        ) {
            session.health = SessionHealth::Expired;
        } else if session.consecutive_failures >= self.config.failure_threshold {
            session.health = SessionHealth::Invalid;
        }
        if session.health != SessionHealth::Healthy {
            warn!(
                org = %org,
                health = ?session.health,
                failures = session.consecutive_failures,
                "Session marked unhealthy"
            );
        }
        Some(session.health)
    }

    /// Record a successful call against `org`
    pub fn record_success(&self, org: &OrgId) {
        if let Some(slot) = self.slot(org) {
            let mut session = slot.write();
            session.consecutive_failures = 0;
            if session.health == SessionHealth::Invalid {
                session.health = SessionHealth::Healthy;
            }
        }
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            sessions: self.sessions.len(),
            max_sessions: self.config.max_sessions,
            active: self.active(),
            lookups: self.stats.lookups.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            registrations: self.stats.registrations.load(Ordering::Relaxed),
            replacements: self.stats.replacements.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            switches: self.stats.switches.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, org: &OrgId) -> Option<Slot> {
        self.sessions.get(org).map(|entry| Arc::clone(entry.value()))
    }

    /// Clone out every slot so no map guard is held while sessions are locked
    fn slots(&self) -> Vec<(OrgId, Slot)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    fn least_recently_used(&self, except: &OrgId) -> Option<OrgId> {
        self.slots()
            .into_iter()
            .filter(|(org, _)| org != except)
            .min_by_key(|(_, slot)| slot.read().last_used)
            .map(|(org, _)| org)
    }

    fn evict_where<F>(&self, reason: &str, predicate: F) -> Vec<OrgId>
    where
        F: Fn(&Session) -> bool,
    {
        let candidates: Vec<(OrgId, Slot)> = self
            .slots()
            .into_iter()
            .filter(|(_, slot)| predicate(&slot.read()))
            .collect();

        let active = self.active.upgradable_read();
        let mut doomed = Vec::with_capacity(candidates.len());
        for (org, slot) in candidates {
            // Skip orgs re-registered since the scan
            if self
                .sessions
                .remove_if(&org, |_, current| Arc::ptr_eq(current, &slot))
                .is_some()
            {
                doomed.push(org);
            }
        }
        if active.as_ref().is_some_and(|org| doomed.contains(org)) {
            *RwLockUpgradableReadGuard::upgrade(active) = None;
        }
        if !doomed.is_empty() {
            self.stats
                .evictions
                .fetch_add(doomed.len() as u64, Ordering::Relaxed);
            info!(count = doomed.len(), reason, "Evicted sessions");
        }
        doomed
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("active", &*self.active.read())
            .finish_non_exhaustive()
    }
}

fn health_after(error: &Error) -> SessionHealth {
    match error.kind() {
        ErrorKind::SessionExpired | ErrorKind::AuthenticationFailed => SessionHealth::Expired,
        _ => SessionHealth::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use pretty_assertions::assert_eq;

    fn session(org: &str) -> Session {
        Session::new(
            org,
            format!("user@{org}.example"),
            format!("https://{org}.my.salesforce.com/"),
            "62.0",
            AccessToken::new(format!("token-{org}")),
        )
    }

    fn registry(max_sessions: usize) -> SessionRegistry {
        let config = SessionConfig {
            max_sessions,
            ..SessionConfig::default()
        };
        SessionRegistry::new(config, RetryExecutor::new(RetryPolicy::no_retry())).unwrap()
    }

    #[test]
    fn test_first_registration_becomes_active() {
        let registry = registry(10);
        assert!(matches!(registry.get(None), Err(Error::NoActiveSession)));

        let registration = registry.register(session("a"));
        assert!(registration.activated);
        registry.register(session("b"));

        assert_eq!(registry.active(), Some(OrgId::from("a")));
        assert_eq!(registry.get(None).unwrap().org.as_str(), "a");
        assert_eq!(
            registry.get(None).unwrap().instance_url,
            "https://a.my.salesforce.com"
        );
    }

    #[test]
    fn test_unknown_org_is_distinct_from_no_active() {
        let registry = registry(10);
        registry.register(session("a"));
        let err = registry.get(Some(&OrgId::from("zzz"))).unwrap_err();
        assert!(matches!(err, Error::UnknownOrg(ref org) if org.as_str() == "zzz"));
        assert!(matches!(
            registry.set_active(&OrgId::from("zzz")),
            Err(Error::UnknownOrg(_))
        ));
        assert_eq!(registry.stats().misses, 1);
    }

    #[test]
    fn test_replace_supersedes_session() {
        let registry = registry(10);
        registry.register(session("a"));
        let mut newer = session("a");
        newer.label = "second login".to_string();

        let registration = registry.register(newer);
        assert_eq!(registration.replaced.unwrap().label, "user@a.example");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(None).unwrap().label, "second login");
        assert_eq!(registry.stats().replacements, 1);
    }

    #[test]
    fn test_evicting_active_clears_pointer() {
        let registry = registry(10);
        registry.register(session("a"));
        registry.register(session("b"));

        assert!(registry.evict(&OrgId::from("a")).is_some());
        assert_eq!(registry.active(), None);
        assert!(matches!(registry.get(None), Err(Error::NoActiveSession)));

        registry.set_active(&OrgId::from("b")).unwrap();
        assert_eq!(registry.get(None).unwrap().org.as_str(), "b");
        assert!(registry.evict(&OrgId::from("a")).is_none());
    }

    #[test]
    fn test_get_tracks_usage_and_list_is_a_snapshot() {
        let registry = registry(10);
        registry.register(session("a"));
        registry.get(None).unwrap();
        registry.get(Some(&OrgId::from("a"))).unwrap();

        let mut listed = registry.list();
        assert_eq!(listed[0].use_count, 2);
        assert!(listed[0].active);

        listed[0].use_count = 99;
        assert_eq!(registry.list()[0].use_count, 2);
    }

    #[test]
    fn test_evict_stale() {
        let registry = registry(10);
        let mut old = session("old");
        old.last_used = Utc::now() - chrono::Duration::minutes(30);
        registry.register(old);
        registry.register(session("fresh"));

        let evicted = registry.evict_stale(Duration::from_secs(600));
        assert_eq!(evicted, vec![OrgId::from("old")]);
        assert_eq!(registry.active(), None);
        assert!(registry.contains(&OrgId::from("fresh")));
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let registry = registry(2);
        let mut a = session("a");
        a.last_used = Utc::now() - chrono::Duration::minutes(5);
        registry.register(a);
        registry.register(session("b"));

        let registration = registry.register(session("c"));
        assert_eq!(registration.evicted, Some(OrgId::from("a")));
        // "a" was active, so "c" takes over
        assert!(registration.activated);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active(), Some(OrgId::from("c")));
    }

    #[test]
    fn test_failures_mark_session_invalid_after_threshold() {
        let registry = registry(10);
        let org = OrgId::from("a");
        registry.register(session("a"));
        let failure = Error::TransientNetworkFailure("reset".into());

        assert_eq!(
            registry.record_failure(&org, &failure),
            Some(SessionHealth::Healthy)
        );
        registry.record_failure(&org, &failure);
        assert_eq!(
            registry.record_failure(&org, &failure),
            Some(SessionHealth::Invalid)
        );

        registry.record_success(&org);
        let info = &registry.list()[0];
        assert_eq!(info.health, SessionHealth::Healthy);
        assert_eq!(info.error_count, 3);
        assert_eq!(info.last_error.as_deref(), Some("Transient network failure: reset"));
    }

    #[test]
    fn test_expired_failure_is_immediate_and_evict_unhealthy() {
        let registry = registry(10);
        let org = OrgId::from("a");
        registry.register(session("a"));
        registry.register(session("b"));
        let expired = Error::SessionExpired {
            org: org.clone(),
            message: "INVALID_SESSION_ID".into(),
        };

        assert_eq!(
            registry.record_failure(&org, &expired),
            Some(SessionHealth::Expired)
        );
        // Marked, not removed
        assert!(registry.contains(&org));
        assert_eq!(registry.evict_unhealthy(), vec![org]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_expired_token_marked_on_use() {
        let registry = registry(10);
        let mut s = session("a");
        s.token = AccessToken::new("t").expiring_at(Utc::now() - chrono::Duration::seconds(1));
        registry.register(s);
        assert_eq!(registry.get(None).unwrap().health, SessionHealth::Expired);
    }

    #[test]
    fn test_session_past_max_age_marked_expired_on_use() {
        let config = SessionConfig {
            max_age: Duration::from_secs(3600),
            ..SessionConfig::default()
        };
        let registry =
            SessionRegistry::new(config, RetryExecutor::new(RetryPolicy::no_retry())).unwrap();
        // Password logins carry no token expiry
        let mut old = session("old");
        old.created_at = Utc::now() - chrono::Duration::minutes(61);
        registry.register(old);
        registry.register(session("young"));

        let fetched = registry.get(Some(&OrgId::from("old"))).unwrap();
        assert_eq!(fetched.health, SessionHealth::Expired);
        assert!(fetched.age() >= Duration::from_secs(3600));
        assert_eq!(
            registry.get(Some(&OrgId::from("young"))).unwrap().health,
            SessionHealth::Healthy
        );

        // Marked, not removed, until unhealthy sessions are evicted
        assert!(registry.contains(&OrgId::from("old")));
        assert_eq!(registry.evict_unhealthy(), vec![OrgId::from("old")]);
    }

    #[test]
    fn test_membership_changes_do_not_block_readers() {
        let registry = registry(10);
        registry.register(session("a"));
        registry.register(session("b"));

        // Held by register/evict/set_active while they change membership
        let membership = registry.active.upgradable_read();
        assert_eq!(registry.get(None).unwrap().org.as_str(), "a");
        assert_eq!(registry.get(Some(&OrgId::from("b"))).unwrap().org.as_str(), "b");

        let mut newer = session("b");
        newer.label = "relogin".to_string();
        assert!(registry.register(newer).replaced.is_some());
        drop(membership);

        assert_eq!(registry.get(Some(&OrgId::from("b"))).unwrap().label, "relogin");
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::Password {
            username: "user@example.com".into(),
            password: "hunter2".into(),
            security_token: Some("tok".into()),
            client_id: "id".into(),
            client_secret: None,
            login_url: None,
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("user@example.com"));
        assert!(!rendered.contains("hunter2"));
        assert!(!format!("{:?}", AccessToken::new("s3cret")).contains("s3cret"));
    }

    #[test]
    fn test_concurrent_switches_never_expose_missing_session() {
        let registry = Arc::new(registry(10));
        registry.register(session("a"));
        registry.register(session("b"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let org = OrgId::from(if (i + n) % 2 == 0 { "a" } else { "b" });
                        registry.set_active(&org).unwrap();
                        let got = registry.get(None).unwrap();
                        assert!(got.org.as_str() == "a" || got.org.as_str() == "b");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 2);
    }
}
