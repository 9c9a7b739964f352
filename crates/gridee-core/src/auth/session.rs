use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::claims::decode_expiry_claim;
use crate::clock::{Clock, SystemClock};
use crate::store::{Edit, KeyValueStore, StoreError};

/// Storage keys. Shared with the mobile clients, do not rename.
pub const KEY_JWT_TOKEN: &str = "jwt_token";
pub const KEY_USER_ID: &str = "user_id";
pub const KEY_USER_NAME: &str = "user_name";
pub const KEY_USER_ROLE: &str = "user_role";
pub const KEY_TOKEN_TIMESTAMP: &str = "token_timestamp";

const SESSION_KEYS: [&str; 5] = [
    KEY_JWT_TOKEN,
    KEY_USER_ID,
    KEY_USER_NAME,
    KEY_USER_ROLE,
    KEY_TOKEN_TIMESTAMP,
];

/// Lifetime assumed for tokens whose `exp` claim cannot be read (24 hours).
pub const FALLBACK_TTL_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Cannot save a session with an empty token")]
    EmptyToken,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a session's expiry instant came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirySource {
    /// The token's own `exp` claim
    Claim,
    /// `issued_at + FALLBACK_TTL_MS`
    Fallback,
}

/// One consistent read of the persisted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub token: String,
    pub subject_id: String,
    pub display_name: String,
    pub role: String,
    /// Device clock at save time, ms since epoch
    pub issued_at: i64,
    /// ms since epoch
    pub expires_at: i64,
    pub expiry_source: ExpirySource,
}

impl SessionSnapshot {
    fn from_fields(fields: Vec<Option<String>>) -> Option<Self> {
        let mut fields = fields.into_iter();
        let mut next = || fields.next().flatten();

        let token = next()?;
        let subject_id = next().unwrap_or_default();
        let display_name = next().unwrap_or_default();
        let role = next().unwrap_or_default();
        // A missing or garbled timestamp anchors the fallback at the epoch,
        // which leaves claim-less tokens already expired
        let issued_at = next().and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);

        let (expires_at, expiry_source) = match decode_expiry_claim(&token) {
            Some(exp) => (exp, ExpirySource::Claim),
            None => (
                issued_at.saturating_add(FALLBACK_TTL_MS),
                ExpirySource::Fallback,
            ),
        };

        Some(Self {
            token,
            subject_id,
            display_name,
            role,
            issued_at,
            expires_at,
            expiry_source,
        })
    }

    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        now_millis > self.expires_at
    }

    pub fn millis_until_expiry(&self, now_millis: i64) -> i64 {
        (self.expires_at - now_millis).max(0)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now_millis: i64) -> i64 {
        self.millis_until_expiry(now_millis) / 60_000
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.expires_at).single()
    }
}

/// Summary of the current session for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub authenticated: bool,
    pub subject_id: Option<String>,
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expiry_source: Option<ExpirySource>,
}

/// Owns the bearer token and identity of the current device session.
///
/// Expiry is checked lazily: any read through `token`, `snapshot` or
/// `is_authenticated` that finds an expired session clears it before
/// returning. The identity getters (`subject_id`, `display_name`, `role`)
/// return the raw stored values without an expiry check.
pub struct SessionManager {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    // Held across read-check-clear so a lazy clear never erases a session
    // saved by another thread in between
    lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            lock: Mutex::new(()),
        }
    }

    /// Persist a freshly issued session, replacing any previous one.
    pub fn save_session(
        &self,
        token: &str,
        subject_id: &str,
        display_name: &str,
        role: &str,
    ) -> Result<(), SessionError> {
        if token.is_empty() {
            return Err(SessionError::EmptyToken);
        }

        let issued_at = self.clock.now_millis();
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.commit(vec![
            Edit::put(KEY_JWT_TOKEN, token),
            Edit::put(KEY_USER_ID, subject_id),
            Edit::put(KEY_USER_NAME, display_name),
            Edit::put(KEY_USER_ROLE, role),
            Edit::put(KEY_TOKEN_TIMESTAMP, issued_at.to_string()),
        ])?;

        debug!(
            subject_id,
            role,
            issued_at,
            has_exp_claim = decode_expiry_claim(token).is_some(),
            "Session saved"
        );
        Ok(())
    }

    /// The current session if one exists and has not expired.
    /// An expired session is cleared as a side effect.
    pub fn snapshot(&self) -> Result<Option<SessionSnapshot>, SessionError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let fields = self.store.get_many(&SESSION_KEYS)?;
        let Some(session) = SessionSnapshot::from_fields(fields) else {
            return Ok(None);
        };

        let now = self.clock.now_millis();
        if session.is_expired_at(now) {
            debug!(
                expires_at = session.expires_at,
                now,
                source = ?session.expiry_source,
                "Session expired, clearing"
            );
            self.remove_all()?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// The stored token, only while it is still valid.
    pub fn token(&self) -> Result<Option<String>, SessionError> {
        Ok(self.snapshot()?.map(|s| s.token))
    }

    /// Value for the `Authorization` header, e.g. `Bearer eyJ...`.
    pub fn bearer_header_value(&self) -> Result<Option<String>, SessionError> {
        Ok(self.token()?.map(|t| format!("Bearer {}", t)))
    }

    pub fn is_authenticated(&self) -> Result<bool, SessionError> {
        Ok(self.token()?.is_some())
    }

    pub fn subject_id(&self) -> Result<Option<String>, SessionError> {
        Ok(self.store.get(KEY_USER_ID)?)
    }

    pub fn display_name(&self) -> Result<Option<String>, SessionError> {
        Ok(self.store.get(KEY_USER_NAME)?)
    }

    pub fn role(&self) -> Result<Option<String>, SessionError> {
        Ok(self.store.get(KEY_USER_ROLE)?)
    }

    /// Remove every session key. Safe to call when nothing is stored.
    pub fn clear_session(&self) -> Result<(), SessionError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.remove_all()?;
        debug!("Session cleared");
        Ok(())
    }

    pub fn status(&self) -> Result<SessionStatus, SessionError> {
        Ok(match self.snapshot()? {
            Some(session) => SessionStatus {
                authenticated: true,
                expires_at: session.expires_at_utc(),
                expiry_source: Some(session.expiry_source),
                subject_id: Some(session.subject_id),
                display_name: Some(session.display_name),
                role: Some(session.role),
            },
            None => SessionStatus::default(),
        })
    }

    /// Like `is_authenticated`, but a storage failure reads as logged out.
    pub fn is_authenticated_or_logged_out(&self) -> bool {
        match self.is_authenticated() {
            Ok(authenticated) => authenticated,
            Err(e) => {
                warn!(error = %e, "Failed to read session, treating as logged out");
                false
            }
        }
    }

    fn remove_all(&self) -> Result<(), StoreError> {
        self.store
            .commit(SESSION_KEYS.iter().map(|k| Edit::remove(*k)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    /// 2024-01-01T00:00:00Z
    const T0: i64 = 1_704_067_200_000;

    fn setup(now: i64) -> (SessionManager, MemoryStore, Arc<ManualClock>) {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(now));
        let manager = SessionManager::with_clock(Arc::new(store.clone()), clock.clone());
        (manager, store, clock)
    }

    fn jwt_with_exp(exp_seconds: i64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u1","exp":{}}}"#, exp_seconds));
        format!("eyJhbGciOiJIUzI1NiJ9.{}.sig", payload)
    }

    #[test]
    fn test_round_trip_identity_fields() {
        let (manager, _, _) = setup(T0);
        manager.save_session("a.b.c", "u-42", "Alice Doe", "ADMIN").unwrap();

        assert_eq!(manager.subject_id().unwrap().as_deref(), Some("u-42"));
        assert_eq!(manager.display_name().unwrap().as_deref(), Some("Alice Doe"));
        assert_eq!(manager.role().unwrap().as_deref(), Some("ADMIN"));
    }

    #[test]
    fn test_empty_identity_fields_are_stored_verbatim() {
        let (manager, _, _) = setup(T0);
        manager.save_session("tok", "", "", "").unwrap();

        assert_eq!(manager.subject_id().unwrap().as_deref(), Some(""));
        assert_eq!(manager.display_name().unwrap().as_deref(), Some(""));
        assert!(manager.is_authenticated().unwrap());
    }

    #[test]
    fn test_empty_token_is_rejected() {
        let (manager, store, _) = setup(T0);
        let result = manager.save_session("", "u1", "Alice", "USER");
        assert!(matches!(result, Err(SessionError::EmptyToken)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_writes_timestamp() {
        let (manager, store, _) = setup(T0);
        manager.save_session("tok", "u1", "Alice", "USER").unwrap();
        assert_eq!(
            store.get(KEY_TOKEN_TIMESTAMP).unwrap(),
            Some(T0.to_string())
        );
    }

    #[test]
    fn test_fallback_expiry_boundary() {
        let (manager, store, clock) = setup(T0);
        manager.save_session("opaque-token", "u1", "Alice", "USER").unwrap();

        clock.set(T0 + FALLBACK_TTL_MS - 1);
        assert_eq!(manager.token().unwrap().as_deref(), Some("opaque-token"));

        clock.set(T0 + FALLBACK_TTL_MS + 1);
        assert_eq!(manager.token().unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_claim_takes_precedence_over_fallback() {
        let (manager, _, clock) = setup(T0);
        let token = jwt_with_exp(T0 / 1000 + 10);
        manager.save_session(&token, "u1", "Alice", "USER").unwrap();

        clock.set(T0 + 9_000);
        assert!(manager.is_authenticated().unwrap());

        clock.set(T0 + 10_001);
        assert!(!manager.is_authenticated().unwrap());
    }

    #[test]
    fn test_claim_can_outlive_fallback() {
        let (manager, _, clock) = setup(T0);
        let seven_days = 7 * 24 * 60 * 60;
        let token = jwt_with_exp(T0 / 1000 + seven_days);
        manager.save_session(&token, "u1", "Alice", "USER").unwrap();

        clock.set(T0 + FALLBACK_TTL_MS * 3);
        assert_eq!(manager.token().unwrap(), Some(token));
    }

    #[test]
    fn test_malformed_token_uses_fallback() {
        let (manager, _, clock) = setup(T0);
        manager.save_session("not-a-jwt", "u1", "Alice", "USER").unwrap();

        let snapshot = manager.snapshot().unwrap().unwrap();
        assert_eq!(snapshot.expiry_source, ExpirySource::Fallback);
        assert_eq!(snapshot.expires_at, T0 + FALLBACK_TTL_MS);

        clock.set(T0 + FALLBACK_TTL_MS - 1);
        assert!(manager.is_authenticated().unwrap());
        clock.set(T0 + FALLBACK_TTL_MS + 1);
        assert!(!manager.is_authenticated().unwrap());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (manager, _, _) = setup(T0);
        manager.clear_session().unwrap();
        manager.clear_session().unwrap();
        assert!(!manager.is_authenticated().unwrap());

        manager.save_session("tok", "u1", "Alice", "USER").unwrap();
        manager.clear_session().unwrap();
        manager.clear_session().unwrap();
        assert!(!manager.is_authenticated().unwrap());
        assert_eq!(manager.subject_id().unwrap(), None);
    }

    #[test]
    fn test_overwrite_replaces_all_fields() {
        let (manager, _, _) = setup(T0);
        manager.save_session("token-a", "user-a", "Alice", "ADMIN").unwrap();
        manager.save_session("token-b", "user-b", "Bob", "USER").unwrap();

        assert_eq!(manager.subject_id().unwrap().as_deref(), Some("user-b"));
        assert_eq!(manager.display_name().unwrap().as_deref(), Some("Bob"));
        assert_eq!(manager.role().unwrap().as_deref(), Some("USER"));
        assert_eq!(manager.token().unwrap().as_deref(), Some("token-b"));
    }

    #[test]
    fn test_lazy_clear_removes_raw_keys() {
        let (manager, store, clock) = setup(T0);
        manager.save_session("tok", "u1", "Alice", "USER").unwrap();

        clock.advance(FALLBACK_TTL_MS + 1);
        assert_eq!(manager.token().unwrap(), None);

        for key in SESSION_KEYS {
            assert_eq!(store.get(key).unwrap(), None, "{} should be cleared", key);
        }
    }

    #[test]
    fn test_identity_getters_do_not_check_expiry() {
        let (manager, store, clock) = setup(T0);
        manager.save_session("tok", "u1", "Alice", "USER").unwrap();
        clock.advance(FALLBACK_TTL_MS + 1);

        // Stale identity is still readable until something checks the token
        assert_eq!(manager.subject_id().unwrap().as_deref(), Some("u1"));
        assert_eq!(store.len(), 5);

        assert!(!manager.is_authenticated().unwrap());
        assert_eq!(manager.subject_id().unwrap(), None);
    }

    #[test]
    fn test_read_without_session_does_not_clear() {
        let (manager, store, _) = setup(T0);
        store.set("unrelated", "keep").unwrap();

        assert_eq!(manager.token().unwrap(), None);
        assert_eq!(store.get("unrelated").unwrap().as_deref(), Some("keep"));
    }

    #[test]
    fn test_clear_leaves_unrelated_keys() {
        let (manager, store, _) = setup(T0);
        store.set("theme", "dark").unwrap();
        manager.save_session("tok", "u1", "Alice", "USER").unwrap();

        manager.clear_session().unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("theme").unwrap().as_deref(), Some("dark"));
    }

    #[test]
    fn test_missing_timestamp_counts_as_expired() {
        let (manager, store, _) = setup(T0);
        store.set(KEY_JWT_TOKEN, "legacy-token").unwrap();
        store.set(KEY_USER_ID, "u1").unwrap();

        assert_eq!(manager.token().unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_bearer_header_value() {
        let (manager, _, clock) = setup(T0);
        assert_eq!(manager.bearer_header_value().unwrap(), None);

        manager.save_session("abc.def.ghi", "u1", "Alice", "USER").unwrap();
        assert_eq!(
            manager.bearer_header_value().unwrap().as_deref(),
            Some("Bearer abc.def.ghi")
        );

        clock.advance(FALLBACK_TTL_MS + 1);
        assert_eq!(manager.bearer_header_value().unwrap(), None);
    }

    #[test]
    fn test_status_reports_expiry_source() {
        let (manager, _, _) = setup(T0);
        assert_eq!(manager.status().unwrap(), SessionStatus::default());

        let exp = T0 / 1000 + 3600;
        manager.save_session(&jwt_with_exp(exp), "u1", "Alice", "USER").unwrap();

        let status = manager.status().unwrap();
        assert!(status.authenticated);
        assert_eq!(status.role.as_deref(), Some("USER"));
        assert_eq!(status.expiry_source, Some(ExpirySource::Claim));
        assert_eq!(status.expires_at.map(|t| t.timestamp()), Some(exp));
    }

    #[test]
    fn test_minutes_until_expiry() {
        let (manager, _, _) = setup(T0);
        manager.save_session("tok", "u1", "Alice", "USER").unwrap();
        let snapshot = manager.snapshot().unwrap().unwrap();

        assert_eq!(snapshot.minutes_until_expiry(T0), 24 * 60);
        assert_eq!(snapshot.minutes_until_expiry(T0 + FALLBACK_TTL_MS * 2), 0);
    }

    #[test]
    fn test_end_to_end_scenario() {
        let (manager, _, clock) = setup(1_699_999_000_000);
        // Payload is {"exp":1700000000}
        let token = "h.eyJleHAiOjE3MDAwMDAwMDB9.s";
        manager.save_session(token, "u1", "Alice", "USER").unwrap();

        assert!(manager.is_authenticated().unwrap());
        assert_eq!(manager.subject_id().unwrap().as_deref(), Some("u1"));

        clock.set(1_700_000_000_000 + 1);
        assert_eq!(manager.token().unwrap(), None);
        assert!(!manager.is_authenticated().unwrap());
        assert_eq!(manager.subject_id().unwrap(), None);
    }

    #[test]
    fn test_concurrent_saves_never_mix_fields() {
        let (manager, _, _) = setup(T0);
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        manager
                            .save_session(
                                &format!("token-{}", i),
                                &format!("user-{}", i),
                                &format!("name-{}", i),
                                "USER",
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = manager.snapshot().unwrap().unwrap();
        let suffix = snapshot.token.trim_start_matches("token-");
        assert_eq!(snapshot.subject_id, format!("user-{}", suffix));
        assert_eq!(snapshot.display_name, format!("name-{}", suffix));
    }

    #[test]
    fn test_storage_failure_reads_as_logged_out() {
        struct BrokenStore;

        impl KeyValueStore for BrokenStore {
            fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
                Err(StoreError::Corrupt("broken".to_string()))
            }
            fn get_many(&self, _keys: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
                Err(StoreError::Corrupt("broken".to_string()))
            }
            fn commit(&self, _edits: Vec<Edit>) -> Result<(), StoreError> {
                Err(StoreError::Corrupt("broken".to_string()))
            }
        }

        let manager = SessionManager::new(Arc::new(BrokenStore));
        assert!(matches!(manager.token(), Err(SessionError::Store(_))));
        assert!(matches!(
            manager.save_session("tok", "u1", "Alice", "USER"),
            Err(SessionError::Store(_))
        ));
        assert!(!manager.is_authenticated_or_logged_out());
    }
}
