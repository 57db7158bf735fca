//! Login and tenant resolution.
//!
//! A login tries the backend first. On success the shop's full data set
//! replaces the local snapshot, and a bcrypt hash of the secret is cached on
//! the user for later offline logins. When the backend is unreachable or
//! rejects the credentials, the cached users are checked instead and the
//! snapshot is filtered down to the matching user's shop. Either way the
//! snapshot only ever holds one shop's records once login returns.
//!
//! Failed attempts are counted in `local_settings` (category `auth`) and
//! lock the device for a while after too many in a row.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::db::{self, DbState};
use crate::error::{AuthError, RemoteError};
use crate::models::{now_iso, User, UserStatus};
use crate::mutations::Mutations;
use crate::network::NetworkStatus;
use crate::operations::Operation;
use crate::remote::{with_timeout, AuthResponse, RemoteDataAccess};
use crate::store::{find_mut, upsert, LocalStore};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const AUTH_CATEGORY: &str = "auth";
const LOCKOUT_ATTEMPTS_KEY: &str = "lockout_attempts";
const LOCKOUT_LAST_ATTEMPT_KEY: &str = "lockout_last_attempt";

#[cfg(not(test))]
const HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const HASH_COST: u32 = 4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginSource {
    /// Credentials confirmed by the backend; data freshly loaded.
    Remote,
    /// Credentials checked against the cached users.
    Local,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOutcome {
    pub user: User,
    pub shop_id: String,
    pub source: LoginSource,
    /// Login is allowed, but the shop's subscription has lapsed.
    pub subscription_expired: bool,
}

#[derive(Debug, Clone, Copy)]
struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

pub struct SessionManager {
    db: Arc<DbState>,
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteDataAccess>,
    network: Arc<NetworkStatus>,
    mutations: Arc<Mutations>,
    request_timeout: StdDuration,
}

impl SessionManager {
    pub fn new(
        db: Arc<DbState>,
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteDataAccess>,
        network: Arc<NetworkStatus>,
        mutations: Arc<Mutations>,
        request_timeout: StdDuration,
    ) -> Self {
        Self {
            db,
            store,
            remote,
            network,
            mutations,
            request_timeout,
        }
    }

    /// Authenticate `identifier` (email or username) and make their shop the
    /// active one.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<LoginOutcome, AuthError> {
        let identifier = identifier.trim();
        let secret = Zeroizing::new(secret.to_string());
        if identifier.is_empty() || secret.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        self.check_lockout()?;

        let mut resolved = None;
        if self.network.is_online() {
            match self.remote_login(identifier, &secret).await {
                Ok(user) => resolved = Some((user, LoginSource::Remote)),
                Err(RemoteLogin::Rejected(e)) => return Err(e),
                Err(RemoteLogin::Fallback(reason)) => {
                    info!(reason = %reason, "Remote login unavailable; checking cached users");
                }
            }
        }

        let (user, source) = match resolved {
            Some(found) => found,
            None => (self.local_login(identifier, &secret)?, LoginSource::Local),
        };

        self.finish_login(user, source).await
    }

    /// End the session. Cached shop data stays for the next login.
    pub fn logout(&self) -> Result<(), AuthError> {
        self.store
            .update(|s| {
                if let Some(user) = s.current_user.take() {
                    info!(user_id = %user.id, "Logged out");
                }
                Ok(())
            })
            .map_err(|e| AuthError::Storage(e.to_string()))
    }

    pub fn current_user(&self) -> Option<User> {
        self.store
            .read(|s| s.current_user.clone())
            .ok()
            .flatten()
    }

    // -- Remote path --------------------------------------------------------

    async fn remote_login(&self, identifier: &str, secret: &str) -> Result<User, RemoteLogin> {
        let AuthResponse { user, settings } = with_timeout(
            self.request_timeout,
            self.remote.authenticate_user(identifier, secret),
        )
        .await
        .map_err(RemoteLogin::from_remote)?;

        if user.status != UserStatus::Active {
            warn!(user_id = %user.id, "Rejected login for inactive account");
            return Err(RemoteLogin::Rejected(AuthError::Inactive));
        }

        let shop_id = user.shop_id.clone();
        let mut data = with_timeout(self.request_timeout, self.remote.load_shop_data(&shop_id))
            .await
            .map_err(|e| RemoteLogin::Fallback(format!("could not load shop data: {e}")))?;
        if data.settings.is_none() {
            data.settings = settings;
        }

        let mut user = user;
        user.password_hash = Some(hash_secret(secret)?);
        upsert(&mut data.users, user.clone());

        self.store
            .replace(&shop_id, data, Some(user.clone()))
            .map_err(|e| RemoteLogin::Rejected(AuthError::Storage(e.to_string())))?;
        info!(user_id = %user.id, shop_id = %shop_id, "Remote login; shop data loaded");
        Ok(user)
    }

    // -- Local path ---------------------------------------------------------

    fn local_login(&self, identifier: &str, secret: &str) -> Result<User, AuthError> {
        let candidates: Vec<User> = self
            .store
            .read(|s| {
                s.data
                    .users
                    .iter()
                    .filter(|u| u.matches_identifier(identifier))
                    .cloned()
                    .collect()
            })
            .map_err(|e| AuthError::Storage(e.to_string()))?;

        // The same identifier may be cached under several shops.
        let verified = candidates.into_iter().find(|user| {
            user.password_hash
                .as_deref()
                .is_some_and(|hash| bcrypt::verify(secret, hash).unwrap_or(false))
        });
        let Some(user) = verified else {
            self.record_failure();
            return Err(AuthError::InvalidCredentials);
        };

        if user.status != UserStatus::Active {
            warn!(user_id = %user.id, "Rejected login for inactive account");
            return Err(AuthError::Inactive);
        }

        let removed = self
            .store
            .retain_shop(&user.shop_id)
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        info!(user_id = %user.id, shop_id = %user.shop_id, removed, "Offline login");
        Ok(user)
    }

    // -- Shared tail --------------------------------------------------------

    async fn finish_login(
        &self,
        user: User,
        source: LoginSource,
    ) -> Result<LoginOutcome, AuthError> {
        self.reset_lockout();

        let now = now_iso();
        let (user, subscription_expired) = self
            .store
            .update(|s| {
                let cached = find_mut(&mut s.data.users, &user.id);
                let user = match cached {
                    Some(cached) => {
                        cached.last_login = Some(now.clone());
                        cached.updated_at = now.clone();
                        cached.clone()
                    }
                    None => user.clone(),
                };
                s.current_user = Some(user.clone());
                let expired = s
                    .data
                    .subscription
                    .as_ref()
                    .is_some_and(|sub| sub.is_expired_at(Utc::now()));
                Ok((user, expired))
            })
            .map_err(|e| AuthError::Storage(e.to_string()))?;

        if subscription_expired {
            warn!(shop_id = %user.shop_id, "Subscription expired; login allowed with a warning");
        }

        self.mutations
            .commit(Operation::UpdateUser {
                id: user.id.clone(),
                changes: json!({ "lastLogin": now, "updatedAt": now }),
            })
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?;

        Ok(LoginOutcome {
            shop_id: user.shop_id.clone(),
            user,
            source,
            subscription_expired,
        })
    }

    // -- Lockout ------------------------------------------------------------

    fn check_lockout(&self) -> Result<(), AuthError> {
        let lockout = self.load_lockout()?;
        if lockout.attempts >= MAX_FAILED_ATTEMPTS {
            let elapsed = Utc::now() - lockout.last_attempt;
            if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
                let minutes = (LOCKOUT_MINUTES - elapsed.num_minutes()).max(1);
                return Err(AuthError::LockedOut { minutes });
            }
        }
        Ok(())
    }

    fn record_failure(&self) {
        let Ok(mut lockout) = self.load_lockout() else {
            return;
        };
        lockout.attempts += 1;
        lockout.last_attempt = Utc::now();
        warn!(attempts = lockout.attempts, "Failed login attempt");
        self.persist_lockout(&lockout);
    }

    fn reset_lockout(&self) {
        self.persist_lockout(&LockoutEntry {
            attempts: 0,
            last_attempt: Utc::now(),
        });
    }

    fn load_lockout(&self) -> Result<LockoutEntry, AuthError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        let attempts = db::get_setting(&conn, AUTH_CATEGORY, LOCKOUT_ATTEMPTS_KEY)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let last_attempt = db::get_setting(&conn, AUTH_CATEGORY, LOCKOUT_LAST_ATTEMPT_KEY)
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(LockoutEntry {
            attempts,
            last_attempt,
        })
    }

    fn persist_lockout(&self, lockout: &LockoutEntry) {
        let Ok(conn) = self.db.conn.lock() else {
            return;
        };
        let _ = db::set_setting(
            &conn,
            AUTH_CATEGORY,
            LOCKOUT_ATTEMPTS_KEY,
            &lockout.attempts.to_string(),
        );
        let _ = db::set_setting(
            &conn,
            AUTH_CATEGORY,
            LOCKOUT_LAST_ATTEMPT_KEY,
            &lockout.last_attempt.to_rfc3339(),
        );
    }
}

/// Why the remote path did not produce a user.
enum RemoteLogin {
    /// Final answer; do not try cached credentials.
    Rejected(AuthError),
    /// Backend unreachable or credentials unknown there; try the cache.
    Fallback(String),
}

impl RemoteLogin {
    fn from_remote(error: RemoteError) -> Self {
        RemoteLogin::Fallback(error.to_string())
    }
}

impl From<AuthError> for RemoteLogin {
    fn from(error: AuthError) -> Self {
        RemoteLogin::Rejected(error)
    }
}

/// bcrypt hash of a login secret for offline verification.
pub fn hash_secret(secret: &str) -> Result<String, AuthError> {
    bcrypt::hash(secret, HASH_COST).map_err(|e| AuthError::Storage(format!("hash secret: {e}")))
}

// ===========================================================================
// Tests
// ===========================================================================
