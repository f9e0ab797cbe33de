//! Connected platform accounts
//!
//! Handles the OAuth handshake (state and PKCE verifier live in the
//! database, so any process can finish a flow another one started) and
//! hands out credentials, refreshing expired tokens on the way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::db::Database;
use crate::error::{PlatformError, PostflowError, Result};
use crate::platforms::{PlatformAdapter, PlatformFactory};
use crate::types::{AccessTokenData, AuthorizationRequest, Credential, Platform};

/// OAuth `state` values are accepted for this long
pub const STATE_TTL_MINUTES: i64 = 10;

type RefreshLocks = HashMap<(String, Platform), Arc<tokio::sync::Mutex<()>>>;

pub struct AccountService {
    db: Database,
    factory: Arc<PlatformFactory>,
    clock: SharedClock,
    refresh_locks: Mutex<RefreshLocks>,
}

fn auth_error(platform: Platform, message: impl Into<String>) -> PostflowError {
    PlatformError::auth(message)
        .with_context("platform", platform.as_str())
        .into()
}

impl AccountService {
    pub fn new(db: Database, factory: Arc<PlatformFactory>, clock: SharedClock) -> Self {
        Self {
            db,
            factory,
            clock,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Start an OAuth flow and remember its state until the callback
    pub async fn begin_authorization(&self, platform: Platform) -> Result<AuthorizationRequest> {
        let adapter = self.factory.get_platform(platform)?;
        let request = adapter.get_auth_url()?;
        let now = self.clock.now();

        let purged = self
            .db
            .purge_oauth_states_before(now - Duration::minutes(STATE_TTL_MINUTES))
            .await?;
        if purged > 0 {
            debug!(purged, "Dropped expired OAuth states");
        }

        self.db
            .insert_oauth_state(&request.state, platform, request.code_verifier.as_deref(), now)
            .await?;

        debug!(platform = %platform, "Authorization started");
        Ok(request)
    }

    /// Finish an OAuth flow started by [`begin_authorization`](Self::begin_authorization)
    ///
    /// The state is consumed whether or not the exchange succeeds.
    pub async fn complete_authorization(
        &self,
        user_id: &str,
        platform: Platform,
        state: &str,
        code: &str,
    ) -> Result<Credential> {
        let stored = self
            .db
            .take_oauth_state(state)
            .await?
            .ok_or_else(|| auth_error(platform, "Unknown or already used authorization state"))?;

        if stored.platform != platform {
            return Err(auth_error(
                platform,
                format!(
                    "Authorization state was issued for {}, not {}",
                    stored.platform, platform
                ),
            ));
        }
        if self.clock.now() - stored.created_at > Duration::minutes(STATE_TTL_MINUTES) {
            return Err(auth_error(platform, "Authorization state has expired"));
        }

        let adapter = self.factory.get_platform(platform)?;
        let token = adapter
            .authorize(code, stored.code_verifier.as_deref())
            .await?;
        self.store_connection(user_id, adapter.as_ref(), token).await
    }

    /// Connect a Bluesky account with a handle and an app password
    pub async fn connect_with_password(
        &self,
        user_id: &str,
        identifier: &str,
        password: &str,
    ) -> Result<Credential> {
        let adapter = self.factory.get_platform(Platform::Bluesky)?;
        let token = adapter.authorize(identifier, Some(password)).await?;
        self.store_connection(user_id, adapter.as_ref(), token).await
    }

    async fn store_connection(
        &self,
        user_id: &str,
        adapter: &dyn PlatformAdapter,
        token: AccessTokenData,
    ) -> Result<Credential> {
        let platform = adapter.platform();
        let user = adapter.get_user(&token.access_token).await?;

        let mut credential = Credential::from_token(user_id, platform, token, self.clock.now());
        credential.platform_user_id = Some(user.id);
        credential.username = Some(user.username);
        self.db.upsert_credential(&credential).await?;

        info!(
            user_id = %user_id,
            platform = %platform,
            username = credential.username.as_deref().unwrap_or_default(),
            "Account connected"
        );
        Ok(credential)
    }

    /// Forget the stored credential, returning whether one existed
    pub async fn disconnect(&self, user_id: &str, platform: Platform) -> Result<bool> {
        let removed = self.db.delete_credential(user_id, platform).await?;
        if removed {
            info!(user_id = %user_id, platform = %platform, "Account disconnected");
        }
        Ok(removed)
    }

    fn refresh_lock(&self, user_id: &str, platform: Platform) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry((user_id.to_string(), platform))
            .or_default()
            .clone()
    }

    /// Drop the account's lock once nobody else holds or waits on it
    fn release_refresh_lock(
        &self,
        user_id: &str,
        platform: Platform,
        lock: Arc<tokio::sync::Mutex<()>>,
    ) {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = (user_id.to_string(), platform);
        let ours = locks.get(&key).is_some_and(|held| Arc::ptr_eq(held, &lock));
        // One reference in the map, one here
        if ours && Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
    }

    /// Like [`credential_for`](Self::credential_for) but a missing account is
    /// an authentication error
    pub async fn require_credential(&self, user_id: &str, platform: Platform) -> Result<Credential> {
        self.credential_for(user_id, platform).await?.ok_or_else(|| {
            PlatformError::auth(format!(
                "No {} credentials found for user {}",
                platform, user_id
            ))
            .with_context("platform", platform.as_str())
            .into()
        })
    }

    /// Usable credential for `user_id` on `platform`, `None` when not connected
    ///
    /// Expired tokens are refreshed first. Concurrent callers for the same
    /// account wait on one refresh instead of starting their own.
    pub async fn credential_for(
        &self,
        user_id: &str,
        platform: Platform,
    ) -> Result<Option<Credential>> {
        let Some(credential) = self.db.get_credential(user_id, platform).await? else {
            return Ok(None);
        };
        if !credential.is_expired(self.clock.now()) {
            return Ok(Some(credential));
        }

        let lock = self.refresh_lock(user_id, platform);
        let refreshed = {
            let _guard = lock.lock().await;
            self.refresh_expired(user_id, platform).await
        };
        self.release_refresh_lock(user_id, platform, lock);
        refreshed
    }

    /// Refresh under the account's lock, re-reading first
    async fn refresh_expired(&self, user_id: &str, platform: Platform) -> Result<Option<Credential>> {
        // Someone else may have refreshed while we waited
        let Some(mut credential) = self.db.get_credential(user_id, platform).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        if !credential.is_expired(now) {
            return Ok(Some(credential));
        }

        let Some(refresh_token) = credential.refresh_token.clone() else {
            warn!(user_id = %user_id, platform = %platform, "Token expired without refresh token");
            return Err(auth_error(
                platform,
                format!("{} token expired and cannot be refreshed, reconnect the account", platform),
            ));
        };

        let adapter = self.factory.get_platform(platform)?;
        let token = adapter.refresh_token(&refresh_token).await?;
        credential.apply_refresh(token, now);
        self.db.upsert_credential(&credential).await?;

        info!(user_id = %user_id, platform = %platform, "Access token refreshed");
        Ok(Some(credential))
    }
}
