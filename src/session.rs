//! Per-session state with explicit reset semantics.
//!
//! Holds what the dashboard used to keep in module-level globals: the signed-in
//! user, credentials, loading flags, and the stories subscribed over the live
//! socket. [`crate::client::CacheClient::sign_out`] resets this together with
//! the entity store.

use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CacheError, CacheResult};

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Server id.
    pub id: String,
    /// Login email.
    pub email: String,
    /// Name shown in the UI.
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Bearer token plus the admin-action nonce.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// GraphQL bearer token.
    pub access_token: String,
    /// Anti-forgery token sent with admin actions.
    pub nonce: String,
    /// When the token expires, if known.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Tokens without an expiry never expire.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("nonce", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    user: Option<UserProfile>,
    credentials: Option<Credentials>,
    loading: BTreeSet<String>,
    live_stories: BTreeSet<String>,
    needs_reauth: bool,
}

/// Explicit replacement for ambient session globals.
#[derive(Debug, Default)]
pub struct SessionContext {
    state: RwLock<SessionState>,
}

impl SessionContext {
    /// A signed-out session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> CacheResult<RwLockReadGuard<'_, SessionState>> {
        self.state
            .read()
            .map_err(|_| CacheError::internal("session lock poisoned"))
    }

    fn write(&self) -> CacheResult<RwLockWriteGuard<'_, SessionState>> {
        self.state
            .write()
            .map_err(|_| CacheError::internal("session lock poisoned"))
    }

    /// Store the user and credentials and clear any pending re-auth request.
    pub fn sign_in(&self, user: UserProfile, credentials: Credentials) -> CacheResult<()> {
        let mut state = self.write()?;
        info!(user = %user.id, "signed in");
        state.user = Some(user);
        state.credentials = Some(credentials);
        state.needs_reauth = false;
        Ok(())
    }

    /// Signed-in user, kept across auth failures.
    pub fn user(&self) -> CacheResult<Option<UserProfile>> {
        Ok(self.read()?.user.clone())
    }

    /// Current credentials.
    pub fn credentials(&self) -> CacheResult<Option<Credentials>> {
        Ok(self.read()?.credentials.clone())
    }

    /// The admin-action nonce, or an auth error if signed out.
    pub fn nonce(&self) -> CacheResult<String> {
        self.read()?
            .credentials
            .as_ref()
            .map(|c| c.nonce.clone())
            .ok_or_else(|| CacheError::Auth {
                message: "not signed in".to_string(),
            })
    }

    /// Credentials are present.
    pub fn is_authenticated(&self) -> CacheResult<bool> {
        Ok(self.read()?.credentials.is_some())
    }

    /// The server rejected the credentials since the last sign-in.
    pub fn needs_reauth(&self) -> CacheResult<bool> {
        Ok(self.read()?.needs_reauth)
    }

    /// Raise or clear a named loading flag.
    pub fn set_loading(&self, flag: &str, loading: bool) -> CacheResult<()> {
        let mut state = self.write()?;
        if loading {
            state.loading.insert(flag.to_string());
        } else {
            state.loading.remove(flag);
        }
        Ok(())
    }

    /// Returns true while the named flag is raised.
    pub fn is_loading(&self, flag: &str) -> CacheResult<bool> {
        Ok(self.read()?.loading.contains(flag))
    }

    /// Track a story subscribed over the live socket. Returns `false` if already tracked.
    pub fn subscribe_story(&self, story_id: &str) -> CacheResult<bool> {
        Ok(self.write()?.live_stories.insert(story_id.to_string()))
    }

    /// Returns `false` if the story was not tracked.
    pub fn unsubscribe_story(&self, story_id: &str) -> CacheResult<bool> {
        Ok(self.write()?.live_stories.remove(story_id))
    }

    /// Tracked stories, sorted.
    pub fn live_stories(&self) -> CacheResult<Vec<String>> {
        Ok(self.read()?.live_stories.iter().cloned().collect())
    }

    /// Drop credentials and request re-authentication. The user profile is kept
    /// so the login prompt can be prefilled.
    pub fn on_auth_failure(&self) -> CacheResult<()> {
        let mut state = self.write()?;
        if state.credentials.take().is_some() {
            warn!("credentials rejected, re-authentication required");
        }
        state.needs_reauth = true;
        state.loading.clear();
        Ok(())
    }

    /// Reset every field to its initial value.
    pub fn sign_out(&self) -> CacheResult<()> {
        let mut state = self.write()?;
        *state = SessionState::default();
        info!("session reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            access_token: "tok".to_string(),
            nonce: "n0nce".to_string(),
            expires_at: None,
        }
    }

    fn user() -> UserProfile {
        UserProfile {
            id: "u1".to_string(),
            email: "owner@example.com".to_string(),
            display_name: None,
        }
    }

    #[test]
    fn test_auth_failure_clears_credentials_only() {
        let session = SessionContext::new();
        session.sign_in(user(), creds()).unwrap();
        session.set_loading("stories", true).unwrap();
        session.subscribe_story("s-1").unwrap();

        session.on_auth_failure().unwrap();
        assert!(!session.is_authenticated().unwrap());
        assert!(session.needs_reauth().unwrap());
        assert!(!session.is_loading("stories").unwrap());
        assert_eq!(session.user().unwrap(), Some(user()));
        assert_eq!(session.live_stories().unwrap(), vec!["s-1".to_string()]);
        assert!(session.nonce().unwrap_err().is_auth());
    }

    #[test]
    fn test_sign_out_resets_everything() {
        let session = SessionContext::new();
        session.sign_in(user(), creds()).unwrap();
        session.subscribe_story("s-1").unwrap();
        session.sign_out().unwrap();
        assert_eq!(session.user().unwrap(), None);
        assert!(session.live_stories().unwrap().is_empty());
        assert!(!session.needs_reauth().unwrap());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let rendered = format!("{:?}", creds());
        assert!(!rendered.contains("tok\""));
        assert!(rendered.contains("<redacted>"));
    }
}
