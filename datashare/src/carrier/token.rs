//! The carrier bearer-token lifecycle.
//!
//! Exactly one token is active at a time; activating a new one (via OTP
//! login or a manual override) deactivates all priors in the same write.
//! Expiry is read from the credential's own embedded claim where possible,
//! falling back to a fixed horizon when the token cannot be decoded. The
//! fallback indicates degraded confidence in the true expiry and is logged
//! as such.

use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc, RwLock,
};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};

use super::CarrierError;
use crate::job::UserId;

/// Horizon assumed for tokens whose expiry claim cannot be decoded.
const FALLBACK_EXPIRY: TimeDelta = TimeDelta::hours(12);

/// Tokens within this horizon of expiry are reported as needing a refresh.
const REFRESH_HORIZON: TimeDelta = TimeDelta::hours(2);

#[derive(Debug, Clone, PartialEq)]
pub struct CarrierToken {
    pub id: i32,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub refreshed_by: Option<UserId>,
    pub last_error: Option<String>,
}

/// A token as exposed by [`TokenStore::history`]: the raw credential is
/// redacted.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSummary {
    pub id: i32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub refreshed_by: Option<UserId>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenStatus {
    NoToken,
    Expired {
        expired_at: DateTime<Utc>,
    },
    Active {
        expires_at: DateTime<Utc>,
        hours_remaining: i64,
        needs_refresh: bool,
    },
}

impl TokenStatus {
    pub fn needs_refresh(&self) -> bool {
        match self {
            TokenStatus::NoToken | TokenStatus::Expired { .. } => true,
            TokenStatus::Active { needs_refresh, .. } => *needs_refresh,
        }
    }
}

#[derive(Default)]
struct TokenState {
    tokens: Vec<CarrierToken>,
    waiting_for_otp: bool,
}

#[derive(Clone, Default)]
pub struct TokenStore {
    inner: Arc<RwLock<TokenState>>,
    id_counter: Arc<AtomicI32>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activates a new token, deactivating all prior tokens in the same
    /// write so a concurrent lookup can never observe two active tokens.
    pub fn activate(
        &self,
        token: impl Into<String>,
        refreshed_by: Option<UserId>,
    ) -> Result<CarrierToken, CarrierError> {
        let token = token.into();
        let expires_at = token_expiry(&token);
        let mut state = self.inner.write().map_err(|_| CarrierError::BadState)?;
        for prior in state.tokens.iter_mut() {
            prior.active = false;
        }
        let new = CarrierToken {
            id: self.id_counter.fetch_add(1, Ordering::SeqCst) + 1,
            token,
            issued_at: Utc::now(),
            expires_at,
            active: true,
            refreshed_by,
            last_error: None,
        };
        state.tokens.push(new.clone());
        state.waiting_for_otp = false;
        Ok(new)
    }

    /// The active, unexpired token, if any.
    pub fn active(&self) -> Result<Option<CarrierToken>, CarrierError> {
        let state = self.inner.read().map_err(|_| CarrierError::BadState)?;
        let now = Utc::now();
        Ok(state
            .tokens
            .iter()
            .filter(|token| token.active && token.expires_at > now)
            .max_by_key(|token| token.issued_at)
            .cloned())
    }

    /// The most recently issued token regardless of state. Used as a last
    /// resort when no valid token exists.
    pub fn latest(&self) -> Result<Option<CarrierToken>, CarrierError> {
        let state = self.inner.read().map_err(|_| CarrierError::BadState)?;
        Ok(state
            .tokens
            .iter()
            .max_by_key(|token| token.issued_at)
            .cloned())
    }

    /// Deactivates the active token, recording why (the 401 path).
    pub fn deactivate_active(&self, error: &str) -> Result<(), CarrierError> {
        let mut state = self.inner.write().map_err(|_| CarrierError::BadState)?;
        for token in state.tokens.iter_mut().filter(|token| token.active) {
            token.active = false;
            token.last_error = Some(error.to_owned());
        }
        Ok(())
    }

    /// Records a failure against the active token without deactivating it
    /// (e.g. a rejected OTP).
    pub fn record_error(&self, error: &str) -> Result<(), CarrierError> {
        let mut state = self.inner.write().map_err(|_| CarrierError::BadState)?;
        for token in state.tokens.iter_mut().filter(|token| token.active) {
            token.last_error = Some(error.to_owned());
        }
        state.waiting_for_otp = false;
        Ok(())
    }

    pub fn mark_otp_requested(&self) -> Result<(), CarrierError> {
        let mut state = self.inner.write().map_err(|_| CarrierError::BadState)?;
        state.waiting_for_otp = true;
        Ok(())
    }

    pub fn waiting_for_otp(&self) -> Result<bool, CarrierError> {
        let state = self.inner.read().map_err(|_| CarrierError::BadState)?;
        Ok(state.waiting_for_otp)
    }

    pub fn status(&self) -> Result<TokenStatus, CarrierError> {
        let state = self.inner.read().map_err(|_| CarrierError::BadState)?;
        let Some(token) = state
            .tokens
            .iter()
            .filter(|token| token.active)
            .max_by_key(|token| token.issued_at)
        else {
            return Ok(TokenStatus::NoToken);
        };
        let now = Utc::now();
        if token.expires_at <= now {
            return Ok(TokenStatus::Expired {
                expired_at: token.expires_at,
            });
        }
        let remaining = token.expires_at - now;
        Ok(TokenStatus::Active {
            expires_at: token.expires_at,
            hours_remaining: remaining.num_hours(),
            needs_refresh: remaining < REFRESH_HORIZON,
        })
    }

    /// Recent tokens, newest first, raw credentials redacted.
    pub fn history(&self, limit: usize) -> Result<Vec<TokenSummary>, CarrierError> {
        let state = self.inner.read().map_err(|_| CarrierError::BadState)?;
        let mut tokens: Vec<&CarrierToken> = state.tokens.iter().collect();
        tokens.sort_by(|a, b| b.issued_at.cmp(&a.issued_at).then(b.id.cmp(&a.id)));
        Ok(tokens
            .into_iter()
            .take(limit)
            .map(|token| TokenSummary {
                id: token.id,
                issued_at: token.issued_at,
                expires_at: token.expires_at,
                active: token.active,
                refreshed_by: token.refreshed_by,
                last_error: token.last_error.clone(),
            })
            .collect())
    }
}

/// Resolves a token's expiry: the embedded `exp` claim when the credential
/// decodes and the claim is in the future, else a fixed fallback horizon.
fn token_expiry(token: &str) -> DateTime<Utc> {
    match try_decode_expiry(token) {
        Some(expires_at) if expires_at > Utc::now() => {
            tracing::debug!(%expires_at, "Token expiry read from embedded claim");
            expires_at
        }
        _ => {
            let fallback = Utc::now() + FALLBACK_EXPIRY;
            tracing::warn!(
                expires_at = %fallback,
                "Could not decode token expiry, assuming fixed horizon"
            );
            fallback
        }
    }
}

fn try_decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let claims = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(claims.as_bytes()).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use assert_matches::assert_matches;

    /// Builds a decodable credential whose `exp` claim is `expires_at`.
    pub(crate) fn signed_token(expires_at: DateTime<Utc>) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(
            serde_json::json!({ "exp": expires_at.timestamp() })
                .to_string()
                .as_bytes(),
        );
        format!("{header}.{claims}.signature")
    }

    #[test]
    fn expiry_from_embedded_claim() {
        let expires_at = Utc::now() + TimeDelta::hours(8);
        let decoded = try_decode_expiry(&signed_token(expires_at)).unwrap();
        assert_eq!(decoded.timestamp(), expires_at.timestamp());
    }

    #[test]
    fn undecodable_token_gets_fallback_horizon() {
        let expiry = token_expiry("not-a-structured-token");
        let remaining = expiry - Utc::now();
        assert!(remaining > TimeDelta::hours(11));
        assert!(remaining <= TimeDelta::hours(12));
    }

    #[test]
    fn stale_embedded_claim_gets_fallback_horizon() {
        let expiry = token_expiry(&signed_token(Utc::now() - TimeDelta::hours(1)));
        assert!(expiry > Utc::now() + TimeDelta::hours(11));
    }

    #[test]
    fn activation_deactivates_priors() {
        let store = TokenStore::new();
        let first = store.activate("first-token", None).unwrap();
        let second = store
            .activate("second-token", Some(UserId::from(7)))
            .unwrap();

        let active = store.active().unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.refreshed_by, Some(UserId::from(7)));

        let history = store.history(20).unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history.iter().any(|token| token.id == first.id && token.active));
    }

    #[test]
    fn status_reflects_lifecycle() {
        let store = TokenStore::new();
        assert_matches!(store.status().unwrap(), TokenStatus::NoToken);

        store
            .activate(signed_token(Utc::now() + TimeDelta::hours(8)), None)
            .unwrap();
        assert_matches!(
            store.status().unwrap(),
            TokenStatus::Active {
                hours_remaining,
                needs_refresh: false,
                ..
            } if hours_remaining == 7 || hours_remaining == 8
        );
        assert!(!store.status().unwrap().needs_refresh());

        store
            .activate(signed_token(Utc::now() + TimeDelta::minutes(30)), None)
            .unwrap();
        assert_matches!(
            store.status().unwrap(),
            TokenStatus::Active {
                needs_refresh: true,
                ..
            }
        );
        assert!(store.status().unwrap().needs_refresh());
    }

    #[test]
    fn deactivated_token_is_not_served_but_remains_latest() {
        let store = TokenStore::new();
        store.activate("the-token", None).unwrap();
        store.deactivate_active("Token rejected by carrier").unwrap();

        assert_matches!(store.active().unwrap(), None);
        assert_matches!(store.status().unwrap(), TokenStatus::NoToken);
        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.token, "the-token");
        assert_eq!(
            latest.last_error.as_deref(),
            Some("Token rejected by carrier")
        );
    }
}
