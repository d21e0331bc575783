//! Bearer credential management
//!
//! Holds the Stockbit bearer token plus optional session cookies, persists
//! them to `token.json`, and answers validity queries. Claims embedded in
//! the token (expiry, user id) are extracted best-effort: a token whose
//! payload does not decode is stored opaquely and its validity becomes
//! unknown rather than being rejected.

use crate::error::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Validity window subtracted from the known expiry, so a token is treated
/// as stale slightly before the broker starts rejecting it.
const EXPIRY_SAFETY_MARGIN_SECS: i64 = 60;

/// Current credential. The serialized form is exactly the four keys of
/// `token.json`; the rejection flag lives only in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub cookies: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub user_id: Option<i64>,
    /// Set when the broker rejected this token (HTTP 401) even though the
    /// claimed expiry has not passed.
    #[serde(skip)]
    pub marked_expired: bool,
}

/// Remaining lifetime of the current credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Unknown,
    Expired,
    Remaining(std::time::Duration),
}

/// Serializable credential snapshot for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub has_token: bool,
    pub valid: bool,
    pub expired: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub user_id: Option<i64>,
    pub seconds_until_expiry: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default, alias = "uid", deserialize_with = "de_opt_i64")]
    user_id: Option<i64>,
}

/// Accepts an integer or a numeric string for the user-id claim.
fn de_opt_i64<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// Manages the bearer credential across the process lifetime.
pub struct TokenManager {
    path: PathBuf,
    credential: RwLock<Option<Credential>>,
}

impl TokenManager {
    /// Load any persisted credential from `path` (missing or unreadable
    /// files start the manager empty).
    pub fn new(path: PathBuf) -> Self {
        let credential = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Credential>(&raw) {
                Ok(cred) if !cred.access_token.is_empty() => Some(cred),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("ignoring unreadable credential file {:?}: {}", path, e);
                    None
                }
            },
            Err(_) => None,
        };

        if credential.is_some() {
            tracing::info!("loaded persisted credential from {:?}", path);
        }

        Self {
            path,
            credential: RwLock::new(credential),
        }
    }

    /// Replace the current credential and persist it atomically.
    ///
    /// An empty token clears the store. Claim extraction failures are not
    /// errors: the token is kept with unknown expiry.
    pub fn set(&self, token: &str, cookies: Option<&str>) -> Result<CredentialStatus> {
        let token = token.trim();
        if token.is_empty() {
            self.clear()?;
            return Ok(self.status());
        }

        let claims = decode_claims(token);
        if claims.is_none() {
            tracing::warn!("token claims could not be decoded; storing opaquely");
        }

        let credential = Credential {
            access_token: token.to_string(),
            cookies: cookies
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            expires_at: claims
                .as_ref()
                .and_then(|c| c.exp)
                .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0)),
            user_id: claims.as_ref().and_then(|c| c.user_id),
            marked_expired: false,
        };

        *self.credential.write() = Some(credential);
        self.persist()?;
        Ok(self.status())
    }

    /// Current bearer token, if any.
    pub fn token(&self) -> Option<String> {
        self.credential
            .read()
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    /// Current cookie string, if any.
    pub fn cookies(&self) -> Option<String> {
        self.credential.read().as_ref().and_then(|c| c.cookies.clone())
    }

    /// User id extracted from the token claims, if present.
    pub fn user_id(&self) -> Option<i64> {
        self.credential.read().as_ref().and_then(|c| c.user_id)
    }

    /// True iff a token is present and not known (or marked) expired.
    pub fn is_valid(&self) -> bool {
        match self.time_until_expiry() {
            Some(Expiry::Expired) => false,
            Some(_) => true,
            None => false,
        }
    }

    /// Remaining lifetime, or `None` when no token is set.
    pub fn time_until_expiry(&self) -> Option<Expiry> {
        let guard = self.credential.read();
        let cred = guard.as_ref()?;
        if cred.marked_expired {
            return Some(Expiry::Expired);
        }
        match cred.expires_at {
            None => Some(Expiry::Unknown),
            Some(expires_at) => {
                let deadline = expires_at - ChronoDuration::seconds(EXPIRY_SAFETY_MARGIN_SECS);
                let remaining = deadline - Utc::now();
                if remaining <= ChronoDuration::zero() {
                    Some(Expiry::Expired)
                } else {
                    Some(Expiry::Remaining(std::time::Duration::from_secs(
                        remaining.num_seconds().max(0) as u64,
                    )))
                }
            }
        }
    }

    /// Flag the current token as rejected by the broker without discarding
    /// it, so status queries can show what was set. The flag is
    /// process-lifetime only; the file on disk keeps the raw credential.
    pub fn mark_expired(&self) {
        if let Some(cred) = self.credential.write().as_mut() {
            cred.marked_expired = true;
        }
    }

    /// Remove the credential from memory and disk.
    pub fn clear(&self) -> Result<()> {
        *self.credential.write() = None;
        self.persist()
    }

    /// Snapshot for status queries.
    pub fn status(&self) -> CredentialStatus {
        let expiry = self.time_until_expiry();
        let guard = self.credential.read();
        match guard.as_ref() {
            None => CredentialStatus {
                has_token: false,
                valid: false,
                expired: false,
                expires_at: None,
                user_id: None,
                seconds_until_expiry: None,
            },
            Some(cred) => CredentialStatus {
                has_token: true,
                valid: matches!(expiry, Some(Expiry::Unknown) | Some(Expiry::Remaining(_))),
                expired: matches!(expiry, Some(Expiry::Expired)),
                expires_at: cred.expires_at,
                user_id: cred.user_id,
                seconds_until_expiry: match expiry {
                    Some(Expiry::Remaining(d)) => Some(d.as_secs() as i64),
                    _ => None,
                },
            },
        }
    }

    /// Write the current state to disk via tempfile + rename so a crash
    /// mid-write never leaves a torn file.
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = match self.credential.read().as_ref() {
            Some(cred) => serde_json::to_string_pretty(cred)?,
            None => serde_json::to_string_pretty(&serde_json::json!({
                "access_token": "",
                "cookies": null,
                "expires_at": null,
                "user_id": null,
            }))?,
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Decode the claims segment of a JWT (header.payload.signature).
fn decode_claims(token: &str) -> Option<TokenClaims> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// Build a minimally valid bearer token for tests and local tooling.
#[cfg(test)]
pub(crate) fn make_test_token(exp: i64, user_id: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "exp": exp, "user_id": user_id })
            .to_string()
            .as_bytes(),
    );
    format!("{header}.{claims}.sig")
}
