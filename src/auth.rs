// 🔐 Session
// The signed-in user; persistence only runs with a valid session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,

    #[serde(default)]
    pub email: Option<String>,

    /// None = does not expire
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Session {
            user_id: user_id.into(),
            email: None,
            expires_at: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.user_id.trim().is_empty() && self.expires_at.map_or(true, |exp| exp > now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

/// The session, if there is one and it is still valid
pub fn active_session(session: Option<&Session>) -> Option<&Session> {
    session.filter(|s| s.is_valid())
}

/// Resolve an `Authorization: Bearer <token>` header against the
/// configured token table (token -> user id)
pub fn session_from_bearer(header: Option<&str>, tokens: &BTreeMap<String, String>) -> Option<Session> {
    let token = header?.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    let session = Session::new(tokens.get(token)?.clone());
    active_session(Some(&session)).cloned()
}
