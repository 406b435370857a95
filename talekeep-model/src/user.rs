use argon2::password_hash::{PasswordHasher, SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::UserId;

/// An account that may hold sessions and preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, password: &str, is_admin: bool) -> Result<Self, ModelError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| ModelError::PasswordHash(e.to_string()))?;
        Ok(Self {
            id: UserId::new(),
            username: username.into(),
            password_hash: hash.to_string(),
            is_admin,
            created_at: Utc::now(),
        })
    }

    pub fn verify_password(&self, password: &str) -> bool {
        PasswordHash::new(&self.password_hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    }
}

/// A login session token with expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Per-user UI preference, stored as an opaque JSON value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub user_id: UserId,
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_verification() {
        let user = User::new("admin", "correct horse", true).unwrap();
        assert!(user.verify_password("correct horse"));
        assert!(!user.verify_password("battery staple"));
    }

    #[test]
    fn session_expiry() {
        let session = Session {
            token: "t".into(),
            user_id: UserId::new(),
            created_at: Utc::now(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        };
        assert!(session.is_expired(Utc::now()));
    }
}
