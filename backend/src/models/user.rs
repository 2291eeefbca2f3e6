//! Models that represent user accounts and authentication payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::types::UserId;
use crate::validation::rules::validate_display_name;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Stored representation of a registered account.
pub struct User {
    /// Generated identity, also the document key.
    pub id: UserId,
    /// Login email; uniqueness is checked by query at signup.
    pub email: String,
    /// Argon2 PHC string of the user's password.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Name shown in the chat client.
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: String, password_hash: String, display_name: String) -> Self {
        Self {
            id: UserId::new(),
            email,
            password_hash,
            display_name,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
/// Payload submitted to create a new account.
pub struct SignupRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8))]
    pub password: String,
    #[validate(custom(function = "validate_display_name"))]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Credentials submitted by a user attempting to authenticate.
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Token envelope returned by both signup and login.
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub user_id: UserId,
}

impl TokenResponse {
    pub fn bearer(access_token: String, user_id: UserId) -> Self {
        Self {
            access_token,
            token_type: "bearer".to_string(),
            user_id,
        }
    }
}
