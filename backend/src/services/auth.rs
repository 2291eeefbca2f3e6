//! Account signup and login.

use std::sync::Arc;

use validator::Validate;

use crate::{
    error::AppError,
    models::user::{LoginRequest, SignupRequest, TokenResponse, User},
    repositories::UserStore,
    services::token_cache::TokenStore,
    types::UserId,
    utils::{
        password::{hash_password_blocking, verify_password_blocking},
        token::generate_access_token,
    },
};

pub const INVALID_CREDENTIALS: &str = "Incorrect email or password";
pub const EMAIL_TAKEN: &str = "User with this email already exists";

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    tokens: Arc<dyn TokenStore>,
    token_ttl_seconds: u64,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserStore>, tokens: Arc<dyn TokenStore>, token_ttl_seconds: u64) -> Self {
        Self {
            users,
            tokens,
            token_ttl_seconds,
        }
    }

    /// Creates an account and signs it in.
    ///
    /// The email check and the insert are two separate calls, so two
    /// concurrent signups with the same email can both succeed.
    pub async fn signup(&self, payload: SignupRequest) -> Result<TokenResponse, AppError> {
        payload.validate()?;

        if self.users.find_by_email(&payload.email).await?.is_some() {
            return Err(AppError::BadRequest(EMAIL_TAKEN.to_string()));
        }

        let password_hash = hash_password_blocking(payload.password).await?;
        let user = User::new(payload.email, password_hash, payload.name.trim().to_string());
        self.users.insert(&user).await?;
        tracing::info!(user_id = %user.id, "Account created");

        self.issue_token(user.id).await
    }

    pub async fn login(&self, payload: LoginRequest) -> Result<TokenResponse, AppError> {
        let user = self
            .users
            .find_by_email(&payload.email)
            .await?
            .ok_or_else(|| AppError::Unauthorized(INVALID_CREDENTIALS.to_string()))?;

        let matches = verify_password_blocking(payload.password, user.password_hash.clone()).await?;
        if !matches {
            return Err(AppError::Unauthorized(INVALID_CREDENTIALS.to_string()));
        }

        self.issue_token(user.id).await
    }

    async fn issue_token(&self, user_id: UserId) -> Result<TokenResponse, AppError> {
        let token = generate_access_token();
        self.tokens
            .register(&token, user_id, self.token_ttl_seconds)
            .await?;
        Ok(TokenResponse::bearer(token, user_id))
    }
}
