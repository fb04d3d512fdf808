//! Bearer-token validation for proxy sessions.
//!
//! Tokens are HMAC-signed JWTs carrying `{username, role, exp}`. Validation
//! checks the signature and expiry, then cross-checks the claimed role
//! against the role currently recorded for the user — a token minted before
//! a role change must stop working immediately.

use chrono::{Duration, Utc};
use dargah_common::{Role, TokenClaims};
use dargah_store::users::UserStore;
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use std::str::FromStr;

/// Why a token was rejected. All variants surface as SQLSTATE 28000.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    BadToken(String),

    #[error("token expired")]
    ExpiredToken,

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("role mismatch for user {0}")]
    RoleMismatch(String),

    #[error("user lookup failed: {0}")]
    Lookup(#[from] sqlx::Error),
}

impl AuthError {
    /// SQLSTATE reported to the client; every authorization failure maps to
    /// invalid_authorization_specification.
    pub fn sqlstate(&self) -> &'static str {
        "28000"
    }
}

fn hmac_algorithm(alg: Algorithm) -> Option<Algorithm> {
    match alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Some(alg),
        _ => None,
    }
}

/// Identity resolved from a valid token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub username: String,
    pub role: Role,
}

/// Validate a bearer token and resolve the caller's identity.
pub async fn validate(
    token: &str,
    secret: &str,
    users: &UserStore,
) -> Result<AuthenticatedUser, AuthError> {
    let header = decode_header(token).map_err(|e| AuthError::BadToken(e.to_string()))?;
    let algorithm = hmac_algorithm(header.alg)
        .ok_or_else(|| AuthError::BadToken(format!("unexpected signing method {:?}", header.alg)))?;

    let mut validation = Validation::new(algorithm);
    validation.set_required_spec_claims(&["exp"]);

    let data = decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
        _ => AuthError::BadToken(e.to_string()),
    })?;

    let claims = data.claims;
    let claimed_role =
        Role::from_str(&claims.role).map_err(|_| AuthError::BadToken("unknown role".into()))?;

    let user = users
        .get_by_username(&claims.username)
        .await?
        .ok_or_else(|| AuthError::UnknownUser(claims.username.clone()))?;

    if user.role != claims.role {
        return Err(AuthError::RoleMismatch(claims.username));
    }

    Ok(AuthenticatedUser {
        id: user.id,
        username: claims.username,
        role: claimed_role,
    })
}

/// Mint a token for a user, expiring after `ttl_hours`.
pub fn issue(username: &str, role: Role, secret: &str, ttl_hours: i64) -> anyhow::Result<String> {
    let claims = TokenClaims {
        username: username.to_string(),
        role: role.as_str().to_string(),
        exp: (Utc::now() + Duration::hours(ttl_hours)).timestamp(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}
