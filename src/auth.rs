//! Request authentication (HS256 JWT)

use anyhow::{anyhow, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::types::Request;

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user or service name)
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Issued at (unix timestamp)
    pub iat: usize,
    /// Expiration (unix timestamp)
    pub exp: usize,
}

/// Issue a token, e.g. for schedulers calling the trigger subject
pub fn generate_token(subject: &str, role: Option<&str>, ttl_secs: usize, secret: &str) -> Result<String> {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = Claims {
        sub: subject.to_string(),
        role: role.map(str::to_string),
        iat: now,
        exp: now + ttl_secs,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Validate a JWT token and return claims
pub fn validate_token(token: &str, secret: &str) -> Result<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| anyhow!("Invalid token: {}", e))?;

    Ok(token_data.claims)
}

/// Check a request against the configured secret.
///
/// Without a secret every request passes with `None`; with one, a valid token
/// is required.
pub fn authorize<T>(request: &Request<T>, jwt_secret: Option<&str>) -> Result<Option<Claims>> {
    let Some(secret) = jwt_secret else {
        return Ok(None);
    };
    let token = request
        .token
        .as_deref()
        .ok_or_else(|| anyhow!("No authentication provided, JWT token is required"))?;
    validate_token(token, secret).map(Some)
}
