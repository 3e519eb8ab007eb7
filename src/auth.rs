//! API-key extraction (for the dialect surface) and admin JWT issuance /
//! verification (for the admin surface).

use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Pulls a bearer credential from `Authorization: Bearer ...` or, for the
/// D-msg vendor convention, `x-api-key: ...`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = auth.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    if let Some(key) = headers.get("x-api-key") {
        if let Ok(s) = key.to_str() {
            return Some(s.trim().to_string());
        }
    }
    None
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String,
    pub exp: i64,
}

pub fn mint_admin_token(username: &str, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = AdminClaims {
        sub: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

pub fn verify_admin_token(token: &str, secret: &str) -> Result<AdminClaims, jsonwebtoken::errors::Error> {
    decode::<AdminClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map(|data| data.claims)
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_token_round_trips() {
        let token = mint_admin_token("admin", "secret").unwrap();
        let claims = verify_admin_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, "admin");
    }

    #[test]
    fn admin_token_rejects_wrong_secret() {
        let token = mint_admin_token("admin", "secret").unwrap();
        assert!(verify_admin_token(&token, "other").is_err());
    }

    #[test]
    fn extract_api_key_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer sk-abc".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("sk-abc".to_string()));
    }

    #[test]
    fn extract_api_key_falls_back_to_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-xyz".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("sk-xyz".to_string()));
    }
}
