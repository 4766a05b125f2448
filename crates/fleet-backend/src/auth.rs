//! Controller bearer tokens (HS256).

use std::time::Duration;

use axum::http::{HeaderMap, header};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use fleet_state::{ControllerId, UserId, epoch_secs};

use crate::error::{BackendError, BackendResult};

/// Claims carried by a controller token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Owning user.
    pub sub: UserId,
    /// Controller the token was issued to.
    pub ctrl: ControllerId,
    pub iat: u64,
    pub exp: u64,
}

/// Issues and verifies controller tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Sign a token for `ctrl_id`. Returns the token and its lifetime in seconds.
    pub fn issue(&self, user_id: &str, ctrl_id: &str) -> BackendResult<(String, u64)> {
        let iat = epoch_secs();
        let claims = Claims {
            sub: user_id.to_string(),
            ctrl: ctrl_id.to_string(),
            iat,
            exp: iat + self.ttl.as_secs(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        Ok((token, self.ttl.as_secs()))
    }

    pub fn verify(&self, token: &str) -> BackendResult<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())?;
        if data.claims.ctrl.is_empty() {
            return Err(BackendError::Unauthorized("token is not bound to a controller".into()));
        }
        Ok(data.claims)
    }

    /// Verify the `Authorization: Bearer …` header.
    pub fn verify_headers(&self, headers: &HeaderMap) -> BackendResult<Claims> {
        let value = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| BackendError::Unauthorized("missing authorization header".into()))?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or_else(|| BackendError::Unauthorized("expected a bearer token".into()))?;
        self.verify(token.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(b"test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn issued_token_verifies() {
        let tokens = issuer();
        let (token, ttl) = tokens.issue("u1", "c1").unwrap();
        assert_eq!(ttl, 3600);

        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.ctrl, "c1");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn foreign_secret_is_rejected() {
        let (token, _) = TokenIssuer::new(b"other", Duration::from_secs(60))
            .issue("u1", "c1")
            .unwrap();
        let err = issuer().verify(&token).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn expired_token_is_rejected() {
        let claims = Claims {
            sub: "u1".into(),
            ctrl: "c1".into(),
            iat: 1_000,
            exp: 2_000,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(issuer().verify(&token).is_err());
    }

    #[test]
    fn header_parsing() {
        let tokens = issuer();
        let (token, _) = tokens.issue("u1", "c1").unwrap();

        let mut headers = HeaderMap::new();
        assert!(tokens.verify_headers(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&token).unwrap());
        assert!(tokens.verify_headers(&headers).is_err());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        assert_eq!(tokens.verify_headers(&headers).unwrap().ctrl, "c1");
    }
}
