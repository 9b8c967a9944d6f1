//! HS256 session tokens.

use super::Identity;
use crate::roles::Role;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: Uuid,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub nickname: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl SessionClaims {
    /// Role copied into the token at issue time. Informational only: the
    /// stored profile decides access.
    #[must_use]
    pub fn role(&self) -> Role {
        Role::from_claim(Some(&self.role))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("session token expired")]
    Expired,
    #[error("session token invalid")]
    Invalid,
    #[error("failed to sign session token")]
    Signing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct SessionSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_seconds: i64,
}

impl SessionSigner {
    #[must_use]
    pub fn new(secret: &SecretString, ttl_seconds: i64) -> Self {
        let secret = secret.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the caller's clock in `check`.
        validation.validate_exp = false;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl_seconds,
        }
    }

    #[must_use]
    pub const fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// # Errors
    /// Returns [`TokenError::Signing`] if encoding fails.
    pub fn issue(&self, identity: &Identity, now: DateTime<Utc>) -> Result<IssuedSession, TokenError> {
        let iat = now.timestamp();
        let exp = iat + self.ttl_seconds;
        let claims = SessionClaims {
            sub: identity.id,
            email: identity.email.clone(),
            role: identity.role.as_str().to_string(),
            nickname: identity.nickname.clone(),
            iat,
            exp,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| TokenError::Signing)?;
        let expires_at = DateTime::from_timestamp(exp, 0).ok_or(TokenError::Signing)?;
        Ok(IssuedSession { token, expires_at })
    }

    /// # Errors
    /// [`TokenError::Invalid`] for bad signatures or malformed tokens,
    /// [`TokenError::Expired`] once `now` reaches `exp`.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, TokenError> {
        self.check(token, now, 0)
    }

    /// Like [`Self::verify`] but accepts tokens that expired less than
    /// `grace_seconds` ago.
    ///
    /// # Errors
    /// See [`Self::verify`].
    pub fn verify_for_refresh(
        &self,
        token: &str,
        now: DateTime<Utc>,
        grace_seconds: i64,
    ) -> Result<SessionClaims, TokenError> {
        self.check(token, now, grace_seconds)
    }

    fn check(&self, token: &str, now: DateTime<Utc>, grace_seconds: i64) -> Result<SessionClaims, TokenError> {
        let data = decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map_err(|_| TokenError::Invalid)?;
        if now.timestamp() >= data.claims.exp.saturating_add(grace_seconds.max(0)) {
            return Err(TokenError::Expired);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn signer(ttl: i64) -> SessionSigner {
        SessionSigner::new(&SecretString::from("test-secret-0123456789"), ttl)
    }

    fn identity() -> Identity {
        Identity {
            id: Uuid::new_v4(),
            email: "fan@example.com".to_string(),
            role: Role::Member,
            nickname: Some("小刀".to_string()),
        }
    }

    #[test]
    fn issued_tokens_verify() -> Result<(), TokenError> {
        let signer = signer(3600);
        let user = identity();
        let now = Utc::now();
        let issued = signer.issue(&user, now)?;
        let claims = signer.verify(&issued.token, now)?;
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.role(), Role::Member);
        assert_eq!(claims.nickname.as_deref(), Some("小刀"));
        assert_eq!(claims.exp - claims.iat, 3600);
        assert_eq!(issued.expires_at.timestamp(), claims.exp);
        Ok(())
    }

    #[test]
    fn expired_tokens_are_rejected() -> Result<(), TokenError> {
        let signer = signer(60);
        let now = Utc::now();
        let issued = signer.issue(&identity(), now)?;
        assert_eq!(
            signer.verify(&issued.token, now + Duration::seconds(61)),
            Err(TokenError::Expired)
        );
        Ok(())
    }

    #[test]
    fn refresh_accepts_recently_expired_tokens() -> Result<(), TokenError> {
        let signer = signer(60);
        let now = Utc::now();
        let issued = signer.issue(&identity(), now)?;
        let later = now + Duration::seconds(600);
        assert!(signer.verify_for_refresh(&issued.token, later, 3600).is_ok());
        assert_eq!(
            signer.verify_for_refresh(&issued.token, later, 60),
            Err(TokenError::Expired)
        );
        Ok(())
    }

    #[test]
    fn foreign_signatures_are_invalid() -> Result<(), TokenError> {
        let issued = signer(60).issue(&identity(), Utc::now())?;
        let other = SessionSigner::new(&SecretString::from("another-secret"), 60);
        assert_eq!(
            other.verify(&issued.token, Utc::now()),
            Err(TokenError::Invalid)
        );
        assert_eq!(
            other.verify("not-a-jwt", Utc::now()),
            Err(TokenError::Invalid)
        );
        Ok(())
    }

    #[test]
    fn unknown_role_claims_read_as_fan() {
        let claims = SessionClaims {
            sub: Uuid::new_v4(),
            email: "x@example.com".to_string(),
            role: "Admiral".to_string(),
            nickname: None,
            iat: 0,
            exp: 1,
        };
        assert_eq!(claims.role(), Role::Fan);
    }
}
