//! Token Verification
//!
//! Players sign in with JWTs minted by an external identity provider;
//! this server only verifies them and never issues its own. The stable
//! identity used everywhere else is a hash of the token's subject, so
//! the provider's user IDs never leak into rooms, queues, or ledger
//! keys.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::ids::UserId;

/// Key material used to verify provider-issued tokens.
#[derive(Clone, Debug)]
pub enum VerifyKey {
    /// RS256 public key in PEM form (hosted identity providers).
    RsaPem(String),
    /// HS256 shared secret (simple self-hosted setups).
    HmacSecret(String),
}

/// Token verification settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected `iss` claim; unchecked when absent.
    pub issuer: Option<String>,
    /// Expected `aud` claim; unchecked when absent.
    pub audience: Option<String>,
    /// Verification key. Without one every login fails.
    pub key: Option<VerifyKey>,
    /// Accept expired tokens. Local development only.
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Build the config from environment variables. A PEM key wins
    /// over a shared secret when both are set.
    pub fn from_env() -> Self {
        let key = std::env::var("AUTH_PUBLIC_KEY_PEM")
            .ok()
            .map(VerifyKey::RsaPem)
            .or_else(|| std::env::var("AUTH_SECRET").ok().map(VerifyKey::HmacSecret));

        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            key,
            skip_expiry: matches!(
                std::env::var("AUTH_SKIP_EXPIRY").as_deref(),
                Ok("1") | Ok("true")
            ),
        }
    }

    /// Whether a verification key is present.
    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }
}

/// Claims read out of a verified token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Provider-assigned subject; the stable user identity.
    pub sub: String,
    /// Expiry (Unix seconds).
    #[serde(default)]
    pub exp: u64,
}

impl TokenClaims {
    /// Deterministic 16-byte `UserId` from the subject claim.
    pub fn user_id(&self) -> UserId {
        let digest = Sha256::new()
            .chain_update(b"quiz-arena-user:")
            .chain_update(self.sub.as_bytes())
            .finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        UserId::new(id)
    }
}

/// Verification failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No verification key configured on the server.
    #[error("authentication not configured")]
    NotConfigured,
    /// The token's expiry has passed.
    #[error("token expired")]
    Expired,
    /// The token has no usable subject claim.
    #[error("missing required claim: sub")]
    MissingSubject,
    /// Signature, format, or claim mismatch.
    #[error("token rejected: {0}")]
    Rejected(String),
}

/// Verify a token and return its claims.
///
/// Expiry, issuer, and audience are all enforced in one pass by the
/// decoder according to the config.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let key = config.key.as_ref().ok_or(AuthError::NotConfigured)?;

    let (algorithm, decoding_key) = match key {
        VerifyKey::RsaPem(pem) => (
            Algorithm::RS256,
            DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::Rejected(format!("bad public key: {}", e)))?,
        ),
        VerifyKey::HmacSecret(secret) => {
            (Algorithm::HS256, DecodingKey::from_secret(secret.as_bytes()))
        }
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims.clear();
    validation.validate_exp = !config.skip_expiry;
    if let Some(issuer) = &config.issuer {
        validation.set_issuer(&[issuer]);
    }
    match &config.audience {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }

    let claims = decode::<TokenClaims>(token, &decoding_key, &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Rejected(e.to_string()),
        })?
        .claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingSubject);
    }
    Ok(claims)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "arena-test-secret";

    #[derive(Serialize)]
    struct MintedClaims<'a> {
        sub: &'a str,
        exp: u64,
        iss: &'a str,
    }

    fn mint(sub: &str, exp: u64, secret: &str) -> String {
        let claims = MintedClaims {
            sub,
            exp,
            iss: "arena-tests",
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn hs256_config() -> AuthConfig {
        AuthConfig {
            key: Some(VerifyKey::HmacSecret(SECRET.into())),
            ..Default::default()
        }
    }

    fn in_an_hour() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600
    }

    #[test]
    fn test_accepts_valid_token() {
        let token = mint("player-1", in_an_hour(), SECRET);
        let claims = validate_token(&token, &hs256_config()).unwrap();
        assert_eq!(claims.sub, "player-1");
    }

    #[test]
    fn test_rejects_wrong_secret() {
        let token = mint("player-1", in_an_hour(), "some-other-secret");
        let result = validate_token(&token, &hs256_config());
        assert!(matches!(result, Err(AuthError::Rejected(_))));
    }

    #[test]
    fn test_expired_token_rejected_unless_skipped() {
        let token = mint("player-1", 1, SECRET);
        assert!(matches!(
            validate_token(&token, &hs256_config()),
            Err(AuthError::Expired)
        ));

        let relaxed = AuthConfig {
            skip_expiry: true,
            ..hs256_config()
        };
        assert!(validate_token(&token, &relaxed).is_ok());
    }

    #[test]
    fn test_issuer_checked_when_configured() {
        let token = mint("player-1", in_an_hour(), SECRET);
        let strict = AuthConfig {
            issuer: Some("someone-else".into()),
            ..hs256_config()
        };
        assert!(matches!(
            validate_token(&token, &strict),
            Err(AuthError::Rejected(_))
        ));

        let matching = AuthConfig {
            issuer: Some("arena-tests".into()),
            ..hs256_config()
        };
        assert!(validate_token(&token, &matching).is_ok());
    }

    #[test]
    fn test_empty_subject_rejected() {
        let token = mint("", in_an_hour(), SECRET);
        let result = validate_token(&token, &hs256_config());
        assert!(matches!(result, Err(AuthError::MissingSubject)));
    }

    #[test]
    fn test_unconfigured_server_rejects_all_tokens() {
        let token = mint("player-1", in_an_hour(), SECRET);
        let result = validate_token(&token, &AuthConfig::default());
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_user_id_stable_per_subject() {
        let a = TokenClaims {
            sub: "player-1".into(),
            exp: 0,
        };
        let b = TokenClaims {
            sub: "player-2".into(),
            exp: 0,
        };
        assert_eq!(a.user_id(), a.user_id());
        assert_ne!(a.user_id(), b.user_id());
    }
}
