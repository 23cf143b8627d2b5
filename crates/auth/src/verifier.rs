//! Bearer token verification.
//!
//! The verification key is a PEM RSA public key loaded lazily from a
//! configured path; once loaded it is cached for the process lifetime.

use std::path::PathBuf;
use std::sync::OnceLock;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use thiserror::Error;

use crate::claims::TokenClaims;

/// Authentication failure taxonomy. `Expired` and `Invalid` surface as 401;
/// `Missing` is left for the permission gate on non-exempt paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("token invalid")]
    Invalid,

    #[error("missing token")]
    Missing,

    #[error("verification key unavailable: {0}")]
    KeyUnavailable(String),
}

/// Token verification contract (object-safe so the middleware can hold
/// `Arc<dyn TokenVerifier>`).
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<TokenClaims, AuthError>;
}

/// Verifier configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Path to the PEM RSA public key.
    pub public_key_path: PathBuf,
    /// Expected `iss` claim.
    pub issuer: String,
    /// Expected `aud` claim; audience checking is skipped when unset.
    pub audience: Option<String>,
    /// Signature algorithm (default RS256).
    pub algorithm: Algorithm,
}

impl VerifierConfig {
    /// Read from `PUBLIC_KEY_PATH`, `JWT_ISSUER`, `JWT_AUDIENCE`,
    /// `JWT_ALGORITHM`.
    pub fn from_env() -> Result<Self, AuthError> {
        let public_key_path = std::env::var("PUBLIC_KEY_PATH")
            .map_err(|_| AuthError::KeyUnavailable("PUBLIC_KEY_PATH not set".to_string()))?
            .into();
        let issuer = std::env::var("JWT_ISSUER").unwrap_or_else(|_| "loomerp-auth".to_string());
        let audience = std::env::var("JWT_AUDIENCE").ok().filter(|a| !a.is_empty());
        let algorithm = match std::env::var("JWT_ALGORITHM").as_deref() {
            Ok("RS384") => Algorithm::RS384,
            Ok("RS512") => Algorithm::RS512,
            _ => Algorithm::RS256,
        };
        Ok(Self {
            public_key_path,
            issuer,
            audience,
            algorithm,
        })
    }
}

/// RS256 (RSA family) verifier over a published public key.
pub struct Rs256Verifier {
    config: VerifierConfig,
    key: OnceLock<Result<DecodingKey, String>>,
}

impl Rs256Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self {
            config,
            key: OnceLock::new(),
        }
    }

    /// Build a verifier over in-memory PEM bytes (tests, embedded keys).
    pub fn from_pem(config: VerifierConfig, pem: &[u8]) -> Result<Self, AuthError> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| AuthError::KeyUnavailable(e.to_string()))?;
        let verifier = Self::new(config);
        let _ = verifier.key.set(Ok(key));
        Ok(verifier)
    }

    fn decoding_key(&self) -> Result<&DecodingKey, AuthError> {
        let loaded = self.key.get_or_init(|| {
            let pem = std::fs::read(&self.config.public_key_path)
                .map_err(|e| format!("{}: {e}", self.config.public_key_path.display()))?;
            DecodingKey::from_rsa_pem(&pem).map_err(|e| e.to_string())
        });
        match loaded {
            Ok(key) => Ok(key),
            Err(e) => Err(AuthError::KeyUnavailable(e.clone())),
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.config.algorithm);
        validation.set_issuer(&[&self.config.issuer]);
        match &self.config.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

impl TokenVerifier for Rs256Verifier {
    fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let key = self.decoding_key()?;
        let data = decode::<TokenClaims>(token, key, &self.validation()).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            }
        })?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VerifierConfig {
        VerifierConfig {
            public_key_path: "/nonexistent/key.pem".into(),
            issuer: "loomerp-auth".to_string(),
            audience: None,
            algorithm: Algorithm::RS256,
        }
    }

    #[test]
    fn missing_key_file_reports_unavailable() {
        let verifier = Rs256Verifier::new(config());
        match verifier.verify("not-a-token") {
            Err(AuthError::KeyUnavailable(_)) => {}
            other => panic!("expected KeyUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn malformed_pem_is_rejected_at_construction() {
        let result = Rs256Verifier::from_pem(config(), b"not a pem at all");
        assert!(matches!(result, Err(AuthError::KeyUnavailable(_))));
    }

    #[test]
    fn audience_config_controls_validation_mode() {
        let without = Rs256Verifier::new(config());
        assert!(!without.validation().validate_aud);

        let with = Rs256Verifier::new(VerifierConfig {
            audience: Some("pos".to_string()),
            ..config()
        });
        assert!(with.validation().validate_aud);
    }
}
