//! Access token issuance.
//!
//! The [`TokenFactory`] trait is the seam to token signing. [`HmacTokenFactory`]
//! issues short-lived tokens for a resolved [`RoleIdentity`]:
//!
//! ```text
//! base64url({"protected": b64(header), "payload": b64(claims), "signature": b64(hmac)})
//! ```
//!
//! The signature is HMAC-SHA256 over `protected.payload`. The token is opaque to
//! callers; [`TokenFactory::verify`] exists for consumers sharing the key.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hmac::{KeyInit, Mac};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::authenticators::RoleIdentity;
use crate::config::TokenConfig;
use crate::{Error, Result};

type HmacSha256 = hmac::Hmac<Sha256>;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Role id the token was issued for.
    pub sub: String,
    /// Issued-at (Unix epoch seconds).
    pub iat: u64,
    /// Expires-at (Unix epoch seconds).
    pub exp: u64,
    /// Unique token id.
    pub jti: String,
}

/// An issued token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// Serialized token.
    pub token: String,
    /// Claims, for logging and response metadata.
    pub claims: TokenClaims,
}

/// Issues access tokens for resolved identities.
pub trait TokenFactory: Send + Sync {
    /// Issue a token for `identity`.
    fn issue(&self, identity: &RoleIdentity) -> Result<AccessToken>;

    /// Verify a token issued by this factory and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedToken`] for undecodable input,
    /// [`Error::InvalidSignature`] for a bad signature and
    /// [`Error::TokenExpired`] past `exp`.
    fn verify(&self, token: &str) -> Result<TokenClaims>;
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    protected: String,
    payload: String,
    signature: String,
}

#[derive(Serialize, Deserialize)]
struct ProtectedHeader {
    alg: String,
    kid: String,
}

/// HMAC-SHA256 token factory.
pub struct HmacTokenFactory {
    key: Vec<u8>,
    kid: String,
    ttl: Duration,
}

impl HmacTokenFactory {
    /// Create with an explicit key.
    #[must_use]
    pub fn new(key: Vec<u8>, ttl: Duration) -> Self {
        let digest = Sha256::digest(&key);
        let kid = URL_SAFE_NO_PAD.encode(&digest[..12]);
        Self { key, kid, ttl }
    }

    /// Create from configuration. An empty key yields a random one, so tokens
    /// do not survive a restart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configured key is not valid base64 or
    /// shorter than 32 bytes.
    pub fn from_config(config: &TokenConfig) -> Result<Self> {
        if config.signing_key.is_empty() {
            tracing::warn!("No token signing key configured, generated an ephemeral key");
            return Ok(Self::new(Self::generate_key(), config.ttl));
        }
        let key = STANDARD
            .decode(config.signing_key.trim())
            .map_err(|e| Error::Config(format!("token.signing_key: {e}")))?;
        if key.len() < 32 {
            return Err(Error::Config(
                "token.signing_key must be at least 32 bytes".to_string(),
            ));
        }
        Ok(Self::new(key, config.ttl))
    }

    /// Generate a random 256-bit key.
    #[must_use]
    pub fn generate_key() -> Vec<u8> {
        let random_bytes: [u8; 32] = rand::rng().random();
        random_bytes.to_vec()
    }

    fn sign(&self, input: &str) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("invalid HMAC key: {e}")))?;
        mac.update(input.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl TokenFactory for HmacTokenFactory {
    fn issue(&self, identity: &RoleIdentity) -> Result<AccessToken> {
        let iat = unix_now();
        let claims = TokenClaims {
            sub: identity.role_id.to_string(),
            iat,
            exp: iat + self.ttl.as_secs(),
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let header = ProtectedHeader {
            alg: "HS256".to_string(),
            kid: self.kid.clone(),
        };
        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(&format!("{protected}.{payload}"))?);

        let envelope = Envelope {
            protected,
            payload,
            signature,
        };
        let token = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&envelope)?);

        Ok(AccessToken { token, claims })
    }

    fn verify(&self, token: &str) -> Result<TokenClaims> {
        let malformed = |what: &str| Error::MalformedToken(format!("access token: {what}"));

        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| malformed("not base64url"))?;
        let envelope: Envelope = serde_json::from_slice(&raw).map_err(|_| malformed("not JSON"))?;

        let expected = self.sign(&format!("{}.{}", envelope.protected, envelope.payload))?;
        let provided = URL_SAFE_NO_PAD
            .decode(&envelope.signature)
            .map_err(|_| malformed("signature not base64url"))?;
        if !bool::from(expected.ct_eq(&provided)) {
            return Err(Error::InvalidSignature);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(&envelope.payload)
            .map_err(|_| malformed("payload not base64url"))?;
        let claims: TokenClaims = serde_json::from_slice(&payload)?;
        if unix_now() >= claims.exp {
            return Err(Error::TokenExpired);
        }
        Ok(claims)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
