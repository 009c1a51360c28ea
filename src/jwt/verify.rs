//! JWT signature and time-claim verification against a cached key set.
//!
//! 1. Decode the header (unverified) for `alg` and `kid`.
//! 2. Reject algorithms outside RS256/RS384/RS512.
//! 3. Select candidate keys: the key with the header's `kid`, or every RSA key
//!    when the header has none.
//! 4. Verify the signature, `exp` (mandatory) and `nbf` with the configured leeway.
//!
//! A signature failure against the cached keys triggers one refresh and one
//! retry. A second failure is final.

use std::sync::Arc;
use std::time::Duration;

use authn_types::Webservice;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::claims::DecodedToken;
use super::key_cache::{CachedKeySet, SigningKeyResolver};
use super::signing_key::SigningKeyConfig;
use crate::{Error, Result};

/// Signing algorithms accepted for JWT authentication.
pub const SUPPORTED_ALGORITHMS: [Algorithm; 3] = [Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Claims that must be present in every token.
pub const MANDATORY_CLAIMS: [&str; 1] = ["exp"];

/// Verify `token` against `jwks`.
///
/// # Errors
///
/// [`Error::MalformedToken`], [`Error::UnsupportedAlgorithm`],
/// [`Error::UnknownKeyId`], [`Error::InvalidSignature`], [`Error::TokenExpired`],
/// [`Error::TokenNotYetValid`] or [`Error::MissingMandatoryClaim`].
pub fn verify_token(token: &str, jwks: &JwkSet, leeway: Duration) -> Result<DecodedToken> {
    let header = jsonwebtoken::decode_header(token).map_err(|e| Error::MalformedToken(e.to_string()))?;
    if !SUPPORTED_ALGORITHMS.contains(&header.alg) {
        warn!(alg = ?header.alg, "Rejected token signed with unsupported algorithm");
        return Err(Error::UnsupportedAlgorithm(format!("{:?}", header.alg)));
    }

    let keys = candidate_keys(jwks, header.kid.as_deref())?;
    let validation = build_validation(&header, leeway);

    for key in &keys {
        match jsonwebtoken::decode::<Map<String, Value>>(token, key, &validation) {
            Ok(data) => {
                debug!(kid = ?header.kid, alg = ?header.alg, "Token signature verified");
                return Ok(DecodedToken::from_verified(data.claims));
            }
            Err(e) if matches!(e.kind(), JwtErrorKind::InvalidSignature) => {}
            Err(e) => return Err(map_jwt_error(&e)),
        }
    }
    Err(Error::InvalidSignature)
}

/// Verify against the cached keys of `webservice`, refreshing once on a key
/// mismatch. Returns the token and the key set that verified it.
///
/// # Errors
///
/// As [`verify_token`], plus key-fetch and refresh-limit errors.
pub async fn verify_with_refresh(
    resolver: &SigningKeyResolver,
    webservice: &Webservice,
    config: &SigningKeyConfig,
    token: &str,
    leeway: Duration,
) -> Result<(DecodedToken, Arc<CachedKeySet>)> {
    let cached = resolver.resolve(webservice, config).await?;
    match verify_token(token, &cached.keys.jwks, leeway) {
        Ok(decoded) => Ok((decoded, cached)),
        Err(e) if e.is_key_mismatch() => {
            debug!(webservice = %webservice, error = %e, "Verification failed against cached keys, refreshing");
            let refreshed = resolver.refresh(webservice, config, &cached).await?;
            let decoded = verify_token(token, &refreshed.keys.jwks, leeway)?;
            Ok((decoded, refreshed))
        }
        Err(e) => Err(e),
    }
}

/// Keys to try for `kid`.
fn candidate_keys(jwks: &JwkSet, kid: Option<&str>) -> Result<Vec<DecodingKey>> {
    let keys: Vec<DecodingKey> = jwks
        .keys
        .iter()
        .filter(|jwk| kid.is_none() || jwk.common.key_id.as_deref() == kid)
        .filter_map(|jwk| match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            _ => None,
        })
        .collect();

    match (kid, keys.is_empty()) {
        (Some(kid), true) => Err(Error::UnknownKeyId(kid.to_string())),
        (None, true) => Err(Error::InvalidSignature),
        _ => Ok(keys),
    }
}

fn build_validation(header: &Header, leeway: Duration) -> Validation {
    let mut v = Validation::new(header.alg);
    v.leeway = leeway.as_secs();
    v.validate_exp = true;
    v.validate_nbf = true;
    // `aud` and `iss` are checked against webservice configuration afterwards.
    v.validate_aud = false;
    v.set_required_spec_claims(&MANDATORY_CLAIMS);
    v
}

fn map_jwt_error(e: &jsonwebtoken::errors::Error) -> Error {
    match e.kind() {
        JwtErrorKind::ExpiredSignature => Error::TokenExpired,
        JwtErrorKind::ImmatureSignature => Error::TokenNotYetValid,
        JwtErrorKind::InvalidSignature => Error::InvalidSignature,
        JwtErrorKind::MissingRequiredClaim(claim) => Error::MissingMandatoryClaim(claim.clone()),
        JwtErrorKind::InvalidAlgorithm => Error::UnsupportedAlgorithm(e.to_string()),
        _ => Error::MalformedToken(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, encode};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    const PRIMARY_KEY: &str = include_str!("../../tests/fixtures/primary_key.pem");
    const ROTATED_KEY: &str = include_str!("../../tests/fixtures/rotated_key.pem");
    const PRIMARY_JWKS: &str = include_str!("../../tests/fixtures/primary.jwks.json");

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn sign(pem: &str, kid: Option<&str>, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_string);
        encode(&header, claims, &EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap()).unwrap()
    }

    fn jwks() -> JwkSet {
        serde_json::from_str(PRIMARY_JWKS).unwrap()
    }

    #[test]
    fn valid_token_yields_claims() {
        // GIVEN: a token signed by the published key
        let token = sign(PRIMARY_KEY, Some("primary"), &json!({"sub": "ci", "exp": now() + 300}));

        // WHEN
        let decoded = verify_token(&token, &jwks(), Duration::from_secs(60)).unwrap();

        // THEN
        assert_eq!(decoded.lookup_string("sub").as_deref(), Some("ci"));
    }

    #[test]
    fn token_without_kid_tries_every_key() {
        let token = sign(PRIMARY_KEY, None, &json!({"sub": "ci", "exp": now() + 300}));
        assert!(verify_token(&token, &jwks(), Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn unknown_kid_is_a_key_mismatch() {
        let token = sign(ROTATED_KEY, Some("rotated"), &json!({"exp": now() + 300}));
        let err = verify_token(&token, &jwks(), Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, Error::UnknownKeyId(ref kid) if kid == "rotated"));
        assert!(err.is_key_mismatch());
    }

    #[test]
    fn wrong_key_under_known_kid_is_invalid_signature() {
        let token = sign(ROTATED_KEY, Some("primary"), &json!({"exp": now() + 300}));
        let err = verify_token(&token, &jwks(), Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature));
    }

    #[test]
    fn exp_is_mandatory() {
        let token = sign(PRIMARY_KEY, Some("primary"), &json!({"sub": "ci"}));
        let err = verify_token(&token, &jwks(), Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, Error::MissingMandatoryClaim(ref c) if c == "exp"));
    }

    #[test]
    fn expired_and_immature_tokens_are_rejected() {
        let expired = sign(PRIMARY_KEY, Some("primary"), &json!({"exp": now() - 3600}));
        let immature = sign(
            PRIMARY_KEY,
            Some("primary"),
            &json!({"exp": now() + 7200, "nbf": now() + 3600}),
        );
        assert!(matches!(
            verify_token(&expired, &jwks(), Duration::from_secs(60)),
            Err(Error::TokenExpired)
        ));
        assert!(matches!(
            verify_token(&immature, &jwks(), Duration::from_secs(60)),
            Err(Error::TokenNotYetValid)
        ));
    }

    #[test]
    fn leeway_tolerates_small_skew() {
        let token = sign(PRIMARY_KEY, Some("primary"), &json!({"exp": now() - 10}));
        assert!(verify_token(&token, &jwks(), Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn hmac_tokens_are_unsupported() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({"exp": now() + 300}),
            &EncodingKey::from_secret(b"shared"),
        )
        .unwrap();
        assert!(matches!(
            verify_token(&token, &jwks(), Duration::from_secs(60)),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            verify_token("not.a.jwt", &jwks(), Duration::from_secs(60)),
            Err(Error::MalformedToken(_))
        ));
    }
}
