//! Token Verifier/Signer.
//!
//! A thin wrapper over `jsonwebtoken`: mint short-lived bearer tokens and
//! verify ones presented back to the server. Deliberately ignorant of
//! sessions, revocation or transport — those are separate components that
//! call into this one.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Claims carried by every token this crate mints.
///
/// `id`, `iat`, `exp`, `jti` and `dur` are the fields the wire contract
/// names explicitly; anything else the caller attached rides along in
/// `extra` via `#[serde(flatten)]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenClaims {
    /// Subject identity (user id, client id, ...).
    pub id: String,
    /// Issued-at, Unix seconds.
    pub iat: i64,
    /// Expiry, Unix seconds.
    pub exp: i64,
    /// Refresh counter: `0` on a first-issued authorization-code token,
    /// incremented by one on every subsequent refresh.
    pub jti: i64,
    /// Advisory seconds until the client should refresh, mirrors
    /// `tokenRefreshIntervalInMins * 60`. Not the same as `exp - iat`.
    pub dur: i64,
    /// Caller-supplied claims beyond the fixed fields above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenClaims {
    /// Whether `exp` has passed relative to the current time.
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.exp
    }

    /// Whether this is a first-issued authorization-code token.
    pub fn is_auth_code(&self) -> bool {
        self.jti == 0
    }
}

/// Signs and verifies bearer tokens against a single HMAC secret.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl TokenCodec {
    /// Builds a codec from a shared secret. `HS256` is used throughout:
    /// the wire contract does not call for asymmetric signing, and a
    /// single server process is both issuer and verifier.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();

        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret.as_bytes())),
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation,
        }
    }

    /// Mints a new authorization-code token for `id` (`jti = 0`), valid for
    /// `expires_in_secs` seconds.
    pub fn sign_code(
        &self,
        id: &str,
        expires_in_secs: i64,
        extra: Map<String, Value>,
    ) -> Result<(String, TokenClaims)> {
        self.sign(id, 0, expires_in_secs, expires_in_secs, extra)
    }

    /// Mints a token with an explicit `jti`, `expires_in_secs` lifetime and
    /// advisory `dur_secs` hint, with `extra` merged into the claim set.
    /// `iat` is always the current time; `exp = iat + expires_in_secs`.
    pub fn sign(
        &self,
        id: &str,
        jti: i64,
        expires_in_secs: i64,
        dur_secs: i64,
        extra: Map<String, Value>,
    ) -> Result<(String, TokenClaims)> {
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            id: id.to_string(),
            iat: now,
            exp: now + expires_in_secs,
            jti,
            dur: dur_secs,
            extra,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok((token, claims))
    }

    /// Verifies `token`'s signature and expiry, returning its claims.
    ///
    /// Any failure (bad signature, malformed structure, expired `exp`) is
    /// collapsed to [`Error::InvalidToken`] — callers should not branch on
    /// the underlying `jsonwebtoken` error variant.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| Error::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new("test-secret-at-least-this-long")
    }

    #[test]
    fn sign_then_verify_roundtrips_claims() {
        let codec = codec();
        let (token, signed) = codec.sign("user-1", 1, 300, 300, Map::new()).unwrap();
        let verified = codec.verify(&token).unwrap();
        assert_eq!(verified.id, "user-1");
        assert_eq!(verified.jti, signed.jti);
        assert_eq!(verified.dur, 300);
    }

    #[test]
    fn sign_code_mints_jti_zero() {
        let codec = codec();
        let (_, claims) = codec.sign_code("user-1", 5, Map::new()).unwrap();
        assert_eq!(claims.jti, 0);
        assert!(claims.is_auth_code());
    }

    #[test]
    fn extra_claims_survive_roundtrip() {
        let codec = codec();
        let mut extra = Map::new();
        extra.insert("origin".to_string(), Value::String("tenant-a".to_string()));
        let (token, _) = codec.sign_code("user-1", 300, extra).unwrap();
        let verified = codec.verify(&token).unwrap();
        assert_eq!(
            verified.extra.get("origin").and_then(Value::as_str),
            Some("tenant-a")
        );
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let codec = codec();
        let (mut token, _) = codec.sign_code("user-1", 300, Map::new()).unwrap();
        token.push_str("tamper");
        assert!(matches!(codec.verify(&token), Err(Error::InvalidToken)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let codec_a = TokenCodec::new("secret-a-long-enough");
        let codec_b = TokenCodec::new("secret-b-long-enough");
        let (token, _) = codec_a.sign_code("user-1", 300, Map::new()).unwrap();
        assert!(matches!(codec_b.verify(&token), Err(Error::InvalidToken)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let codec = codec();
        let (token, _) = codec.sign_code("user-1", -1, Map::new()).unwrap();
        assert!(matches!(codec.verify(&token), Err(Error::InvalidToken)));
    }

    #[test]
    fn is_expired_reflects_exp_claim() {
        let codec = codec();
        let (_, claims) = codec.sign_code("user-1", -1, Map::new()).unwrap();
        assert!(claims.is_expired());
    }
}
