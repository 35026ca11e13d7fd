//! JWS compact serialization, parsing, and verification.
//!
//! Thin codec over the `jsonwebtoken` engine with the error taxonomy
//! the endpoints depend on. ECDSA signatures are IEEE P1363 fixed-width
//! `r || s` (the engine is ring-backed), never ASN.1 DER. Claim-value
//! checks beyond `exp`/`nbf` are the caller's business.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Supported JWS signing algorithms.
///
/// ES512 (P-521) is not offered: the signing engine has no P-521
/// support. RS256 and ES256 are the interoperable pair every relying
/// party gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum JwsAlgorithm {
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    HS256,
    HS384,
    HS512,
}

impl JwsAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            JwsAlgorithm::RS256 => "RS256",
            JwsAlgorithm::RS384 => "RS384",
            JwsAlgorithm::RS512 => "RS512",
            JwsAlgorithm::ES256 => "ES256",
            JwsAlgorithm::ES384 => "ES384",
            JwsAlgorithm::HS256 => "HS256",
            JwsAlgorithm::HS384 => "HS384",
            JwsAlgorithm::HS512 => "HS512",
        }
    }

    /// Parse a header `alg` value.
    pub fn parse(alg: &str) -> Result<Self, JwtError> {
        match alg {
            "RS256" => Ok(JwsAlgorithm::RS256),
            "RS384" => Ok(JwsAlgorithm::RS384),
            "RS512" => Ok(JwsAlgorithm::RS512),
            "ES256" => Ok(JwsAlgorithm::ES256),
            "ES384" => Ok(JwsAlgorithm::ES384),
            "HS256" => Ok(JwsAlgorithm::HS256),
            "HS384" => Ok(JwsAlgorithm::HS384),
            "HS512" => Ok(JwsAlgorithm::HS512),
            other => Err(JwtError::UnsupportedAlg(other.to_string())),
        }
    }

    pub(crate) fn engine_alg(self) -> Algorithm {
        match self {
            JwsAlgorithm::RS256 => Algorithm::RS256,
            JwsAlgorithm::RS384 => Algorithm::RS384,
            JwsAlgorithm::RS512 => Algorithm::RS512,
            JwsAlgorithm::ES256 => Algorithm::ES256,
            JwsAlgorithm::ES384 => Algorithm::ES384,
            JwsAlgorithm::HS256 => Algorithm::HS256,
            JwsAlgorithm::HS384 => Algorithm::HS384,
            JwsAlgorithm::HS512 => Algorithm::HS512,
        }
    }

    pub fn is_rsa(self) -> bool {
        matches!(
            self,
            JwsAlgorithm::RS256 | JwsAlgorithm::RS384 | JwsAlgorithm::RS512
        )
    }

    pub fn is_ecdsa(self) -> bool {
        matches!(self, JwsAlgorithm::ES256 | JwsAlgorithm::ES384)
    }

    pub fn is_hmac(self) -> bool {
        matches!(
            self,
            JwsAlgorithm::HS256 | JwsAlgorithm::HS384 | JwsAlgorithm::HS512
        )
    }

    /// JWK curve name for ECDSA algorithms.
    pub fn curve(self) -> Option<&'static str> {
        match self {
            JwsAlgorithm::ES256 => Some("P-256"),
            JwsAlgorithm::ES384 => Some("P-384"),
            _ => None,
        }
    }
}

impl std::fmt::Display for JwsAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec failures. Verification failures never carry sub-reasons to the
/// end user; endpoints log them and answer with a single `invalid_token`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("malformed token")]
    Malformed,

    #[error("algorithm mismatch: expected {expected}, got {got}")]
    AlgMismatch { expected: String, got: String },

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("key failure: {0}")]
    Key(String),
}

/// Decoded JOSE header fields we act on.
#[derive(Debug, Clone, Deserialize)]
pub struct ParsedHeader {
    pub alg: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub typ: Option<String>,
}

/// A structurally valid compact JWS, signature unchecked.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub header: ParsedHeader,
    pub payload: Value,
    pub signature: Vec<u8>,
}

/// Base64URL without padding (`+` → `-`, `/` → `_`).
pub fn b64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Inverse of [`b64url_encode`]; rejects padding and non-URL alphabets.
pub fn b64url_decode(input: &str) -> Result<Vec<u8>, JwtError> {
    URL_SAFE_NO_PAD.decode(input).map_err(|_| JwtError::Malformed)
}

/// Serialize and sign claims as a compact JWS.
///
/// The header is `{alg, typ: "JWT", kid?}`.
pub fn sign<T: Serialize>(
    claims: &T,
    key: &EncodingKey,
    alg: JwsAlgorithm,
    kid: Option<&str>,
) -> Result<String, JwtError> {
    let mut header = Header::new(alg.engine_alg());
    header.kid = kid.map(str::to_string);
    jsonwebtoken::encode(&header, claims, key).map_err(|e| JwtError::Key(e.to_string()))
}

/// Split a compact JWS into header, payload, and signature.
///
/// Fails with [`JwtError::Malformed`] unless there are exactly three
/// base64url components and the first two decode to JSON objects.
pub fn parse(token: &str) -> Result<ParsedToken, JwtError> {
    let mut parts = token.split('.');
    let (Some(h), Some(p), Some(s), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(JwtError::Malformed);
    };

    let header_bytes = b64url_decode(h)?;
    let payload_bytes = b64url_decode(p)?;
    let signature = b64url_decode(s)?;

    let header: ParsedHeader =
        serde_json::from_slice(&header_bytes).map_err(|_| JwtError::Malformed)?;
    let payload: Value =
        serde_json::from_slice(&payload_bytes).map_err(|_| JwtError::Malformed)?;
    if !payload.is_object() {
        return Err(JwtError::Malformed);
    }

    Ok(ParsedToken {
        header,
        payload,
        signature,
    })
}

/// Verify a compact JWS and return its header and claims.
///
/// Order: parse, algorithm policy, signature, then time claims. `exp`
/// and `nbf` are only checked when present; `iss`/`aud` and the rest
/// are the caller's to enforce.
pub fn verify(
    token: &str,
    key: &DecodingKey,
    expected_alg: Option<JwsAlgorithm>,
) -> Result<(ParsedHeader, Value), JwtError> {
    let parsed = parse(token)?;
    let alg = JwsAlgorithm::parse(&parsed.header.alg)?;
    if let Some(expected) = expected_alg
        && alg != expected
    {
        return Err(JwtError::AlgMismatch {
            expected: expected.as_str().to_string(),
            got: alg.as_str().to_string(),
        });
    }

    // Signature only; time claims are enforced below with exact
    // boundary semantics (exp <= now rejected, nbf > now rejected).
    let mut validation = Validation::new(alg.engine_alg());
    validation.leeway = 0;
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data =
        jsonwebtoken::decode::<Value>(token, key, &validation).map_err(map_engine_error)?;
    let claims = data.claims;

    let now = Utc::now().timestamp();
    if let Some(exp) = claims.get("exp").and_then(Value::as_i64)
        && now >= exp
    {
        return Err(JwtError::Expired);
    }
    if let Some(nbf) = claims.get("nbf").and_then(Value::as_i64)
        && now < nbf
    {
        return Err(JwtError::NotYetValid);
    }

    Ok((parsed.header, claims))
}

fn map_engine_error(err: jsonwebtoken::errors::Error) -> JwtError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::InvalidSignature | ErrorKind::Crypto(_) => JwtError::InvalidSignature,
        ErrorKind::ExpiredSignature => JwtError::Expired,
        ErrorKind::ImmatureSignature => JwtError::NotYetValid,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => JwtError::Malformed,
        other => JwtError::Key(format!("{other:?}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn hmac_keys() -> (EncodingKey, DecodingKey) {
        let secret = b"0123456789abcdef0123456789abcdef";
        (
            EncodingKey::from_secret(secret),
            DecodingKey::from_secret(secret),
        )
    }

    #[test]
    fn b64url_roundtrip() {
        let cases: &[&[u8]] = &[b"", b"f", b"fo", b"foo", b"foob", &[0xff, 0xfe, 0x00, 0x7f]];
        for bytes in cases {
            let encoded = b64url_encode(bytes);
            assert!(!encoded.contains('+'));
            assert!(!encoded.contains('/'));
            assert!(!encoded.contains('='));
            assert_eq!(b64url_decode(&encoded).unwrap(), bytes.to_vec());
        }
    }

    #[test]
    fn b64url_rejects_standard_alphabet() {
        assert!(b64url_decode("a+b/c=").is_err());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (enc, dec) = hmac_keys();
        let now = Utc::now().timestamp();
        let claims = json!({"sub": "user-1", "exp": now + 60, "n": 7});

        let token = sign(&claims, &enc, JwsAlgorithm::HS256, Some("k1")).unwrap();
        let (header, payload) = verify(&token, &dec, Some(JwsAlgorithm::HS256)).unwrap();

        assert_eq!(header.alg, "HS256");
        assert_eq!(header.kid.as_deref(), Some("k1"));
        assert_eq!(header.typ.as_deref(), Some("JWT"));
        assert_eq!(payload, claims);
    }

    #[test]
    fn parse_rejects_wrong_part_count() {
        assert_eq!(parse("a.b").unwrap_err(), JwtError::Malformed);
        assert_eq!(parse("a.b.c.d").unwrap_err(), JwtError::Malformed);
        assert_eq!(parse("").unwrap_err(), JwtError::Malformed);
    }

    #[test]
    fn parse_rejects_non_json_components() {
        let sig = b64url_encode(b"sig");
        let not_json = b64url_encode(b"hello");
        let header = b64url_encode(br#"{"alg":"HS256"}"#);
        assert_eq!(
            parse(&format!("{not_json}.{not_json}.{sig}")).unwrap_err(),
            JwtError::Malformed
        );
        assert_eq!(
            parse(&format!("{header}.{not_json}.{sig}")).unwrap_err(),
            JwtError::Malformed
        );
    }

    #[test]
    fn verify_rejects_alg_mismatch() {
        let (enc, dec) = hmac_keys();
        let token = sign(&json!({"sub": "x"}), &enc, JwsAlgorithm::HS256, None).unwrap();
        let err = verify(&token, &dec, Some(JwsAlgorithm::HS384)).unwrap_err();
        assert!(matches!(err, JwtError::AlgMismatch { .. }));
    }

    #[test]
    fn verify_rejects_unsupported_alg() {
        let header = b64url_encode(br#"{"alg":"none"}"#);
        let payload = b64url_encode(br#"{"sub":"x"}"#);
        let token = format!("{header}.{payload}.");
        let (_, dec) = hmac_keys();
        assert_eq!(
            verify(&token, &dec, None).unwrap_err(),
            JwtError::UnsupportedAlg("none".to_string())
        );
    }

    #[test]
    fn verify_rejects_single_byte_mutation() {
        let (enc, dec) = hmac_keys();
        let now = Utc::now().timestamp();
        let token = sign(
            &json!({"sub": "user-1", "exp": now + 60}),
            &enc,
            JwsAlgorithm::HS256,
            None,
        )
        .unwrap();

        // Flip one character in each component in turn.
        for idx in [1usize, token.find('.').unwrap() + 2, token.len() - 1] {
            let mut bytes = token.clone().into_bytes();
            bytes[idx] = if bytes[idx] == b'A' { b'B' } else { b'A' };
            let mutated = String::from_utf8(bytes).unwrap();
            assert!(verify(&mutated, &dec, Some(JwsAlgorithm::HS256)).is_err());
        }
    }

    #[test]
    fn time_bounds() {
        let (enc, dec) = hmac_keys();
        let now = Utc::now().timestamp();

        let expired = sign(&json!({"exp": now - 10}), &enc, JwsAlgorithm::HS256, None).unwrap();
        assert_eq!(
            verify(&expired, &dec, None).unwrap_err(),
            JwtError::Expired
        );

        let premature = sign(
            &json!({"exp": now + 60, "nbf": now + 30}),
            &enc,
            JwsAlgorithm::HS256,
            None,
        )
        .unwrap();
        assert_eq!(
            verify(&premature, &dec, None).unwrap_err(),
            JwtError::NotYetValid
        );

        let live = sign(
            &json!({"exp": now + 60, "nbf": now - 30}),
            &enc,
            JwsAlgorithm::HS256,
            None,
        )
        .unwrap();
        assert!(verify(&live, &dec, None).is_ok());
    }

    #[test]
    fn tokens_without_time_claims_verify() {
        let (enc, dec) = hmac_keys();
        let token = sign(&json!({"sub": "x"}), &enc, JwsAlgorithm::HS256, None).unwrap();
        assert!(verify(&token, &dec, None).is_ok());
    }

    #[test]
    fn curve_mapping() {
        assert_eq!(JwsAlgorithm::ES256.curve(), Some("P-256"));
        assert_eq!(JwsAlgorithm::ES384.curve(), Some("P-384"));
        assert_eq!(JwsAlgorithm::RS256.curve(), None);
    }
}
