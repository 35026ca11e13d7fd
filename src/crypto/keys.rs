//! Process-wide signing key registry.
//!
//! Keys are immutable records replaced wholesale on rotation, so
//! readers never observe a torn key. Retirement stops issuance only;
//! verification keeps working with a retired key until it expires.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use parking_lot::RwLock;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::jwt::{JwsAlgorithm, b64url_encode};

/// Default key lifetime: 90 days.
const DEFAULT_KEY_LIFETIME_DAYS: i64 = 90;

/// RSA modulus size for generated keys.
const RSA_BITS: usize = 2048;

/// A signing key pair.
///
/// `private_key` is a PKCS#8 PEM (or the base64url secret for HMAC
/// algorithms); `public_key` is an SPKI PEM, empty for HMAC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub kid: String,
    pub algorithm: JwsAlgorithm,
    pub private_key: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl KeyPair {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A key pair with its prepared signing/verification material.
pub struct KeyHandle {
    pub pair: KeyPair,
    enc: EncodingKey,
    dec: DecodingKey,
}

impl KeyHandle {
    /// Build engine material from a stored pair.
    pub fn from_pair(pair: KeyPair) -> Result<Self> {
        let (enc, dec) = if pair.algorithm.is_hmac() {
            let secret = crate::crypto::jwt::b64url_decode(&pair.private_key)
                .map_err(|e| anyhow::anyhow!("invalid HMAC secret encoding: {e}"))?;
            (
                EncodingKey::from_secret(&secret),
                DecodingKey::from_secret(&secret),
            )
        } else if pair.algorithm.is_rsa() {
            (
                EncodingKey::from_rsa_pem(pair.private_key.as_bytes())
                    .context("invalid RSA private key PEM")?,
                DecodingKey::from_rsa_pem(pair.public_key.as_bytes())
                    .context("invalid RSA public key PEM")?,
            )
        } else {
            (
                EncodingKey::from_ec_pem(pair.private_key.as_bytes())
                    .context("invalid EC private key PEM")?,
                DecodingKey::from_ec_pem(pair.public_key.as_bytes())
                    .context("invalid EC public key PEM")?,
            )
        };
        Ok(Self { pair, enc, dec })
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.enc
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.dec
    }
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHandle")
            .field("kid", &self.pair.kid)
            .field("algorithm", &self.pair.algorithm)
            .finish()
    }
}

/// RFC 7517 JSON Web Key (public members only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub public_key_use: String,
    pub alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// RFC 7517 key set document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Process-global key store: concurrent readers, serialized writers.
#[derive(Debug, Default)]
pub struct KeyManager {
    keys: RwLock<HashMap<String, Arc<KeyHandle>>>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a usable signing key exists.
    ///
    /// Returns the most recent active, unexpired key; generates a fresh
    /// RS256 pair with the default lifetime when none exists.
    pub fn initialize(&self) -> Result<Arc<KeyHandle>> {
        if let Some(existing) = self.most_recent_active() {
            return Ok(existing);
        }
        let handle = self.rotate(JwsAlgorithm::RS256, false)?;
        info!(kid = %handle.pair.kid, "generated initial signing key");
        Ok(handle)
    }

    /// Mint a new key; optionally retire all other active keys of the
    /// same algorithm.
    pub fn rotate(&self, alg: JwsAlgorithm, retire_old: bool) -> Result<Arc<KeyHandle>> {
        let handle = Arc::new(generate(alg)?);

        let mut keys = self.keys.write();
        if retire_old {
            let retire: Vec<String> = keys
                .values()
                .filter(|h| h.pair.algorithm == alg && h.pair.is_active)
                .map(|h| h.pair.kid.clone())
                .collect();
            for kid in retire {
                let Some(old) = keys.get(&kid).cloned() else {
                    continue;
                };
                let mut pair = old.pair.clone();
                pair.is_active = false;
                let retired = Arc::new(KeyHandle {
                    pair,
                    enc: old.enc.clone(),
                    dec: old.dec.clone(),
                });
                keys.insert(kid.clone(), retired);
                info!(kid = %kid, "retired signing key");
            }
        }
        keys.insert(handle.pair.kid.clone(), Arc::clone(&handle));
        info!(kid = %handle.pair.kid, alg = %alg, "rotated in new signing key");
        Ok(handle)
    }

    /// Insert an externally built pair (startup seeding, tests).
    pub fn insert(&self, pair: KeyPair) -> Result<Arc<KeyHandle>> {
        let handle = Arc::new(KeyHandle::from_pair(pair)?);
        self.keys
            .write()
            .insert(handle.pair.kid.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Look up a key for signing: active and unexpired only.
    pub fn get_active(&self, kid: &str) -> Option<Arc<KeyHandle>> {
        let now = Utc::now();
        self.keys
            .read()
            .get(kid)
            .filter(|h| h.pair.is_active && !h.pair.is_expired(now))
            .cloned()
    }

    /// Look up a key for verification: unexpired, retired allowed.
    pub fn get_for_verification(&self, kid: &str) -> Option<Arc<KeyHandle>> {
        let now = Utc::now();
        self.keys
            .read()
            .get(kid)
            .filter(|h| !h.pair.is_expired(now))
            .cloned()
    }

    /// The most recent active, unexpired key of an algorithm.
    pub fn latest_active(&self, alg: JwsAlgorithm) -> Option<Arc<KeyHandle>> {
        let now = Utc::now();
        self.keys
            .read()
            .values()
            .filter(|h| {
                h.pair.algorithm == alg && h.pair.is_active && !h.pair.is_expired(now)
            })
            .max_by_key(|h| h.pair.created_at)
            .cloned()
    }

    /// Export every active, unexpired public key as RFC 7517 JWKs.
    ///
    /// HMAC keys are symmetric and never published.
    pub fn jwks(&self) -> JwkSet {
        let now = Utc::now();
        let mut keys: Vec<Jwk> = self
            .keys
            .read()
            .values()
            .filter(|h| h.pair.is_active && !h.pair.is_expired(now))
            .filter_map(|h| export_jwk(&h.pair))
            .collect();
        keys.sort_by(|a, b| a.kid.cmp(&b.kid));
        JwkSet { keys }
    }

    /// Drop expired keys; returns how many were purged.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut keys = self.keys.write();
        let before = keys.len();
        keys.retain(|_, h| !h.pair.is_expired(now));
        before - keys.len()
    }

    fn most_recent_active(&self) -> Option<Arc<KeyHandle>> {
        let now = Utc::now();
        self.keys
            .read()
            .values()
            .filter(|h| h.pair.is_active && !h.pair.is_expired(now))
            .max_by_key(|h| h.pair.created_at)
            .cloned()
    }
}

/// Generate a fresh key pair for `alg`.
fn generate(alg: JwsAlgorithm) -> Result<KeyHandle> {
    let now = Utc::now();
    let (private_key, public_key) = match alg {
        JwsAlgorithm::RS256 | JwsAlgorithm::RS384 | JwsAlgorithm::RS512 => {
            use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
            let private = rsa::RsaPrivateKey::new(&mut OsRng, RSA_BITS)
                .context("RSA key generation failed")?;
            let public = rsa::RsaPublicKey::from(&private);
            let private_pem = private
                .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
                .context("RSA private key encoding failed")?;
            let public_pem = public
                .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
                .context("RSA public key encoding failed")?;
            (private_pem.to_string(), public_pem)
        }
        JwsAlgorithm::ES256 => {
            use p256::pkcs8::{EncodePrivateKey, EncodePublicKey};
            let secret = p256::SecretKey::random(&mut OsRng);
            let private_pem = secret
                .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
                .context("P-256 private key encoding failed")?;
            let public_pem = secret
                .public_key()
                .to_public_key_pem(p256::pkcs8::LineEnding::LF)
                .context("P-256 public key encoding failed")?;
            (private_pem.to_string(), public_pem)
        }
        JwsAlgorithm::ES384 => {
            use p384::pkcs8::{EncodePrivateKey, EncodePublicKey};
            let secret = p384::SecretKey::random(&mut OsRng);
            let private_pem = secret
                .to_pkcs8_pem(p384::pkcs8::LineEnding::LF)
                .context("P-384 private key encoding failed")?;
            let public_pem = secret
                .public_key()
                .to_public_key_pem(p384::pkcs8::LineEnding::LF)
                .context("P-384 public key encoding failed")?;
            (private_pem.to_string(), public_pem)
        }
        JwsAlgorithm::HS256 | JwsAlgorithm::HS384 | JwsAlgorithm::HS512 => {
            let len = match alg {
                JwsAlgorithm::HS256 => 32,
                JwsAlgorithm::HS384 => 48,
                _ => 64,
            };
            let mut secret = vec![0u8; len];
            OsRng.fill_bytes(&mut secret);
            (b64url_encode(&secret), String::new())
        }
    };

    KeyHandle::from_pair(KeyPair {
        kid: Uuid::new_v4().to_string(),
        algorithm: alg,
        private_key,
        public_key,
        created_at: now,
        expires_at: now + Duration::days(DEFAULT_KEY_LIFETIME_DAYS),
        is_active: true,
    })
}

/// Project the public half of a pair as a JWK. HMAC pairs yield none.
fn export_jwk(pair: &KeyPair) -> Option<Jwk> {
    if pair.algorithm.is_rsa() {
        match rsa_components(&pair.public_key) {
            Ok((n, e)) => Some(Jwk {
                kty: "RSA".to_string(),
                kid: pair.kid.clone(),
                public_key_use: "sig".to_string(),
                alg: pair.algorithm.as_str().to_string(),
                n: Some(n),
                e: Some(e),
                crv: None,
                x: None,
                y: None,
            }),
            Err(e) => {
                tracing::warn!(kid = %pair.kid, error = %e, "skipping unexportable RSA key");
                None
            }
        }
    } else if pair.algorithm.is_ecdsa() {
        match ec_components(pair.algorithm, &pair.public_key) {
            Ok((x, y)) => Some(Jwk {
                kty: "EC".to_string(),
                kid: pair.kid.clone(),
                public_key_use: "sig".to_string(),
                alg: pair.algorithm.as_str().to_string(),
                n: None,
                e: None,
                crv: pair.algorithm.curve().map(str::to_string),
                x: Some(x),
                y: Some(y),
            }),
            Err(e) => {
                tracing::warn!(kid = %pair.kid, error = %e, "skipping unexportable EC key");
                None
            }
        }
    } else {
        None
    }
}

fn rsa_components(public_pem: &str) -> Result<(String, String)> {
    use rsa::pkcs8::DecodePublicKey;
    use rsa::traits::PublicKeyParts;
    let key = rsa::RsaPublicKey::from_public_key_pem(public_pem)
        .context("invalid RSA public key PEM")?;
    Ok((
        b64url_encode(&key.n().to_bytes_be()),
        b64url_encode(&key.e().to_bytes_be()),
    ))
}

fn ec_components(alg: JwsAlgorithm, public_pem: &str) -> Result<(String, String)> {
    match alg {
        JwsAlgorithm::ES256 => {
            use p256::elliptic_curve::sec1::ToEncodedPoint;
            use p256::pkcs8::DecodePublicKey;
            let key = p256::PublicKey::from_public_key_pem(public_pem)
                .context("invalid P-256 public key PEM")?;
            let point = key.to_encoded_point(false);
            match (point.x(), point.y()) {
                (Some(x), Some(y)) => {
                    Ok((b64url_encode(x.as_slice()), b64url_encode(y.as_slice())))
                }
                _ => bail!("P-256 point missing coordinates"),
            }
        }
        JwsAlgorithm::ES384 => {
            use p384::elliptic_curve::sec1::ToEncodedPoint;
            use p384::pkcs8::DecodePublicKey;
            let key = p384::PublicKey::from_public_key_pem(public_pem)
                .context("invalid P-384 public key PEM")?;
            let point = key.to_encoded_point(false);
            match (point.x(), point.y()) {
                (Some(x), Some(y)) => {
                    Ok((b64url_encode(x.as_slice()), b64url_encode(y.as_slice())))
                }
                _ => bail!("P-384 point missing coordinates"),
            }
        }
        _ => bail!("not an ECDSA algorithm"),
    }
}
