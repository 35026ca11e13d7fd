//! Token cryptography: the JWS codec and the process-wide key registry.

pub mod jwt;
pub mod keys;

pub use jwt::{JwsAlgorithm, JwtError, ParsedToken, b64url_decode, b64url_encode};
pub use keys::{Jwk, JwkSet, KeyHandle, KeyManager, KeyPair};
