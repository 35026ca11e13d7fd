//! PKCE challenge verification (RFC 7636).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Verify a code verifier against the stored challenge.
///
/// `S256` checks `base64url(sha256(verifier)) == challenge`; `plain`
/// checks direct equality. Any other method fails. Comparisons are
/// constant-time.
pub fn verify_pkce(code_challenge: &str, method: &str, code_verifier: &str) -> bool {
    match method {
        "S256" => {
            let digest = Sha256::digest(code_verifier.as_bytes());
            let computed = URL_SAFE_NO_PAD.encode(digest.as_slice());
            computed.as_bytes().ct_eq(code_challenge.as_bytes()).into()
        }
        "plain" => code_verifier.as_bytes().ct_eq(code_challenge.as_bytes()).into(),
        _ => false,
    }
}

/// Compute the S256 challenge for a verifier (federated sign-in uses
/// this on the client side of the exchange).
pub fn s256_challenge(code_verifier: &str) -> String {
    let digest = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest.as_slice())
}
