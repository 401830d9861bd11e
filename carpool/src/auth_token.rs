//! Bearer access tokens for the HTTP API: an HMAC-signed, base64url-encoded
//! `{user_id, exp}` pair, same signing primitive `webhook::verify_signature`
//! uses for PSP deliveries rather than pulling in a JWT crate for a claim
//! set this small. `Config::jwt_secret`/`access_ttl` drive issuance; session
//! and refresh-token lifecycle belongs to the separate auth aggregate, not
//! this crate.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::UserId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum AuthTokenError {
    #[error("malformed access token")]
    Malformed,
    #[error("access token signature is invalid")]
    BadSignature,
    #[error("access token has expired")]
    Expired,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Claims {
    user_id: UserId,
    exp: i64,
}

fn mac(secret: &str) -> HmacSha256 {
    #[allow(clippy::expect_used)]
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length")
}

/// Issues an access token for `user_id`, valid until `now + ttl`.
#[must_use]
pub fn issue(secret: &str, user_id: UserId, ttl: std::time::Duration, now: chrono::DateTime<chrono::Utc>) -> String {
    let exp = (now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(15))).timestamp();
    let claims = Claims { user_id, exp };
    #[allow(clippy::unwrap_used)]
    let payload = serde_json::to_vec(&claims).unwrap();
    let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);
    let mut signer = mac(secret);
    signer.update(payload_b64.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(signer.finalize().into_bytes());
    format!("{payload_b64}.{signature}")
}

/// Verifies an access token and returns the user it was issued for.
///
/// # Errors
///
/// Returns `AuthTokenError::BadSignature` if the signature doesn't match,
/// `AuthTokenError::Malformed` if the token isn't well-formed, or
/// `AuthTokenError::Expired` if `now` is past the token's `exp`.
pub fn verify(secret: &str, token: &str, now: chrono::DateTime<chrono::Utc>) -> Result<UserId, AuthTokenError> {
    let (payload_b64, signature_b64) = token.split_once('.').ok_or(AuthTokenError::Malformed)?;
    let signature = URL_SAFE_NO_PAD.decode(signature_b64).map_err(|_| AuthTokenError::Malformed)?;
    let mut verifier = mac(secret);
    verifier.update(payload_b64.as_bytes());
    verifier.verify_slice(&signature).map_err(|_| AuthTokenError::BadSignature)?;

    let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthTokenError::Malformed)?;
    let claims: Claims = serde_json::from_slice(&payload).map_err(|_| AuthTokenError::Malformed)?;
    if now.timestamp() > claims.exp {
        return Err(AuthTokenError::Expired);
    }
    Ok(claims.user_id)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_back_to_the_same_user() {
        let now = chrono::Utc::now();
        let user_id = UserId::new();
        let token = issue("secret", user_id, std::time::Duration::from_secs(900), now);
        assert_eq!(verify("secret", &token, now).unwrap(), user_id);
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = chrono::Utc::now();
        let user_id = UserId::new();
        let token = issue("secret", user_id, std::time::Duration::from_secs(1), now);
        let err = verify("secret", &token, now + chrono::Duration::seconds(2)).unwrap_err();
        assert!(matches!(err, AuthTokenError::Expired));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let now = chrono::Utc::now();
        let token = issue("secret", UserId::new(), std::time::Duration::from_secs(900), now);
        let err = verify("different-secret", &token, now).unwrap_err();
        assert!(matches!(err, AuthTokenError::BadSignature));
    }
}
