//! HMAC-signed bearer tokens.
//!
//! Token minting lives with the account system; this module verifies the
//! `user_id.expiry.mac` shape those tokens carry. `issue` exists for the
//! CLI's local development mode and for tests.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use proto::{AuthError, UserId};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Verifier (and development-mode issuer) for session tokens.
pub struct AuthTokens {
    secret: Vec<u8>,
}

impl AuthTokens {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mint a token for a user, valid for `ttl`.
    pub fn issue(&self, user_id: UserId, ttl: Duration) -> String {
        let expiry = unix_now().saturating_add(ttl.as_secs() as i64);
        let mac = self.mac_for(user_id, expiry);
        format!("{user_id}.{expiry}.{}", hex::encode(mac))
    }

    /// Verify a token and return the user id it was minted for.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let mut parts = token.split('.');
        let (user_part, expiry_part, mac_part) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(u), Some(e), Some(m), None) => (u, e, m),
                _ => return Err(AuthError::Malformed),
            };

        let user_id: UserId = user_part.parse().map_err(|_| AuthError::Malformed)?;
        let expiry: i64 = expiry_part.parse().map_err(|_| AuthError::Malformed)?;
        let mac = hex::decode(mac_part).map_err(|_| AuthError::Malformed)?;

        let mut verifier = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        verifier.update(format!("{user_id}.{expiry}").as_bytes());
        verifier
            .verify_slice(&mac)
            .map_err(|_| AuthError::BadSignature)?;

        if expiry < unix_now() {
            return Err(AuthError::Expired);
        }

        Ok(user_id)
    }

    fn mac_for(&self, user_id: UserId, expiry: i64) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(format!("{user_id}.{expiry}").as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
