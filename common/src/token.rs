//! Signed identity tokens.
//!
//! Format: `v1.<base64url payload>.<base64url signature>` where the payload
//! is JSON `{uid, name, exp}` (exp in unix seconds) and the signature is
//! HMAC-SHA256 over the base64url payload text. The rest of the system only
//! ever sees the verified claims.

use anyhow::Result;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::identity::{is_valid_name, is_valid_uid};

type HmacSha256 = Hmac<Sha256>;

const VERSION: &str = "v1";

/// Default lifetime of freshly minted tokens.
pub const TOKEN_TTL_SECS: i64 = 15 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub uid: String,
    pub name: String,
    pub exp: i64,
}

/// Sign claims into the version-tagged token text.
pub fn sign(secret: &[u8], claims: &Claims) -> Result<String> {
    let payload = serde_json::to_vec(claims)?;
    let payload_b64 = base64_url::encode(&payload);
    let sig = mac_over(secret, payload_b64.as_bytes());
    Ok(format!("{VERSION}.{payload_b64}.{}", base64_url::encode(&sig)))
}

/// Mint a token for an identity with the default TTL.
pub fn mint(secret: &[u8], uid: &str, name: &str, now_s: i64) -> Result<String> {
    sign(
        secret,
        &Claims {
            uid: uid.to_owned(),
            name: name.to_owned(),
            exp: now_s + TOKEN_TTL_SECS,
        },
    )
}

/// Verify a token: version tag, signature, claim shape, expiry. Returns
/// the claims or None; callers fall back to a guest identity, so there is
/// nothing to report beyond the refusal itself.
pub fn verify(secret: &[u8], token: &str, now_s: i64) -> Option<Claims> {
    let mut parts = token.split('.');
    let (version, payload_b64, sig_b64) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || version != VERSION {
        return None;
    }
    let sig = base64_url::decode(sig_b64).ok()?;
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&sig).ok()?;

    let payload = base64_url::decode(payload_b64).ok()?;
    let claims: Claims = serde_json::from_slice(&payload).ok()?;
    if !is_valid_uid(&claims.uid) || !is_valid_name(&claims.name) || claims.exp <= now_s {
        return None;
    }
    Some(claims)
}

fn mac_over(secret: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
