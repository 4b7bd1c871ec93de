use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Prefix that distinguishes opaque API tokens from JWTs in an
/// `Authorization: Bearer` header.
pub const API_TOKEN_PREFIX: &str = "hb_";

/// Characters of the token stored for display (`hb_a1b2c`).
pub const DISPLAY_PREFIX_LEN: usize = 8;

/// Generate an API token: `hb_` + base64url(24 random bytes), 35 chars,
/// URL-safe alphabet throughout.
pub fn generate_api_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    let random_part = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    format!("{API_TOKEN_PREFIX}{random_part}")
}

/// Generate an opaque refresh token: base64url(32 random bytes).
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// The short display form stored next to the hash (never enough to
/// reconstruct the token).
pub fn display_prefix(token: &str) -> String {
    token.chars().take(DISPLAY_PREFIX_LEN).collect()
}

/// Deterministic one-way hash for token storage and lookup.
///
/// No salt: tokens are randomly generated with 192+ bits of entropy and
/// never reused across systems.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let result = hasher.finalize();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(result)
}

/// Whether a bearer credential is shaped like an opaque API token (as
/// opposed to a JWT).
pub fn looks_like_api_token(bearer: &str) -> bool {
    bearer.starts_with(API_TOKEN_PREFIX)
}
