use base64::Engine;
use rand::RngCore;
use shared::error::BridgeError;
use subtle::ConstantTimeEq;

/// PBKDF2-HMAC-SHA256 rounds for password hashes. Verification honours the
/// per-hash count stored in the encoded string, so this can be raised
/// without invalidating existing credentials.
pub const PBKDF2_ITERATIONS: u32 = 210_000;

const SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Hash a password into a self-describing string:
/// `pbkdf2-sha256$<iterations>$<salt_b64>$<hash_b64>`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut hash = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut hash);

    format!(
        "{SCHEME}${PBKDF2_ITERATIONS}${}${}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(salt),
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash),
    )
}

/// Verify a password against a stored hash in constant time.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, BridgeError> {
    let mut parts = stored.split('$');
    let scheme = parts.next().unwrap_or_default();
    if scheme != SCHEME {
        return Err(BridgeError::Crypto {
            source: Some(anyhow::anyhow!("unknown password hash scheme: {scheme}")),
        });
    }

    let iterations: u32 = parts
        .next()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| BridgeError::Crypto {
            source: Some(anyhow::anyhow!("malformed password hash")),
        })?;

    let decode = |part: Option<&str>| -> Result<Vec<u8>, BridgeError> {
        let raw = part.ok_or_else(|| BridgeError::Crypto {
            source: Some(anyhow::anyhow!("malformed password hash")),
        })?;
        base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(raw)
            .map_err(|e| BridgeError::Crypto {
                source: Some(anyhow::anyhow!("malformed password hash: {e}")),
            })
    };

    let salt = decode(parts.next())?;
    let expected = decode(parts.next())?;

    let mut actual = vec![0u8; expected.len().max(1)];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), &salt, iterations, &mut actual);

    Ok(actual.ct_eq(&expected).into())
}
