//! Key material for peers, networks and devices

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{Rng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::types::Settings;

/// Prefix carried by every device capability token
pub const DEVICE_API_KEY_PREFIX: &str = "device-api-";
/// Prefix carried by every service token
pub const SERVICE_API_KEY_PREFIX: &str = "service-api-";

/// WireGuard key pair, base64 encoded
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);

        Self {
            private_key: BASE64.encode(secret.as_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }

    /// Rebuild a pair from an existing base64 private key
    pub fn from_private_key(private_key_b64: &str) -> Result<Self, &'static str> {
        let bytes = BASE64
            .decode(private_key_b64)
            .map_err(|_| "Invalid base64")?;

        let key_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "Private key must be 32 bytes")?;

        let secret = StaticSecret::from(key_bytes);
        let public = PublicKey::from(&secret);

        Ok(Self {
            private_key: private_key_b64.to_string(),
            public_key: BASE64.encode(public.as_bytes()),
        })
    }
}

/// Make sure a peer's settings carry usable keys.
///
/// A public key without a private key means the client generated its own
/// pair and keeps the secret locally. A supplied private key is kept and
/// its public key derived. Anything else gets a fresh pair.
/// Returns true when new keys were generated.
pub fn ensure_peer_keys(settings: &mut Settings) -> bool {
    if settings.private_key.is_empty() && !settings.public_key.is_empty() {
        tracing::info!("client has already generated a key pair");
        return false;
    }

    if !settings.private_key.is_empty() {
        match KeyPair::from_private_key(&settings.private_key) {
            Ok(pair) => {
                settings.public_key = pair.public_key;
                return false;
            }
            Err(e) => tracing::warn!("discarding supplied private key: {}", e),
        }
    }

    let pair = KeyPair::generate();
    settings.private_key = pair.private_key;
    settings.public_key = pair.public_key;
    true
}

/// Random 32-byte preshared key
pub fn generate_preshared_key() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    BASE64.encode(key)
}

fn random_token(prefix: &str) -> String {
    const CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let token: String = (0..32)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{}{}", prefix, token)
}

/// Device capability token: `device-api-` followed by 32 alphanumerics
pub fn generate_api_key() -> String {
    random_token(DEVICE_API_KEY_PREFIX)
}

pub fn generate_service_api_key() -> String {
    random_token(SERVICE_API_KEY_PREFIX)
}
