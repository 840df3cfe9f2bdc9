//! WireGuard key material

use base64::engine::general_purpose;
use base64::Engine as _;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{PanelError, PanelResult};

/// A Curve25519 key pair, Base64 encoded the way `wg` prints it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private_key: general_purpose::STANDARD.encode(secret.to_bytes()),
            public_key: general_purpose::STANDARD.encode(public.as_bytes()),
        }
    }
}

/// Derive the public key of a Base64 private key
pub fn public_key_for(private_key: &str) -> PanelResult<String> {
    let bytes = general_purpose::STANDARD
        .decode(private_key.trim())
        .map_err(|e| PanelError::InvalidParameter(format!("Invalid private key: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| PanelError::InvalidParameter("Private key must be 32 bytes".to_string()))?;

    let public = PublicKey::from(&StaticSecret::from(bytes));
    Ok(general_purpose::STANDARD.encode(public.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation;

    #[test]
    fn test_generated_pair_is_consistent() {
        let pair = KeyPair::generate();
        assert!(validation::validate_key(&pair.private_key).is_ok());
        assert!(validation::validate_key(&pair.public_key).is_ok());
        assert_eq!(public_key_for(&pair.private_key).unwrap(), pair.public_key);
        assert_ne!(KeyPair::generate().private_key, pair.private_key);
    }

    #[test]
    fn test_public_key_for_rejects_garbage() {
        assert!(public_key_for("not base64!").is_err());
        assert!(public_key_for("c2hvcnQ=").is_err());
    }
}
