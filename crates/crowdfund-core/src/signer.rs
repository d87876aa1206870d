use std::{fmt, sync::Arc};

use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::{
    error::ClientError,
    record::{normalize_address, Address},
};

/// The wallet's "sign" capability. Implementations are supplied from
/// outside the core and only ever borrowed.
pub trait Signer: Send + Sync {
    fn address(&self) -> &str;
    fn public_key(&self) -> [u8; 32];
    fn sign(&self, message: &[u8]) -> [u8; 64];
}

/// Account address owned by an ed25519 public key.
pub fn address_from_public_key(public_key: &[u8; 32]) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hasher.update([0u8]); // single-key scheme tag
    format!("0x{}", hex::encode(hasher.finalize()))
}

pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_strict(message, &signature).is_ok()
}

/// Local ed25519 key acting as a wallet.
#[derive(Clone)]
pub struct WalletSigner {
    key: SigningKey,
    address: Address,
}

impl WalletSigner {
    pub fn generate() -> Self {
        Self::from_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self::from_key(SigningKey::from_bytes(secret))
    }

    /// 32-byte secret as 64 hex characters (optional `0x`).
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, ClientError> {
        let trimmed = secret_hex.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(trimmed)
            .map_err(|e| ClientError::InvalidInput(format!("secret key hex: {e}")))?;
        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            ClientError::InvalidInput(format!(
                "secret key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(&secret))
    }

    fn from_key(key: SigningKey) -> Self {
        let address = address_from_public_key(key.verifying_key().as_bytes());
        Self { key, address }
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }
}

impl fmt::Debug for WalletSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Signer for WalletSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

/// Who is looking and, optionally, who can sign. Passed explicitly into
/// every operation that needs either.
#[derive(Clone, Default)]
pub struct Session {
    viewer: Option<Address>,
    signer: Option<Arc<dyn Signer>>,
}

impl Session {
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn connected(signer: Arc<dyn Signer>) -> Self {
        Self {
            viewer: Some(signer.address().to_string()),
            signer: Some(signer),
        }
    }

    /// Read-only identity, no signing capability.
    pub fn watching(viewer: &str) -> Result<Self, ClientError> {
        Ok(Self {
            viewer: Some(normalize_address(viewer)?),
            signer: None,
        })
    }

    pub fn identity(&self) -> Option<&str> {
        self.viewer.as_deref()
    }

    pub fn signer(&self) -> Option<&dyn Signer> {
        self.signer.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.signer.is_some()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("viewer", &self.viewer)
            .field("connected", &self.is_connected())
            .finish()
    }
}
