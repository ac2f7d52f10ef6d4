//! Key material of the notary.
//!
//! The notary signs every main chain transaction with a single secp256k1 key. The address derived from it is the
//! identity the sharding manager contract knows the notary by, so it is fixed for the lifetime of the process.

use std::fmt;

use alloy::{
    primitives::{Address, B256},
    signers::local::PrivateKeySigner,
};
use anyhow::{Result, anyhow};

/// The secret key of a notary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("secret key must be 32 bytes, got {}", bytes.len()))?;
        // Reject scalars which are not valid secp256k1 keys up front, rather than on first use.
        PrivateKeySigner::from_bytes(&B256::from(bytes))?;
        Ok(SecretKey { bytes })
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn signer(&self) -> PrivateKeySigner {
        PrivateKeySigner::from_bytes(&B256::from(self.bytes))
            .expect("key was validated on construction")
    }

    /// The notary identity corresponding to this key.
    pub fn address(&self) -> Address {
        self.signer().address()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
