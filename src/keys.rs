// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Deterministic per-account key derivation from the master seed.
//!
//! Addresses follow the standard BIP-44 layout `m/44'/<coin>'/0'/0/<index>`.
//! When a wallet carries per-user entropy, that entropy is mixed into the
//! seed material (HMAC-SHA512 keyed by the master seed) before derivation,
//! so the path and index alone are not enough to reconstruct the key.
//!
//! Pure computation: no I/O, no persistence. Plaintext key material only
//! exists inside the returned signer.

use alloy::signers::local::PrivateKeySigner;
use coins_bip32::{
    path::DerivationPath,
    xkeys::{Parent, XPriv},
};
use hmac::{Hmac, Mac};
use sha2::Sha512;

/// Minimum accepted master seed length (BIP-32 lower bound).
const MIN_SEED_LEN: usize = 16;
/// Maximum accepted master seed length (BIP-32 upper bound).
const MAX_SEED_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DerivationError {
    #[error("master seed is missing or malformed: {0}")]
    MalformedSeed(String),

    #[error("key derivation failed: {0}")]
    Bip32(String),

    #[error("derived key is not a valid signing key: {0}")]
    InvalidKey(String),
}

/// A key derived for one account index.
pub struct DerivedKey {
    /// Checksummed EVM address for the derived key.
    pub address: String,
    /// Signer holding the private key, used transiently for one signing step.
    pub signer: PrivateKeySigner,
    /// Full derivation path the key was produced from.
    pub derivation_path: String,
}

/// Derives account keys from the in-memory master seed.
pub struct KeyDeriver {
    master_seed: Vec<u8>,
    coin_type: u32,
}

impl KeyDeriver {
    /// Build a deriver from the decrypted master seed.
    ///
    /// Rejects seeds outside the BIP-32 length bounds and all-zero seeds, so
    /// a blank or defaulted secret can never silently produce keys.
    pub fn new(master_seed: Vec<u8>, coin_type: u32) -> Result<Self, DerivationError> {
        if master_seed.len() < MIN_SEED_LEN || master_seed.len() > MAX_SEED_LEN {
            return Err(DerivationError::MalformedSeed(format!(
                "seed must be {MIN_SEED_LEN}..={MAX_SEED_LEN} bytes, got {}",
                master_seed.len()
            )));
        }
        if master_seed.iter().all(|&b| b == 0) {
            return Err(DerivationError::MalformedSeed(
                "seed is all zeroes".to_string(),
            ));
        }
        Ok(Self {
            master_seed,
            coin_type,
        })
    }

    /// Derive the keypair and address for an account index.
    ///
    /// Deterministic: identical `(master seed, index, entropy)` inputs always
    /// yield the identical key.
    pub fn derive(
        &self,
        account_index: u32,
        entropy: Option<&[u8]>,
    ) -> Result<DerivedKey, DerivationError> {
        let seed = match entropy {
            Some(entropy) => self.mix_entropy(entropy)?,
            None => self.master_seed.clone(),
        };

        let path_str = format!("m/44'/{}'/0'/0/{}", self.coin_type, account_index);
        let path: DerivationPath = path_str
            .parse()
            .map_err(|e: coins_bip32::Bip32Error| DerivationError::Bip32(e.to_string()))?;

        let root = XPriv::root_from_seed(&seed, None)
            .map_err(|e| DerivationError::Bip32(e.to_string()))?;
        let derived = root
            .derive_path(&path)
            .map_err(|e| DerivationError::Bip32(e.to_string()))?;

        let signing_key: &k256::ecdsa::SigningKey = derived.as_ref();
        let signer = PrivateKeySigner::from_slice(&signing_key.to_bytes())
            .map_err(|e| DerivationError::InvalidKey(e.to_string()))?;
        let address = signer.address().to_string();

        Ok(DerivedKey {
            address,
            signer,
            derivation_path: path_str,
        })
    }

    /// Mix per-user entropy into the seed material.
    fn mix_entropy(&self, entropy: &[u8]) -> Result<Vec<u8>, DerivationError> {
        let mut mac = Hmac::<Sha512>::new_from_slice(&self.master_seed)
            .map_err(|e| DerivationError::MalformedSeed(e.to_string()))?;
        mac.update(entropy);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
