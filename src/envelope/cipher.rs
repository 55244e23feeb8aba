//! AES-256-CBC primitives with constant-time padding and digest checks.

use aes::Aes256;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::{ConstantTimeEq, ConstantTimeGreater, ConstantTimeLess};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// A 256-bit data encryption key, zeroized on drop.
pub struct DataKey(Zeroizing<[u8; KEY_LEN]>);

impl DataKey {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    /// Returns `None` unless `bytes` is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_LEN {
            return None;
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Some(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// Fresh random IV from the OS RNG.
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypt with PKCS#7 padding. Output length is always a non-zero multiple of 16.
pub fn encrypt(key: &DataKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let encryptor = Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| VaultError::Crypto(format!("Invalid AES key or IV: {e}")))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt without touching padding. The caller strips it with [`strip_pkcs7`].
pub fn decrypt_blocks(
    key: &DataKey,
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
) -> Option<Zeroizing<Vec<u8>>> {
    let decryptor = Aes256CbcDec::new_from_slices(key.as_bytes(), iv).ok()?;
    decryptor
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .ok()
        .map(Zeroizing::new)
}

/// Validate and remove PKCS#7 padding.
///
/// Every byte of the final block is inspected regardless of where the
/// padding ends, so timing does not reveal which byte was wrong.
pub fn strip_pkcs7(mut padded: Zeroizing<Vec<u8>>) -> Option<Zeroizing<Vec<u8>>> {
    let len = padded.len();
    if len == 0 || len % BLOCK_LEN != 0 {
        return None;
    }

    let pad = padded[len - 1];
    let mut valid = !pad.ct_eq(&0) & !pad.ct_gt(&(BLOCK_LEN as u8));
    for i in 0..BLOCK_LEN {
        let byte = padded[len - 1 - i];
        let in_padding = (i as u8).ct_lt(&pad);
        valid &= !in_padding | byte.ct_eq(&pad);
    }

    if bool::from(valid) {
        padded.truncate(len - pad as usize);
        Some(padded)
    } else {
        None
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Constant-time digest comparison.
pub fn digests_match(expected: &[u8], actual: &[u8]) -> bool {
    expected.len() == actual.len() && bool::from(expected.ct_eq(actual))
}
