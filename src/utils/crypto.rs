//! Block ciphers and digests used by protection schemes.
//!
//! # Symmetric Encryption
//!
//! - **AES** (128/192/256-bit CBC mode with PKCS7 padding)
//! - **TripleDES** (168-bit CBC mode with PKCS7 padding)
//! - **DES** (56-bit CBC mode with PKCS7 padding)
//!
//! Decryption failures (bad key or IV length, ciphertext that is not a whole number of blocks,
//! broken padding) are returned as [`crate::Error::Decryption`], never as panics.
//!
//! # Hash Functions
//!
//! MD5, SHA-1, SHA-256 and SHA-512. These are used to compare decrypted payloads against
//! digests embedded by the protector, never for security decisions.
//!
//! # Examples
//!
//! ```rust
//! use dotreclaim::utils::crypto::{decrypt_cbc, encrypt_cbc, CipherKind};
//!
//! let key = [7u8; 16];
//! let iv = [9u8; 16];
//! let ciphertext = encrypt_cbc(CipherKind::Aes, b"payload", &key, &iv)?;
//! assert_eq!(decrypt_cbc(CipherKind::Aes, &ciphertext, &key, &iv)?, b"payload");
//! # Ok::<(), dotreclaim::Error>(())
//! ```

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use des::{Des, TdesEde3};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use strum::{Display, EnumString};

use crate::Result;

type Aes128CbcEnc = Encryptor<Aes128>;
type Aes128CbcDec = Decryptor<Aes128>;
type Aes192CbcEnc = Encryptor<Aes192>;
type Aes192CbcDec = Decryptor<Aes192>;
type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;
type TdesCbcEnc = Encryptor<TdesEde3>;
type TdesCbcDec = Decryptor<TdesEde3>;
type DesCbcEnc = Encryptor<Des>;
type DesCbcDec = Decryptor<Des>;

/// Block cipher selected for a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum CipherKind {
    /// AES / Rijndael with a 128-bit block, key size picks the variant
    #[strum(to_string = "aes", serialize = "rijndael")]
    Aes,
    /// Three-key triple DES
    #[strum(to_string = "tripledes", serialize = "3des")]
    TripleDes,
    /// Single DES
    #[strum(serialize = "des")]
    Des,
}

impl CipherKind {
    /// Block size in bytes, which is also the required IV length.
    #[must_use]
    pub fn block_size(&self) -> usize {
        match self {
            CipherKind::Aes => 16,
            CipherKind::TripleDes | CipherKind::Des => 8,
        }
    }
}

/// Decrypt CBC ciphertext and strip its PKCS7 padding.
///
/// # Errors
/// Returns [`crate::Error::Decryption`] for an unsupported key size, a short IV, a ciphertext
/// that is empty or not block aligned, or invalid padding.
pub fn decrypt_cbc(kind: CipherKind, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    match (kind, key.len()) {
        (CipherKind::Aes, 16) => cbc_decrypt::<Aes128CbcDec>(kind, data, key, iv),
        (CipherKind::Aes, 24) => cbc_decrypt::<Aes192CbcDec>(kind, data, key, iv),
        (CipherKind::Aes, 32) => cbc_decrypt::<Aes256CbcDec>(kind, data, key, iv),
        (CipherKind::TripleDes, 24) => cbc_decrypt::<TdesCbcDec>(kind, data, key, iv),
        (CipherKind::Des, 8) => cbc_decrypt::<DesCbcDec>(kind, data, key, iv),
        (_, len) => Err(decryption_error!("Unsupported {} key size: {} bytes", kind, len)),
    }
}

/// Encrypt `data` in CBC mode with PKCS7 padding.
///
/// # Errors
/// Returns [`crate::Error::Decryption`] for an unsupported key size or a short IV.
pub fn encrypt_cbc(kind: CipherKind, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    match (kind, key.len()) {
        (CipherKind::Aes, 16) => cbc_encrypt::<Aes128CbcEnc>(kind, data, key, iv),
        (CipherKind::Aes, 24) => cbc_encrypt::<Aes192CbcEnc>(kind, data, key, iv),
        (CipherKind::Aes, 32) => cbc_encrypt::<Aes256CbcEnc>(kind, data, key, iv),
        (CipherKind::TripleDes, 24) => cbc_encrypt::<TdesCbcEnc>(kind, data, key, iv),
        (CipherKind::Des, 8) => cbc_encrypt::<DesCbcEnc>(kind, data, key, iv),
        (_, len) => Err(decryption_error!("Unsupported {} key size: {} bytes", kind, len)),
    }
}

fn cbc_decrypt<D: BlockDecryptMut + KeyIvInit>(
    kind: CipherKind,
    data: &[u8],
    key: &[u8],
    iv: &[u8],
) -> Result<Vec<u8>> {
    let block_size = kind.block_size();
    if data.is_empty() || data.len() % block_size != 0 {
        return Err(decryption_error!(
            "{} ciphertext of {} bytes is not a whole number of {}-byte blocks",
            kind,
            data.len(),
            block_size
        ));
    }
    if iv.len() < block_size {
        return Err(decryption_error!("{} IV too short: {} bytes", kind, iv.len()));
    }

    let cipher = D::new_from_slices(key, &iv[..block_size])
        .map_err(|_| decryption_error!("Invalid {} key or IV", kind))?;
    let mut buf = data.to_vec();
    let plain_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| decryption_error!("Invalid {} padding", kind))?
        .len();
    buf.truncate(plain_len);
    Ok(buf)
}

fn cbc_encrypt<E: BlockEncryptMut + KeyIvInit>(
    kind: CipherKind,
    data: &[u8],
    key: &[u8],
    iv: &[u8],
) -> Result<Vec<u8>> {
    let block_size = kind.block_size();
    if iv.len() < block_size {
        return Err(decryption_error!("{} IV too short: {} bytes", kind, iv.len()));
    }

    let cipher = E::new_from_slices(key, &iv[..block_size])
        .map_err(|_| decryption_error!("Invalid {} key or IV", kind))?;
    let padded_len = (data.len() / block_size + 1) * block_size;
    let mut buf = vec![0u8; padded_len];
    buf[..data.len()].copy_from_slice(data);
    let cipher_len = cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buf, data.len())
        .map_err(|_| decryption_error!("{} padding failed", kind))?
        .len();
    buf.truncate(cipher_len);
    Ok(buf)
}

/// Digest algorithms available for integrity comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum HashAlgorithm {
    /// 128-bit MD5
    Md5,
    /// 160-bit SHA-1
    Sha1,
    /// 256-bit SHA-2
    Sha256,
    /// 512-bit SHA-2
    Sha512,
}

/// Computes the MD5 hash of input bytes.
#[must_use]
pub fn compute_md5(data: &[u8]) -> Vec<u8> {
    Md5::digest(data).to_vec()
}

/// Computes the SHA-1 hash of input bytes.
#[must_use]
pub fn compute_sha1(data: &[u8]) -> Vec<u8> {
    Sha1::digest(data).to_vec()
}

/// Computes the SHA-256 hash of input bytes.
#[must_use]
pub fn compute_sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Computes the SHA-512 hash of input bytes.
#[must_use]
pub fn compute_sha512(data: &[u8]) -> Vec<u8> {
    Sha512::digest(data).to_vec()
}

/// Computes a digest with the selected algorithm.
#[must_use]
pub fn compute_hash(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Md5 => compute_md5(data),
        HashAlgorithm::Sha1 => compute_sha1(data),
        HashAlgorithm::Sha256 => compute_sha256(data),
        HashAlgorithm::Sha512 => compute_sha512(data),
    }
}

/// Returns `true` if `data` hashes to `expected` under `algorithm`.
#[must_use]
pub fn hash_matches(algorithm: HashAlgorithm, data: &[u8], expected: &[u8]) -> bool {
    compute_hash(algorithm, data) == expected
}
