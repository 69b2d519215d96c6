//! Recovery of encrypted embedded resources.
//!
//! Protectors move the real resources of an assembly into one encrypted blob. Two layouts are
//! handled here:
//!
//! - **Framed**: the blob decrypts with a configured cipher/key/iv into a small container
//!   holding a (salted) entry count, that many names, a (salted) payload length and the
//!   payload itself. The payload is a complete nested module whose resources the caller merges.
//! - **Key-prefixed**: the raw resource starts with a length-prefixed ASCII key, which is both
//!   the DES key and the IV for the rest of the resource.
//!
//! A missing resource is reported as `Ok(None)`: the protection feature is simply not present.

use crate::{
    file::{parser::Parser, ContainerImage, ResourceLocation},
    utils::{
        crypto::{decrypt_cbc, encrypt_cbc, CipherKind},
        decompress::Compression,
    },
    Result,
};

/// Everything needed to decrypt one framed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedResourceContext {
    /// Name of the embedded resource holding the ciphertext
    pub resource_name: String,
    /// Block cipher, always used in CBC mode with PKCS7 padding
    pub cipher: CipherKind,
    /// Cipher key
    pub key: Vec<u8>,
    /// Initialisation vector
    pub iv: Vec<u8>,
    /// XOR mask of the entry count
    pub xor_salt1: Option<i32>,
    /// XOR mask of the payload length. Without it the payload runs to the end of the stream.
    pub xor_salt2: Option<i32>,
    /// Compression applied to the plaintext before it was encrypted
    pub compression: Compression,
}

impl EncryptedResourceContext {
    /// Context for `resource_name` without salts or compression.
    #[must_use]
    pub fn new(resource_name: &str, cipher: CipherKind, key: &[u8], iv: &[u8]) -> Self {
        EncryptedResourceContext {
            resource_name: resource_name.to_string(),
            cipher,
            key: key.to_vec(),
            iv: iv.to_vec(),
            xor_salt1: None,
            xor_salt2: None,
            compression: Compression::None,
        }
    }

    /// Set both framing salts.
    #[must_use]
    pub fn with_salts(mut self, xor_salt1: i32, xor_salt2: i32) -> Self {
        self.xor_salt1 = Some(xor_salt1);
        self.xor_salt2 = Some(xor_salt2);
        self
    }

    /// Set only the entry count salt.
    #[must_use]
    pub fn with_count_salt(mut self, xor_salt1: i32) -> Self {
        self.xor_salt1 = Some(xor_salt1);
        self
    }

    /// Set the plaintext compression.
    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Decrypt `data` with the configured cipher, then undo the configured compression.
    ///
    /// # Errors
    /// Returns [`crate::Error::Decryption`] or [`crate::Error::Decompression`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let plain = decrypt_cbc(self.cipher, data, &self.key, &self.iv)?;
        self.compression.decompress(&plain)
    }

    /// Encrypt `data` with the configured cipher. Compression is not re-applied.
    ///
    /// # Errors
    /// Returns [`crate::Error::Decryption`] for an unusable key or IV.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        encrypt_cbc(self.cipher, data, &self.key, &self.iv)
    }

    /// Locate and decrypt the resource without interpreting the plaintext.
    ///
    /// Returns `Ok(None)` if the image has no resource of that name.
    ///
    /// # Errors
    /// See [`EncryptedResourceContext::decrypt`].
    pub fn decrypt_resource(
        &self,
        image: &impl ContainerImage,
    ) -> Result<Option<(ResourceLocation, Vec<u8>)>> {
        let Some(location) = image.resource_by_name(&self.resource_name) else {
            return Ok(None);
        };
        let raw = image
            .resource_data(&self.resource_name)
            .ok_or(out_of_bounds_error!())?;

        Ok(Some((location, self.decrypt(raw)?)))
    }
}

/// The payload of a recovered resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredResource {
    /// Name of the encrypted resource it came from
    pub name: String,
    /// Where the encrypted resource sits in the image
    pub location: ResourceLocation,
    /// The embedded module bytes
    pub payload: Vec<u8>,
}

/// Extract the payload span from a decrypted resource container.
///
/// The container is `count ^ salt1`, `count` length-prefixed names, then either
/// `length ^ salt2` followed by `length` payload bytes, or, when `salt2` is absent, the
/// payload up to the end. A missing `salt1` means the count is stored in the clear.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for a negative count or length and
/// [`crate::Error::OutOfBounds`] when the framing overruns the data.
///
/// # Examples
///
/// ```rust
/// use dotreclaim::recovery::resources::unframe;
///
/// let mut container = Vec::new();
/// container.extend_from_slice(&(1i32 ^ 0x55).to_le_bytes());
/// container.extend_from_slice(&[1, b'a']);
/// container.extend_from_slice(&(3i32 ^ 0x77).to_le_bytes());
/// container.extend_from_slice(b"xyz");
///
/// assert_eq!(unframe(&container, Some(0x55), Some(0x77)).unwrap(), b"xyz");
/// ```
pub fn unframe(data: &[u8], xor_salt1: Option<i32>, xor_salt2: Option<i32>) -> Result<&[u8]> {
    let mut parser = Parser::new(data);

    let count = parser.read_le::<i32>()? ^ xor_salt1.unwrap_or(0);
    if count < 0 {
        return Err(malformed_error!("Negative resource entry count {}", count));
    }
    for _ in 0..count {
        parser.skip_prefixed_string()?;
    }

    match xor_salt2 {
        Some(salt) => {
            let length = parser.read_le::<i32>()? ^ salt;
            let length = usize::try_from(length)
                .map_err(|_| malformed_error!("Negative resource payload length {}", length))?;
            parser.read_bytes(length)
        }
        None => Ok(parser.read_remaining()),
    }
}

/// Locate, decrypt and unframe the resource named by `context`.
///
/// Returns `Ok(None)` when the image has no such resource.
///
/// # Errors
/// Returns [`crate::Error::Decryption`] / [`crate::Error::Decompression`] when the blob does not
/// decrypt, and a format error when the decrypted framing is inconsistent.
pub fn recover(
    context: &EncryptedResourceContext,
    image: &impl ContainerImage,
) -> Result<Option<RecoveredResource>> {
    let Some((location, plain)) = context.decrypt_resource(image)? else {
        log::debug!("Resource '{}' not present", context.resource_name);
        return Ok(None);
    };

    let payload = unframe(&plain, context.xor_salt1, context.xor_salt2)?.to_vec();
    log::info!(
        "Recovered {} bytes from resource '{}'",
        payload.len(),
        context.resource_name
    );

    Ok(Some(RecoveredResource {
        name: context.resource_name.clone(),
        location,
        payload,
    }))
}

/// Recover a resource whose DES key and IV are stored in front of the ciphertext.
///
/// Returns `Ok(None)` when the image has no such resource.
///
/// # Errors
/// Returns a format error if the key prefix is unreadable and [`crate::Error::Decryption`] if
/// the key is not 8 bytes or the ciphertext does not decrypt.
pub fn recover_key_prefixed(
    image: &impl ContainerImage,
    resource_name: &str,
) -> Result<Option<RecoveredResource>> {
    let Some(location) = image.resource_by_name(resource_name) else {
        return Ok(None);
    };
    let raw = image
        .resource_data(resource_name)
        .ok_or(out_of_bounds_error!())?;

    let mut parser = Parser::new(raw);
    let key = parser.read_prefixed_string_utf8()?.as_bytes();
    let payload = decrypt_cbc(CipherKind::Des, parser.read_remaining(), key, key)?;

    Ok(Some(RecoveredResource {
        name: resource_name.to_string(),
        location,
        payload,
    }))
}
