//! Direct dword patches of the image copy.
//!
//! Some protectors keep a table of `(offset, value)` pairs that their loader writes into the
//! mapped image before any protected method runs. Applying the same table to a copy of the file
//! yields an image that no longer needs the loader.

use std::ops::Range;

use crate::{
    file::ContainerImage,
    utils::crypto::{decrypt_cbc, CipherKind},
    Result,
};

/// Largest number of entries an encrypted patch table may carry.
pub const MAX_ENCRYPTED_PATCHES: usize = 35;

/// How the addresses of a patch table are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PatchAddressing {
    /// Relative virtual addresses, translated through the section map
    #[default]
    Rva,
    /// Raw file offsets
    FileOffset,
}

impl PatchAddressing {
    /// Byte range of `target` covered by a write of `len` bytes at `address`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the address is not file-backed or the write
    /// would end past `target_len`.
    pub fn resolve(
        self,
        image: &impl ContainerImage,
        address: u32,
        len: usize,
        target_len: usize,
    ) -> Result<Range<usize>> {
        let start = match self {
            PatchAddressing::Rva => image.rva_to_offset(address).ok_or(out_of_bounds_error!())?,
            PatchAddressing::FileOffset => address as usize,
        };
        let end = start.checked_add(len).ok_or(out_of_bounds_error!())?;
        if end > target_len {
            return Err(out_of_bounds_error!());
        }
        Ok(start..end)
    }
}

/// A list of 4-byte values and the addresses they are written to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchInfo {
    offsets: Vec<i32>,
    values: Vec<[u8; 4]>,
}

impl PatchInfo {
    /// Pair up `offsets` and `values`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the arrays differ in length.
    pub fn new(offsets: Vec<i32>, values: Vec<[u8; 4]>) -> Result<Self> {
        if offsets.len() != values.len() {
            return Err(malformed_error!(
                "Patch table has {} offsets but {} values",
                offsets.len(),
                values.len()
            ));
        }
        Ok(PatchInfo { offsets, values })
    }

    /// Build a patch table from its stored form: negated file offsets and an AES encrypted
    /// array of little-endian values.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for an empty or oversized table, a plaintext that is
    /// not a whole number of dwords, or a value count that disagrees with the offsets, and
    /// [`crate::Error::Decryption`] if the values do not decrypt.
    pub fn from_encrypted(
        offsets: &[i32],
        encrypted_values: &[i32],
        key: &[u8],
        iv: &[u8],
    ) -> Result<Self> {
        if offsets.is_empty() || offsets.len() > MAX_ENCRYPTED_PATCHES {
            return Err(malformed_error!(
                "Unexpected patch table size {}",
                offsets.len()
            ));
        }

        let ciphertext: Vec<u8> = encrypted_values
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect();
        let plain = decrypt_cbc(CipherKind::Aes, &ciphertext, key, iv)?;
        if plain.len() % 4 != 0 {
            return Err(malformed_error!(
                "Decrypted patch values are {} bytes, not a multiple of 4",
                plain.len()
            ));
        }

        let values = plain
            .chunks_exact(4)
            .map(|chunk| [chunk[0], chunk[1], chunk[2], chunk[3]])
            .collect();
        let offsets = offsets.iter().map(|offset| offset.wrapping_neg()).collect();
        PatchInfo::new(offsets, values)
    }

    /// Patch addresses.
    #[must_use]
    pub fn offsets(&self) -> &[i32] {
        &self.offsets
    }

    /// Patch values, parallel to [`PatchInfo::offsets`].
    #[must_use]
    pub fn values(&self) -> &[[u8; 4]] {
        &self.values
    }

    /// Number of patches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns `true` if there is nothing to patch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Write every value of `patch` into `target`, a mutable copy of `image`'s bytes.
///
/// All addresses are translated and bounds-checked before the first byte is written, so a
/// rejected table leaves `target` untouched. Returns the number of dwords written.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if any address is negative, not file-backed or too
/// close to the end of `target`.
pub fn apply_dword_patches(
    patch: &PatchInfo,
    image: &impl ContainerImage,
    target: &mut [u8],
    addressing: PatchAddressing,
) -> Result<usize> {
    let ranges = patch
        .offsets
        .iter()
        .map(|&offset| {
            let address = u32::try_from(offset).map_err(|_| out_of_bounds_error!())?;
            addressing.resolve(image, address, 4, target.len())
        })
        .collect::<Result<Vec<_>>>()?;

    for (range, value) in ranges.into_iter().zip(&patch.values) {
        target[range].copy_from_slice(value);
    }

    log::debug!("Applied {} dword patches", patch.len());
    Ok(patch.len())
}
