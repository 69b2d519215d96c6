//! Decompression of recovered payloads.
//!
//! Protectors compress resources and method streams before encrypting them. Three framings
//! occur: raw DEFLATE (`System.IO.Compression.DeflateStream`, or an `Inflater` created with
//! `noHeader`), zlib-wrapped DEFLATE, and gzip with an externally stored decompressed size.

use std::io::Read;

use flate2::{read::GzDecoder, Decompress, FlushDecompress, Status};
use strum::{Display, EnumString};

use crate::{Error, Result};

/// Compression applied to a payload after decryption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Compression {
    /// Stored as is
    #[default]
    None,
    /// Raw DEFLATE without header
    Deflate,
    /// DEFLATE with a zlib header and Adler-32 trailer
    Zlib,
    /// gzip member
    Gzip,
}

impl Compression {
    /// Undo this compression.
    ///
    /// # Errors
    /// Returns [`Error::Decompression`] for corrupt or incomplete streams.
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Deflate => inflate(data, true),
            Compression::Zlib => inflate(data, false),
            Compression::Gzip => decompress_gzip(data),
        }
    }
}

/// Inflate a DEFLATE stream, raw when `no_header` is set and zlib-framed otherwise.
///
/// The output grows as needed. The stream must reach its final block; input that simply runs
/// out is rejected rather than returned as a short result.
///
/// # Errors
/// Returns [`Error::Decompression`] if the stream is corrupt or incomplete.
pub fn inflate(data: &[u8], no_header: bool) -> Result<Vec<u8>> {
    let mut inflater = Decompress::new(!no_header);
    let mut decompressed = Vec::with_capacity(data.len().saturating_mul(2).max(0x1000));

    loop {
        if decompressed.len() == decompressed.capacity() {
            decompressed.reserve(decompressed.capacity());
        }

        let consumed = inflater.total_in() as usize;
        let produced = decompressed.len();
        let input = data.get(consumed..).unwrap_or_default();
        let status = inflater
            .decompress_vec(input, &mut decompressed, FlushDecompress::Finish)
            .map_err(|e| Error::Decompression(e.to_string()))?;

        match status {
            Status::StreamEnd => return Ok(decompressed),
            Status::Ok | Status::BufError => {
                let stalled = inflater.total_in() as usize == consumed
                    && decompressed.len() == produced
                    && decompressed.len() < decompressed.capacity();
                if stalled {
                    return Err(Error::Decompression(
                        "Incomplete deflate stream".to_string(),
                    ));
                }
            }
        }
    }
}

/// Decompresses GZip data using flate2.
///
/// # Errors
/// Returns [`Error::Decompression`] if the stream is corrupt or incomplete.
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();

    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| Error::Decompression(e.to_string()))?;

    Ok(decompressed)
}

/// Gunzip into a buffer of exactly `decompressed_size` bytes.
///
/// # Errors
/// Returns [`Error::Decompression`] if the stream is corrupt or yields fewer bytes than announced.
pub fn gunzip(data: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = vec![0u8; decompressed_size];

    decoder
        .read_exact(&mut decompressed)
        .map_err(|e| Error::Decompression(format!("Could not gzip decompress - {e}")))?;

    Ok(decompressed)
}
