//! Variable-length integer and length-prefixed string encodings.
//!
//! Two integer encodings show up inside decrypted payloads:
//!
//! - **Compressed unsigned integers** (ECMA-335 II.23.2): 1, 2 or 4 bytes, big-endian, with
//!   the width selected by the top bits of the first byte (`0xxxxxxx`, `10xxxxxx`, `110xxxxx`).
//! - **7-bit encoded integers** as written by `System.IO.BinaryWriter`: little-endian groups of
//!   seven bits, high bit set on every byte but the last. These prefix the length of every
//!   string `BinaryWriter.Write(string)` emits, which is how resource containers store names.
//!
//! Readers operate on `(data, &mut offset)` pairs and never advance `offset` on failure.

use crate::Result;

/// Largest value representable as a compressed unsigned integer.
pub const MAX_COMPRESSED_UINT: u32 = 0x1FFF_FFFF;

/// Reads a compressed unsigned integer at `offset`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] on truncation and [`crate::Error::Malformed`] if the
/// first byte does not select a valid width.
pub fn read_compressed_uint(data: &[u8], offset: &mut usize) -> Result<u32> {
    let start = *offset;
    let first = *data.get(start).ok_or(out_of_bounds_error!())?;

    let (value, width) = if first & 0x80 == 0 {
        (u32::from(first), 1)
    } else if first & 0xC0 == 0x80 {
        let second = *data.get(start + 1).ok_or(out_of_bounds_error!())?;
        (((u32::from(first) & 0x3F) << 8) | u32::from(second), 2)
    } else if first & 0xE0 == 0xC0 {
        let rest = data
            .get(start + 1..start + 4)
            .ok_or(out_of_bounds_error!())?;
        (
            ((u32::from(first) & 0x1F) << 24)
                | (u32::from(rest[0]) << 16)
                | (u32::from(rest[1]) << 8)
                | u32::from(rest[2]),
            4,
        )
    } else {
        return Err(malformed_error!("Invalid compressed uint - {}", first));
    };

    *offset = start + width;
    Ok(value)
}

/// Appends `value` as a compressed unsigned integer.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if `value` exceeds [`MAX_COMPRESSED_UINT`].
pub fn write_compressed_uint(out: &mut Vec<u8>, value: u32) -> Result<()> {
    match value {
        0..=0x7F => out.push(value as u8),
        0x80..=0x3FFF => {
            out.push(0x80 | (value >> 8) as u8);
            out.push(value as u8);
        }
        0x4000..=MAX_COMPRESSED_UINT => {
            out.push(0xC0 | (value >> 24) as u8);
            out.push((value >> 16) as u8);
            out.push((value >> 8) as u8);
            out.push(value as u8);
        }
        _ => {
            return Err(malformed_error!(
                "Value too large for compressed uint - {}",
                value
            ))
        }
    }
    Ok(())
}

/// Reads a 7-bit encoded integer at `offset`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] on truncation and [`crate::Error::Malformed`] if more
/// than five bytes carry a continuation bit.
pub fn read_7bit_encoded_int(data: &[u8], offset: &mut usize) -> Result<u32> {
    let mut cursor = *offset;
    let mut value = 0u32;
    let mut shift = 0u32;

    loop {
        let byte = *data.get(cursor).ok_or(out_of_bounds_error!())?;
        cursor += 1;

        value |= u32::from(byte & 0x7F).wrapping_shl(shift);
        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
        if shift > 28 {
            return Err(malformed_error!(
                "7-bit encoded integer overflow after {} bytes",
                cursor - *offset
            ));
        }
    }

    *offset = cursor;
    Ok(value)
}

/// Appends `value` as a 7-bit encoded integer.
pub fn write_7bit_encoded_int(out: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Reads a 7-bit length-prefixed UTF-8 string at `offset`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] on truncation and [`crate::Error::Malformed`] on
/// invalid UTF-8.
pub fn read_prefixed_string<'a>(data: &'a [u8], offset: &mut usize) -> Result<&'a str> {
    let mut cursor = *offset;
    let bytes = read_prefixed_bytes(data, &mut cursor)?;
    let text = std::str::from_utf8(bytes).map_err(|e| {
        malformed_error!("Invalid UTF-8 string at offset {} - {}", *offset, e)
    })?;

    *offset = cursor;
    Ok(text)
}

/// Reads the raw bytes of a 7-bit length-prefixed string at `offset`, without decoding them.
///
/// Protected resources frequently store names that are not valid UTF-8; skipping them must
/// not depend on their content.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the prefix or the body is truncated.
pub fn read_prefixed_bytes<'a>(data: &'a [u8], offset: &mut usize) -> Result<&'a [u8]> {
    let mut cursor = *offset;
    let length = read_7bit_encoded_int(data, &mut cursor)? as usize;
    let end = cursor.checked_add(length).ok_or(out_of_bounds_error!())?;
    let bytes = data.get(cursor..end).ok_or(out_of_bounds_error!())?;

    *offset = end;
    Ok(bytes)
}

/// Appends `text` as a 7-bit length-prefixed UTF-8 string.
pub fn write_prefixed_string(out: &mut Vec<u8>, text: &str) {
    write_7bit_encoded_int(out, text.len() as u32);
    out.extend_from_slice(text.as_bytes());
}
