//! Cursor-based binary parser over decrypted payloads and method records.
//!
//! [`Parser`] keeps a position within a borrowed byte slice and offers bounds-checked
//! reads of fixed-width integers, variable-length integers, prefixed strings and raw
//! byte spans. It is the reading side of the method codec, the resource framing and the
//! decrypted method streams.
//!
//! # Examples
//!
//! ```rust
//! use dotreclaim::Parser;
//!
//! let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
//! let mut parser = Parser::new(&data);
//!
//! let first = parser.read_le::<u32>()?;
//! assert_eq!(first, 0x04030201);
//!
//! parser.seek(6)?;
//! assert_eq!(parser.read_le::<u16>()?, 0x0807);
//! # Ok::<(), dotreclaim::Error>(())
//! ```

use crate::{
    file::{
        io::{read_le_at, CilIO},
        varint,
    },
    Result,
};

/// A bounds-checked reader over a byte slice.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`Parser`] from a byte slice.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Total length of the underlying buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the underlying buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there is more data available to parse.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Get the current position of the parser within the data buffer.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Number of bytes left after the current position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Move the current position to `pos`. Seeking to the very end is allowed.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is beyond the data length.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Move the position forward by `step` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if advancing would exceed the data length.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        let end = self.calc_end_position(step)?;
        self.position = end;
        Ok(())
    }

    /// Align the position up to the next multiple of `alignment` (a power of two).
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if aligning would exceed the data length.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - (self.position % alignment)) % alignment;
        self.advance_by(padding)
    }

    /// Peek at the next byte without advancing the position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if position is at or beyond the data length.
    pub fn peek_byte(&self) -> Result<u8> {
        self.data
            .get(self.position)
            .copied()
            .ok_or(out_of_bounds_error!())
    }

    /// Peek at a little-endian value without advancing the position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading `T` would exceed the data length.
    pub fn peek_le<T: CilIO>(&self) -> Result<T> {
        let mut temp_position = self.position;
        read_le_at::<T>(self.data, &mut temp_position)
    }

    /// Read a little-endian value and advance the position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length.
    pub fn read_le<T: CilIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Read `length` raw bytes and advance the position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `length` bytes remain.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.calc_end_position(length)?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Read every byte up to the end of the buffer.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let bytes = &self.data[self.position.min(self.data.len())..];
        self.position = self.data.len();
        bytes
    }

    /// Read a compressed unsigned integer (ECMA-335 II.23.2).
    ///
    /// # Errors
    /// See [`varint::read_compressed_uint`].
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        varint::read_compressed_uint(self.data, &mut self.position)
    }

    /// Read a `BinaryWriter`-style 7-bit encoded integer.
    ///
    /// # Errors
    /// See [`varint::read_7bit_encoded_int`].
    pub fn read_7bit_encoded_int(&mut self) -> Result<u32> {
        varint::read_7bit_encoded_int(self.data, &mut self.position)
    }

    /// Read a 7-bit length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// See [`varint::read_prefixed_string`].
    pub fn read_prefixed_string_utf8(&mut self) -> Result<&'a str> {
        varint::read_prefixed_string(self.data, &mut self.position)
    }

    /// Skip a 7-bit length-prefixed string without decoding it.
    ///
    /// # Errors
    /// See [`varint::read_prefixed_bytes`].
    pub fn skip_prefixed_string(&mut self) -> Result<()> {
        varint::read_prefixed_bytes(self.data, &mut self.position).map(|_| ())
    }

    /// Execute a closure transactionally, rolling the position back on failure.
    ///
    /// # Errors
    /// Returns any error produced by `f`; the position is restored in that case.
    pub fn transactional<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let saved_position = self.position;
        let result = f(self);
        if result.is_err() {
            self.position = saved_position;
        }
        result
    }

    fn calc_end_position(&self, length: usize) -> Result<usize> {
        let end = self
            .position
            .checked_add(length)
            .ok_or(out_of_bounds_error!())?;

        if end > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::varint::write_prefixed_string;

    #[test]
    fn navigation() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05];
        let mut parser = Parser::new(&data);

        assert_eq!(parser.len(), 5);
        parser.advance_by(1).unwrap();
        parser.align(4).unwrap();
        assert_eq!(parser.pos(), 4);
        assert_eq!(parser.remaining(), 1);
        assert!(parser.align(8).is_err());

        parser.seek(5).unwrap();
        assert!(!parser.has_more_data());
        assert!(parser.seek(6).is_err());
        assert!(parser.peek_byte().is_err());
    }

    #[test]
    fn peek_does_not_advance() {
        let data = [0x34, 0x12];
        let parser = Parser::new(&data);
        assert_eq!(parser.peek_byte().unwrap(), 0x34);
        assert_eq!(parser.peek_le::<u16>().unwrap(), 0x1234);
        assert_eq!(parser.pos(), 0);
    }

    #[test]
    fn bytes_and_remaining() {
        let data = [1, 2, 3, 4, 5, 6];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_bytes(2).unwrap(), &[1, 2]);
        assert!(parser.read_bytes(5).is_err());
        assert_eq!(parser.read_remaining(), &[3, 4, 5, 6]);
        assert_eq!(parser.read_remaining(), &[] as &[u8]);
    }

    #[test]
    fn strings_and_varints() {
        let mut data = Vec::new();
        write_prefixed_string(&mut data, "name");
        data.extend_from_slice(&[0x81, 0x01, 0xC0, 0x00, 0x40, 0x00]);

        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_prefixed_string_utf8().unwrap(), "name");
        assert_eq!(parser.read_7bit_encoded_int().unwrap(), 0x81);
        assert_eq!(parser.read_compressed_uint().unwrap(), 0x4000);
        assert!(!parser.has_more_data());
    }

    #[test]
    fn transactional_rollback() {
        let data = [0x01, 0x02, 0x03];
        let mut parser = Parser::new(&data);

        let result: Result<u32> = parser.transactional(|p| {
            p.read_le::<u8>()?;
            p.read_le::<u32>()
        });
        assert!(result.is_err());
        assert_eq!(parser.pos(), 0);

        let value: u16 = parser.transactional(|p| p.read_le()).unwrap();
        assert_eq!(value, 0x0201);
        assert_eq!(parser.pos(), 2);
    }
}
