//! Parsing and serialization of CIL method body records.
//!
//! A method body record is a header, the CIL code, and for fat bodies an optional run of
//! 4-byte aligned extra data sections (exception clauses). Decrypted payloads are validated
//! by running them through [`MethodBody::parse`]; signature detectors use [`MethodBody::verify`]
//! as a cheap probe over candidate decryptions.
//!
//! The codec is strict where the runtime is strict: an unknown header kind, a fat header whose
//! size nibble is not 3 (12 bytes), a negative code size, a local signature token outside the
//! standalone signature table, and any malformed extra section are rejected with
//! [`crate::Error::InvalidMethodBody`].
//!
//! # Examples
//!
//! ```rust
//! use dotreclaim::metadata::method::MethodBody;
//!
//! // Tiny header: code size 2, followed by `ldc.i4.1; ret`
//! let body = MethodBody::parse(&[0x0A, 0x17, 0x2A])?;
//! assert!(body.header.is_tiny());
//! assert_eq!(body.header.max_stack, 8);
//! assert_eq!(body.code, vec![0x17, 0x2A]);
//!
//! assert!(!MethodBody::verify(&[0x0A, 0x17]));
//! # Ok::<(), dotreclaim::Error>(())
//! ```
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Method Header Format

use crate::{
    file::{io::push_le, parser::Parser},
    metadata::{
        method::{decode_exception_handlers, ExceptionHandler, MethodBodyFlags, SectionFlags},
        token::STANDALONE_SIG_TABLE,
    },
    Error, Result,
};

/// Size of every fat method header in bytes.
pub const FAT_HEADER_SIZE: usize = 12;

/// Largest code size a tiny header can describe.
pub const TINY_MAX_CODE_SIZE: u32 = 63;

/// Implicit maximum evaluation stack depth of tiny bodies.
pub const TINY_MAX_STACK: u16 = 8;

const FAT_SIZE_NIBBLE: u16 = (FAT_HEADER_SIZE / 4) as u16;
const SMALL_CLAUSE_SIZE: usize = 12;
const FAT_CLAUSE_SIZE: usize = 24;

/// Decoded method header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodBodyHeader {
    /// Raw flags word. For tiny bodies only the format bits are kept.
    pub flags: u16,
    /// Maximum number of items on the operand stack
    pub max_stack: u16,
    /// Size of the CIL code in bytes
    pub code_size: u32,
    /// Local variable signature token, 0 when the method has no locals
    pub local_var_sig_token: u32,
}

impl MethodBodyHeader {
    /// Header of a tiny body with `code_size` bytes of code.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMethodBody`] if `code_size` does not fit the tiny form.
    pub fn tiny(code_size: u32) -> Result<Self> {
        if code_size > TINY_MAX_CODE_SIZE {
            return Err(Error::invalid_body(format!(
                "Code size {code_size} does not fit a tiny header"
            )));
        }

        Ok(MethodBodyHeader {
            flags: MethodBodyFlags::TINY_FORMAT.bits(),
            max_stack: TINY_MAX_STACK,
            code_size,
            local_var_sig_token: 0,
        })
    }

    /// Header of a fat body. `flags` only needs the optional bits (`MORE_SECTS`, `INIT_LOCALS`),
    /// format and size bits are filled in.
    #[must_use]
    pub fn fat(flags: MethodBodyFlags, max_stack: u16, code_size: u32, local_var_sig_token: u32) -> Self {
        MethodBodyHeader {
            flags: (FAT_SIZE_NIBBLE << 12) | (flags | MethodBodyFlags::FAT_FORMAT).bits(),
            max_stack,
            code_size,
            local_var_sig_token,
        }
    }

    /// Returns `true` for the 1-byte header form.
    #[must_use]
    pub fn is_tiny(&self) -> bool {
        self.flags & 3 == MethodBodyFlags::TINY_FORMAT.bits()
    }

    /// Size of the encoded header in bytes.
    #[must_use]
    pub fn header_size(&self) -> usize {
        if self.is_tiny() {
            1
        } else {
            FAT_HEADER_SIZE
        }
    }

    /// Returns `true` if extra data sections follow the code.
    #[must_use]
    pub fn has_extra_sections(&self) -> bool {
        !self.is_tiny() && self.flags & MethodBodyFlags::MORE_SECTS.bits() != 0
    }

    /// Returns `true` if locals are zero-initialised.
    #[must_use]
    pub fn init_locals(&self) -> bool {
        !self.is_tiny() && self.flags & MethodBodyFlags::INIT_LOCALS.bits() != 0
    }

    fn validate(&self) -> Result<()> {
        if self.is_tiny() {
            if self.code_size > TINY_MAX_CODE_SIZE {
                return Err(Error::invalid_body("Tiny header with oversized code"));
            }
            return Ok(());
        }

        if self.flags & 7 != MethodBodyFlags::FAT_FORMAT.bits() {
            return Err(Error::invalid_body("Invalid method header type"));
        }
        if self.flags >> 12 != FAT_SIZE_NIBBLE {
            return Err(Error::invalid_body("Invalid fat method header size"));
        }
        if self.code_size > i32::MAX as u32 {
            return Err(Error::invalid_body("Invalid code size"));
        }
        if self.local_var_sig_token != 0
            && (self.local_var_sig_token >> 24) as u8 != STANDALONE_SIG_TABLE
        {
            return Err(Error::invalid_body("Invalid local var sig token"));
        }
        Ok(())
    }

    /// Append the encoded header.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMethodBody`] for a header [`MethodBody::parse`] would reject.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        self.validate()?;

        if self.is_tiny() {
            out.push(((self.code_size as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8);
        } else {
            push_le(out, self.flags);
            push_le(out, self.max_stack);
            push_le(out, self.code_size);
            push_le(out, self.local_var_sig_token);
        }
        Ok(())
    }

    fn read(parser: &mut Parser) -> Result<Self> {
        let first = parser.peek_byte()?;

        if first & 3 == MethodBodyFlags::TINY_FORMAT.bits() as u8 {
            parser.advance_by(1)?;
            return MethodBodyHeader::tiny(u32::from(first >> 2));
        }

        if first & 7 == MethodBodyFlags::FAT_FORMAT.bits() as u8 {
            let header = MethodBodyHeader {
                flags: parser.read_le::<u16>()?,
                max_stack: parser.read_le::<u16>()?,
                code_size: parser.read_le::<u32>()?,
                local_var_sig_token: parser.read_le::<u32>()?,
            };
            header.validate()?;
            return Ok(header);
        }

        Err(Error::invalid_body("Invalid method header type"))
    }
}

/// A complete method body record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// The decoded header
    pub header: MethodBodyHeader,
    /// CIL code, exactly `header.code_size` bytes
    pub code: Vec<u8>,
    /// Raw extra data sections, starting at the first section (after alignment padding)
    pub extra_sections: Option<Vec<u8>>,
}

impl MethodBody {
    /// Parse a method body record from the start of `data`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMethodBody`] for a rejected header or section and
    /// [`Error::OutOfBounds`] for truncated input.
    pub fn parse(data: &[u8]) -> Result<MethodBody> {
        let mut parser = Parser::new(data);
        MethodBody::read(&mut parser)
    }

    /// Parse a method body record at the parser position. On failure the position is left
    /// untouched. Section alignment is relative to the start of the parser's buffer.
    ///
    /// # Errors
    /// See [`MethodBody::parse`].
    pub fn read(parser: &mut Parser) -> Result<MethodBody> {
        parser.transactional(|parser| {
            let header = MethodBodyHeader::read(parser)?;
            let code = parser.read_bytes(header.code_size as usize)?.to_vec();
            let extra_sections = if header.has_extra_sections() {
                Some(read_extra_sections(parser)?.to_vec())
            } else {
                None
            };

            Ok(MethodBody {
                header,
                code,
                extra_sections,
            })
        })
    }

    /// Returns `true` if `data` starts with a well-formed method body record.
    #[must_use]
    pub fn verify(data: &[u8]) -> bool {
        MethodBody::parse(data).is_ok()
    }

    /// Header size of the record starting with `data`, from its first one or two bytes.
    ///
    /// This is the same discriminant [`MethodBody::parse`] uses: tiny headers are one byte, fat
    /// headers carry their size in dwords in the top nibble of the flags word.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMethodBody`] for an unknown header kind and
    /// [`Error::OutOfBounds`] if `data` is too short.
    pub fn header_size_from_prefix(data: &[u8]) -> Result<usize> {
        let first = *data.first().ok_or(out_of_bounds_error!())?;
        if first & 3 == MethodBodyFlags::TINY_FORMAT.bits() as u8 {
            return Ok(1);
        }
        if first & 7 == MethodBodyFlags::FAT_FORMAT.bits() as u8 {
            let second = *data.get(1).ok_or(out_of_bounds_error!())?;
            return Ok(4 * usize::from(second >> 4));
        }
        Err(Error::invalid_body("Invalid method header type"))
    }

    /// Build a body from its parts, choosing the tiny form whenever it can express them.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMethodBody`] if the resulting header would be invalid.
    pub fn new(
        max_stack: u16,
        local_var_sig_token: u32,
        init_locals: bool,
        code: Vec<u8>,
        extra_sections: Option<Vec<u8>>,
    ) -> Result<MethodBody> {
        let code_size = u32::try_from(code.len())
            .map_err(|_| Error::invalid_body("Code too large"))?;
        let fits_tiny = code_size <= TINY_MAX_CODE_SIZE
            && max_stack <= TINY_MAX_STACK
            && local_var_sig_token == 0
            && !init_locals
            && extra_sections.is_none();

        let header = if fits_tiny {
            MethodBodyHeader::tiny(code_size)?
        } else {
            let mut flags = MethodBodyFlags::empty();
            if init_locals {
                flags |= MethodBodyFlags::INIT_LOCALS;
            }
            if extra_sections.is_some() {
                flags |= MethodBodyFlags::MORE_SECTS;
            }
            MethodBodyHeader::fat(flags, max_stack, code_size, local_var_sig_token)
        };
        header.validate()?;

        Ok(MethodBody {
            header,
            code,
            extra_sections,
        })
    }

    /// Number of bytes this record occupies when serialized from a 4-byte aligned position.
    #[must_use]
    pub fn total_size(&self) -> usize {
        let end = self.header.header_size() + self.code.len();
        match &self.extra_sections {
            Some(extra) => ((end + 3) & !3) + extra.len(),
            None => end,
        }
    }

    /// Encode the record. The output re-parses to an identical [`MethodBody`].
    ///
    /// # Errors
    /// Returns [`Error::InvalidMethodBody`] if the header disagrees with the code length or
    /// with the presence of extra sections.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.code.len() != self.header.code_size as usize {
            return Err(Error::invalid_body("Code length does not match header"));
        }
        if self.header.has_extra_sections() != self.extra_sections.is_some() {
            return Err(Error::invalid_body(
                "Extra sections do not match the header flags",
            ));
        }

        let mut out = Vec::with_capacity(self.total_size());
        self.header.write_to(&mut out)?;
        out.extend_from_slice(&self.code);
        if let Some(extra) = &self.extra_sections {
            out.resize((out.len() + 3) & !3, 0);
            out.extend_from_slice(extra);
        }
        Ok(out)
    }

    /// Decode the exception clauses stored in the extra sections.
    ///
    /// # Errors
    /// See [`decode_exception_handlers`].
    pub fn exception_handlers(&self) -> Result<Vec<ExceptionHandler>> {
        match &self.extra_sections {
            Some(extra) => decode_exception_handlers(extra),
            None => Ok(Vec::new()),
        }
    }
}

/// Walk the chain of extra sections and return its exact byte span.
fn read_extra_sections<'a>(parser: &mut Parser<'a>) -> Result<&'a [u8]> {
    parser.align(4)?;
    let start = parser.pos();

    loop {
        parser.align(4)?;
        let section_start = parser.pos();
        let kind = SectionFlags::from_bits_retain(parser.read_le::<u8>()?);
        if !kind.contains(SectionFlags::EHTABLE) {
            return Err(Error::invalid_body("Not an exception section"));
        }
        if kind.bits() & SectionFlags::UNDEFINED_MASK != 0 {
            return Err(Error::invalid_body("Invalid bits set"));
        }

        if kind.contains(SectionFlags::FAT_FORMAT) {
            parser.seek(section_start)?;
            let clauses = (parser.read_le::<u32>()? >> 8) as usize / FAT_CLAUSE_SIZE;
            parser.advance_by(clauses * FAT_CLAUSE_SIZE)?;
        } else {
            let clauses = parser.read_le::<u8>()? as usize / SMALL_CLAUSE_SIZE;
            parser.advance_by(2 + clauses * SMALL_CLAUSE_SIZE)?;
        }

        if !kind.contains(SectionFlags::MORE_SECTS) {
            break;
        }
    }

    let end = parser.pos();
    parser.seek(start)?;
    parser.read_bytes(end - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::method::ExceptionHandlerFlags;

    fn fat_with_sections(code_len: usize, sections: &[u8]) -> Vec<u8> {
        let header = MethodBodyHeader::fat(
            MethodBodyFlags::MORE_SECTS | MethodBodyFlags::INIT_LOCALS,
            3,
            code_len as u32,
            0x1100_001A,
        );
        let mut out = Vec::new();
        header.write_to(&mut out).unwrap();
        out.extend(std::iter::repeat(0x00).take(code_len));
        out.resize((out.len() + 3) & !3, 0);
        out.extend_from_slice(sections);
        out
    }

    #[test]
    fn tiny_every_size() {
        for code_size in 0..=TINY_MAX_CODE_SIZE {
            let mut data = vec![((code_size as u8) << 2) | 2];
            data.extend(std::iter::repeat(0x00).take(code_size as usize));
            // Trailing garbage is not part of the record
            data.push(0xFF);

            let body = MethodBody::parse(&data).unwrap();
            assert_eq!(body.header.code_size, code_size);
            assert_eq!(body.header.max_stack, 8);
            assert_eq!(body.header.local_var_sig_token, 0);
            assert_eq!(body.code.len(), code_size as usize);
            assert!(body.extra_sections.is_none());
            assert_eq!(body.total_size(), code_size as usize + 1);
        }
    }

    #[test]
    fn fat_round_trip() {
        let cases = [
            (MethodBodyFlags::empty(), 0u16, 0usize, 0u32),
            (MethodBodyFlags::INIT_LOCALS, 5, 0x9B, 0x1100_0059),
            (MethodBodyFlags::empty(), 0xFFFF, 64, 0),
            (MethodBodyFlags::INIT_LOCALS, 1, 300, 0x1100_0001),
        ];

        for (flags, max_stack, code_len, local_token) in cases {
            let header = MethodBodyHeader::fat(flags, max_stack, code_len as u32, local_token);
            let body = MethodBody {
                header,
                code: (0..code_len).map(|i| i as u8).collect(),
                extra_sections: None,
            };
            let encoded = body.serialize().unwrap();
            assert_eq!(encoded.len(), FAT_HEADER_SIZE + code_len);
            assert_eq!(MethodBody::parse(&encoded).unwrap(), body);
        }
    }

    #[test]
    fn fat_with_exception_sections() {
        #[rustfmt::skip]
        let sections = [
            0x81, 0x10, 0x00, 0x00,
            0x02, 0x00, 0x08, 0x00, 0x1B, 0x23, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00,
            0x41, 0x1C, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00,
            0x0F, 0x00, 0x00, 0x00, 0x0D, 0x00, 0x00, 0x00, 0x3F, 0x00, 0x00, 0x01,
        ];
        let mut data = fat_with_sections(0x2E, &sections);
        data.extend_from_slice(&[0xCC; 8]);

        let body = MethodBody::parse(&data).unwrap();
        assert!(body.header.init_locals());
        assert_eq!(body.extra_sections.as_deref(), Some(&sections[..]));
        assert_eq!(body.total_size(), data.len() - 8);
        assert_eq!(body.serialize().unwrap(), data[..data.len() - 8].to_vec());

        let handlers = body.exception_handlers().unwrap();
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].flags, ExceptionHandlerFlags::FINALLY);
        assert_eq!(handlers[1].filter_offset, 0x0100_003F);
    }

    #[test]
    fn rejects_bad_headers() {
        // Neither tiny nor fat
        assert!(matches!(
            MethodBody::parse(&[0x00]),
            Err(Error::InvalidMethodBody(_))
        ));
        assert!(MethodBody::parse(&[0x07, 0x30]).is_err());

        for nibble in [0u16, 1, 2, 4, 15] {
            let mut data = vec![0u8; 16];
            data[..2].copy_from_slice(&((nibble << 12) | 0x3).to_le_bytes());
            assert!(matches!(
                MethodBody::parse(&data),
                Err(Error::InvalidMethodBody(_))
            ));
        }

        let negative = MethodBodyHeader::fat(MethodBodyFlags::empty(), 1, 0x8000_0000, 0);
        assert!(negative.write_to(&mut Vec::new()).is_err());

        let mut data = Vec::new();
        push_le(&mut data, 0x3003u16);
        push_le(&mut data, 1u16);
        push_le(&mut data, 0u32);
        push_le(&mut data, 0x0200_0001u32);
        assert!(matches!(
            MethodBody::parse(&data),
            Err(Error::InvalidMethodBody(_))
        ));
    }

    #[test]
    fn rejects_bad_sections() {
        let not_eh = fat_with_sections(4, &[0x00, 0x04, 0x00, 0x00]);
        assert!(matches!(
            MethodBody::parse(&not_eh),
            Err(Error::InvalidMethodBody(_))
        ));

        let reserved_bit = fat_with_sections(4, &[0x03, 0x04, 0x00, 0x00]);
        assert!(!MethodBody::verify(&reserved_bit));

        // Fat section announcing one clause but holding none
        let short = fat_with_sections(4, &[0x41, 0x1C, 0x00, 0x00]);
        assert!(!MethodBody::verify(&short));
    }

    #[test]
    fn verify_fails_on_every_truncation() {
        #[rustfmt::skip]
        let sections = [
            0x01, 0x10, 0x00, 0x00,
            0x02, 0x00, 0x08, 0x00, 0x1B, 0x23, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00,
        ];
        let full = fat_with_sections(0x11, &sections);
        assert!(MethodBody::verify(&full));

        for cut in 0..full.len() {
            assert!(!MethodBody::verify(&full[..cut]), "accepted {cut} bytes");
        }

        let plain = MethodBody::new(2, 0x1100_0002, true, vec![0x2A; 20], None)
            .unwrap()
            .serialize()
            .unwrap();
        for cut in 0..plain.len() {
            assert!(!MethodBody::verify(&plain[..cut]));
        }
    }

    #[test]
    fn prefix_discriminant() {
        assert_eq!(MethodBody::header_size_from_prefix(&[0x0A]).unwrap(), 1);
        assert_eq!(MethodBody::header_size_from_prefix(&[0x13, 0x30]).unwrap(), 12);
        assert!(MethodBody::header_size_from_prefix(&[0x13]).is_err());
        assert!(MethodBody::header_size_from_prefix(&[0x00]).is_err());
    }

    #[test]
    fn new_picks_form() {
        let tiny = MethodBody::new(8, 0, false, vec![0x2A], None).unwrap();
        assert!(tiny.header.is_tiny());
        assert_eq!(tiny.serialize().unwrap(), vec![0x06, 0x2A]);

        let fat = MethodBody::new(8, 0, false, vec![0x00; 64], None).unwrap();
        assert!(!fat.header.is_tiny());
        assert_eq!(fat.header.flags, 0x3003);
    }

    #[test]
    fn read_restores_position_on_failure() {
        let data = [0x13, 0x30, 0x01];
        let mut parser = Parser::new(&data);
        assert!(MethodBody::read(&mut parser).is_err());
        assert_eq!(parser.pos(), 0);
    }
}
