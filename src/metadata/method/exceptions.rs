//! Exception handler clauses of CIL method bodies.
//!
//! The method codec keeps the extra data sections as an opaque byte span. Callers that need
//! the individual clauses decode that span with [`decode_exception_handlers`].

use bitflags::bitflags;

use crate::{
    file::io::read_le_at,
    metadata::method::SectionFlags,
    Error, Result,
};

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause
        const FILTER = 0x0001;
        /// A finally clause
        const FINALLY = 0x0002;
        /// A fault clause (finally that executes only on exception)
        const FAULT = 0x0004;
    }
}

/// Exception handler defining try/catch/finally blocks within a method.
///
/// # References
/// - ECMA-335 6th Edition, Partition II, Section 25.4.6 - Exception Handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Flags describing the type of exception handler (catch, filter, finally, fault).
    pub flags: ExceptionHandlerFlags,
    /// Offset in bytes of try block from start of the code.
    pub try_offset: u32,
    /// Length in bytes of the try block.
    pub try_length: u32,
    /// Location of the handler for this try block.
    pub handler_offset: u32,
    /// Size of the handler code in bytes.
    pub handler_length: u32,
    /// Class token for typed clauses, filter offset for filter clauses.
    pub filter_offset: u32,
}

const SMALL_CLAUSE_SIZE: usize = 12;
const FAT_CLAUSE_SIZE: usize = 24;

/// Decode every clause of an extra-sections span as returned by the method codec.
///
/// `data` must start at the 4-byte aligned beginning of the first section.
///
/// # Errors
/// Returns [`Error::InvalidMethodBody`] for a non-exception section or undefined flag bits,
/// and [`Error::OutOfBounds`] on truncation.
pub fn decode_exception_handlers(data: &[u8]) -> Result<Vec<ExceptionHandler>> {
    let mut handlers = Vec::new();
    let mut cursor = 0_usize;

    loop {
        cursor = (cursor + 3) & !3;
        let section_start = cursor;
        let kind = SectionFlags::from_bits_retain(read_le_at::<u8>(data, &mut cursor)?);
        if !kind.contains(SectionFlags::EHTABLE) {
            return Err(Error::invalid_body("Not an exception section"));
        }
        if kind.bits() & SectionFlags::UNDEFINED_MASK != 0 {
            return Err(Error::invalid_body("Invalid bits set"));
        }

        if kind.contains(SectionFlags::FAT_FORMAT) {
            cursor = section_start;
            let size = (read_le_at::<u32>(data, &mut cursor)? >> 8) as usize;
            for _ in 0..size / FAT_CLAUSE_SIZE {
                #[allow(clippy::cast_possible_truncation)]
                let flags = read_le_at::<u32>(data, &mut cursor)? as u16;
                handlers.push(ExceptionHandler {
                    flags: ExceptionHandlerFlags::from_bits_retain(flags),
                    try_offset: read_le_at::<u32>(data, &mut cursor)?,
                    try_length: read_le_at::<u32>(data, &mut cursor)?,
                    handler_offset: read_le_at::<u32>(data, &mut cursor)?,
                    handler_length: read_le_at::<u32>(data, &mut cursor)?,
                    filter_offset: read_le_at::<u32>(data, &mut cursor)?,
                });
            }
        } else {
            let size = read_le_at::<u8>(data, &mut cursor)? as usize;
            cursor += 2;
            for _ in 0..size / SMALL_CLAUSE_SIZE {
                handlers.push(ExceptionHandler {
                    flags: ExceptionHandlerFlags::from_bits_retain(read_le_at::<u16>(
                        data,
                        &mut cursor,
                    )?),
                    try_offset: u32::from(read_le_at::<u16>(data, &mut cursor)?),
                    try_length: u32::from(read_le_at::<u8>(data, &mut cursor)?),
                    handler_offset: u32::from(read_le_at::<u16>(data, &mut cursor)?),
                    handler_length: u32::from(read_le_at::<u8>(data, &mut cursor)?),
                    filter_offset: read_le_at::<u32>(data, &mut cursor)?,
                });
            }
        }

        if !kind.contains(SectionFlags::MORE_SECTS) {
            break;
        }
    }

    Ok(handlers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_section() {
        #[rustfmt::skip]
        let data = [
            0x01, 0x10, 0x00, 0x00,
            0x02, 0x00, 0x08, 0x00, 0x1B, 0x23, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00,
        ];
        let handlers = decode_exception_handlers(&data).unwrap();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].flags, ExceptionHandlerFlags::FINALLY);
        assert_eq!(handlers[0].try_offset, 0x8);
        assert_eq!(handlers[0].try_length, 0x1B);
        assert_eq!(handlers[0].handler_offset, 0x23);
        assert_eq!(handlers[0].handler_length, 0xA);
    }

    #[test]
    fn fat_section() {
        let mut data = vec![0x41, 28, 0, 0];
        for value in [0u32, 0, 0xF, 0xF, 0xD, 0x0100_003F] {
            data.extend_from_slice(&value.to_le_bytes());
        }
        let handlers = decode_exception_handlers(&data).unwrap();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].flags, ExceptionHandlerFlags::EXCEPTION);
        assert_eq!(handlers[0].try_length, 0xF);
        assert_eq!(handlers[0].filter_offset, 0x0100_003F);
    }

    #[test]
    fn rejects_bad_sections() {
        assert!(matches!(
            decode_exception_handlers(&[0x00, 0x04, 0x00, 0x00]),
            Err(Error::InvalidMethodBody(_))
        ));
        assert!(matches!(
            decode_exception_handlers(&[0x03, 0x04, 0x00, 0x00]),
            Err(Error::InvalidMethodBody(_))
        ));
        assert!(decode_exception_handlers(&[0x01, 0x10, 0x00, 0x00, 0x02]).is_err());
    }
}
