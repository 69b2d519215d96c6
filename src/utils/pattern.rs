//! Byte patterns with wildcards.

/// One position of a [`BytePattern`].
pub type PatternByte = Option<u8>;

/// A fixed-length byte pattern where `None` matches any byte.
pub type BytePattern<'a> = &'a [PatternByte];

/// Returns `true` if `code` has the same length as `pattern` and matches it at every
/// non-wildcard position.
///
/// # Examples
///
/// ```rust
/// use dotreclaim::utils::pattern::is_code;
///
/// let pattern = [Some(0xB8), None, None, None, None, Some(0xC3)];
/// assert!(is_code(&pattern, &[0xB8, 1, 2, 3, 4, 0xC3]));
/// assert!(!is_code(&pattern, &[0xB8, 1, 2, 3, 4, 0xC3, 0x90]));
/// ```
#[must_use]
pub fn is_code(pattern: BytePattern, code: &[u8]) -> bool {
    pattern.len() == code.len()
        && pattern
            .iter()
            .zip(code)
            .all(|(expected, actual)| expected.map_or(true, |byte| byte == *actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards() {
        let pattern = [Some(0x55), None, Some(0xC3)];
        assert!(is_code(&pattern, &[0x55, 0x00, 0xC3]));
        assert!(is_code(&pattern, &[0x55, 0xFF, 0xC3]));
        assert!(!is_code(&pattern, &[0x56, 0x00, 0xC3]));
        assert!(!is_code(&pattern, &[0x55, 0x00]));
        assert!(is_code(&[], &[]));
    }
}
