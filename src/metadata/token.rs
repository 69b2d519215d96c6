use std::fmt;

/// Table tag of the method definition table.
pub const METHOD_DEF_TABLE: u8 = 0x06;

/// Table tag of standalone signatures; local variable signature tokens carry it.
pub const STANDALONE_SIG_TABLE: u8 = 0x11;

/// A metadata token representing a reference to a metadata table entry.
///
/// Tokens in .NET metadata consist of a 32-bit value where:
/// - The high byte (bits 24-31) indicates the table type
/// - The low 24 bits (bits 0-23) indicate the row index within that table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates the method definition token for the given 1-based row
    #[must_use]
    pub fn method_def(rid: u32) -> Self {
        Token((u32::from(METHOD_DEF_TABLE) << 24) | (rid & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if this token points into the method definition table
    #[must_use]
    pub fn is_method_def(&self) -> bool {
        self.table() == METHOD_DEF_TABLE && self.row() != 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts() {
        let token = Token(0x0600_0123);
        assert_eq!(token.table(), METHOD_DEF_TABLE);
        assert_eq!(token.row(), 0x123);
        assert!(token.is_method_def());
        assert!(!Token(0x0600_0000).is_method_def());
        assert!(!Token(0x0200_0001).is_method_def());
        assert!(Token(0).is_null());
    }

    #[test]
    fn method_def_constructor() {
        assert_eq!(Token::method_def(1), Token(0x0600_0001));
        assert_eq!(Token::method_def(0x1FF_FFFF), Token(0x06FF_FFFF));
    }

    #[test]
    fn formatting() {
        let token = Token(0x0600_0001);
        assert_eq!(format!("{}", token), "0x06000001");
        let debug_str = format!("{:?}", token);
        assert!(debug_str.contains("table: 0x06"));
        assert!(debug_str.contains("row: 1"));
    }

    #[test]
    fn conversions() {
        let token: Token = 0x0600_0002u32.into();
        let raw: u32 = token.into();
        assert_eq!(raw, 0x0600_0002);
    }
}
