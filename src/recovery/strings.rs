//! Magic-keyed string decryption.
//!
//! The decrypter methods take `(string encrypted, int value)`. Each one has its own constant
//! `magic`; the low byte of `magic + value` seeds a rolling key that is XOR-ed onto both bytes
//! of every UTF-16 unit, after which the two bytes swap places.

use std::collections::HashMap;

use crate::{metadata::token::Token, Error, Result};

/// Decrypt UTF-16 units with the rolling key seeded from `magic + value`.
#[must_use]
pub fn decrypt_utf16(encrypted: &[u16], magic: i32, value: i32) -> Vec<u16> {
    let mut key = magic.wrapping_add(value) as u8;
    encrypted
        .iter()
        .map(|&unit| {
            let high = (unit as u8) ^ key;
            key = key.wrapping_add(1);
            let low = ((unit >> 8) as u8) ^ key;
            key = key.wrapping_add(1);
            (u16::from(high) << 8) | u16::from(low)
        })
        .collect()
}

/// The string decrypter methods found in one module, with their magic constants.
#[derive(Debug, Clone, Default)]
pub struct StringDecrypters {
    magics: HashMap<Token, i32>,
}

impl StringDecrypters {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the decrypter `method` with its `magic`.
    pub fn add(&mut self, method: Token, magic: i32) {
        log::debug!("String decrypter {}, magic 0x{:08X}", method, magic);
        self.magics.insert(method, magic);
    }

    /// Returns `true` if any decrypter was registered.
    #[must_use]
    pub fn is_detected(&self) -> bool {
        !self.magics.is_empty()
    }

    /// Tokens of every registered decrypter.
    pub fn methods(&self) -> impl Iterator<Item = Token> + '_ {
        self.magics.keys().copied()
    }

    /// Magic constant of `method`.
    #[must_use]
    pub fn magic(&self, method: Token) -> Option<i32> {
        self.magics.get(&method).copied()
    }

    /// Decrypt the UTF-16 units of a call to `method`.
    ///
    /// The result is returned as is, unpaired surrogates included, the way the runtime would
    /// hand it to the program.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if `method` is not a registered decrypter.
    pub fn decrypt_units(
        &self,
        method: Token,
        encrypted: &[u16],
        value: i32,
    ) -> Result<Vec<u16>> {
        let magic = self
            .magic(method)
            .ok_or_else(|| Error::NotFound(format!("string decrypter {method}")))?;
        Ok(decrypt_utf16(encrypted, magic, value))
    }

    /// Decrypt the arguments of a call to `method` into a Rust string.
    ///
    /// Plaintext with unpaired surrogates has no `String` form; use
    /// [`StringDecrypters::decrypt_units`] to keep it.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if `method` is not a registered decrypter and
    /// [`Error::Malformed`] if the plaintext is not valid UTF-16.
    pub fn decrypt(&self, method: Token, encrypted: &str, value: i32) -> Result<String> {
        let units: Vec<u16> = encrypted.encode_utf16().collect();
        String::from_utf16(&self.decrypt_units(method, &units, value)?)
            .map_err(|_| malformed_error!("Decrypted string of {} is not valid UTF-16", method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt_utf16(plain: &str, magic: i32, value: i32) -> Vec<u16> {
        let mut key = magic.wrapping_add(value) as u8;
        plain
            .encode_utf16()
            .map(|unit| {
                let low = ((unit >> 8) as u8) ^ key;
                key = key.wrapping_add(1);
                let high = (unit as u8) ^ key;
                key = key.wrapping_add(1);
                (u16::from(high) << 8) | u16::from(low)
            })
            .collect()
    }

    #[test]
    fn known_vector() {
        // key 0x12: low byte 0x41 ^ 0x12 = 0x53 moves up, high byte 0x00 ^ 0x13 moves down
        assert_eq!(decrypt_utf16(&[0x0041], 0x10, 2), vec![0x5313]);
        assert_eq!(decrypt_utf16(&[], 0x10, 2), Vec::<u16>::new());
    }

    #[test]
    fn key_wraps_around() {
        let encrypted = encrypt_utf16("wrap", 0xFF, 0x7FFF_FFFF);
        assert_eq!(
            String::from_utf16(&decrypt_utf16(&encrypted, 0xFF, 0x7FFF_FFFF)).unwrap(),
            "wrap"
        );
    }

    #[test]
    fn decrypters_by_method() {
        let method = Token::method_def(7);
        let mut decrypters = StringDecrypters::new();
        assert!(!decrypters.is_detected());
        decrypters.add(method, 0x1234);
        assert!(decrypters.is_detected());
        assert_eq!(decrypters.methods().collect::<Vec<_>>(), vec![method]);

        let encrypted = String::from_utf16(&encrypt_utf16("Hello", 0x1234, 99)).unwrap();
        assert_eq!(decrypters.decrypt(method, &encrypted, 99).unwrap(), "Hello");
        assert!(matches!(
            decrypters.decrypt(Token::method_def(8), &encrypted, 99),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn unpaired_surrogates_survive_as_units() {
        let method = Token::method_def(3);
        let mut decrypters = StringDecrypters::new();
        decrypters.add(method, 0x10);

        // key 0x12 turns 0x13CA into the lone high surrogate 0xD800
        assert_eq!(
            decrypters.decrypt_units(method, &[0x13CA], 2).unwrap(),
            vec![0xD800]
        );
        assert!(matches!(
            decrypters.decrypt(method, "\u{13CA}", 2),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            decrypters.decrypt_units(Token::method_def(4), &[0x13CA], 2),
            Err(Error::NotFound(_))
        ));
    }
}
