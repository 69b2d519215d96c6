use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! decryption_error {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        crate::Error::Decryption(format!($fmt $(, $arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into five families, and callers are expected to treat them differently:
///
/// ## Format errors (local, recoverable)
/// - [`Error::InvalidMethodBody`] - A method body record could not be parsed
/// - [`Error::Malformed`] - Corrupted or non-standard binary structure
/// - [`Error::OutOfBounds`] - A read or write would leave the buffer
///
/// A format error means "this interpretation does not apply". Signature detectors probing
/// candidate decrypters rely on this and simply try the next candidate.
///
/// ## Decryption errors (abort the current resource or method)
/// - [`Error::Decryption`] - Cipher input invalid (padding, block alignment, key size)
/// - [`Error::Decompression`] - Inflate/gunzip failed or the stream was incomplete
///
/// ## Resolution misses (non-fatal)
/// - [`Error::AddressMiss`] - A decrypted tuple references a code address that no method owns
///
/// ## Oracle faults (fatal for the current file only)
/// - [`Error::OracleProtocol`] - Helper crashed, desynchronised, or sent garbage
/// - [`Error::OracleTimeout`] - Helper did not answer in time
///
/// ## Consistency errors (fatal for the output of the current file)
/// - [`Error::Consistency`] - A re-encrypted payload does not fit its fixed-size slot
///
/// # Examples
///
/// ```rust
/// use dotreclaim::{metadata::method::MethodBody, Error};
///
/// match MethodBody::parse(&[0x00]) {
///     Err(Error::InvalidMethodBody(reason)) => println!("not a method body: {reason}"),
///     Err(e) => eprintln!("other error: {e}"),
///     Ok(_) => unreachable!(),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A method body record is not a valid tiny or fat body.
    ///
    /// Raised by the method codec for every rejected header, bad extra section, or
    /// truncation. It is always recoverable: the caller may retry with another
    /// interpretation of the same bytes.
    #[error("Invalid method body - {0}")]
    InvalidMethodBody(String),

    /// The data is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    ///
    /// Raised both for reads past the end of a buffer and for patch writes that would
    /// land outside the image copy.
    #[error("Out of Bound access would have occurred! - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The cipher rejected its input.
    #[error("Decryption failed - {0}")]
    Decryption(String),

    /// A compressed stream could not be inflated.
    #[error("Decompression failed - {0}")]
    Decompression(String),

    /// A decrypted method references a code address that is not in the address index.
    #[error("No method owns code address 0x{0:08X}")]
    AddressMiss(u32),

    /// A named item (resource, method) does not exist.
    ///
    /// For resources and decrypters this signals that the protection feature is absent,
    /// not that recovery failed.
    #[error("Not found - {0}")]
    NotFound(String),

    /// The decryption oracle broke the request/response protocol.
    ///
    /// The helper process has already been torn down when this error is observed.
    #[error("Oracle protocol fault during '{stage}': {message}")]
    OracleProtocol {
        /// Wire stage in which the fault happened
        stage: &'static str,
        /// Description of the fault
        message: String,
    },

    /// The decryption oracle did not respond within the configured timeout.
    #[error("Oracle timed out during '{stage}'")]
    OracleTimeout {
        /// Wire stage in which the timeout happened
        stage: &'static str,
    },

    /// A re-encrypted payload does not match the size of its resource slot.
    #[error("Re-encrypted payload is {actual} bytes, but the resource slot holds {expected}")]
    Consistency {
        /// Size of the slot in the output image
        expected: usize,
        /// Size of the freshly produced ciphertext
        actual: usize,
    },

    /// A method token could not be resolved in the (reloaded) image.
    #[error("Could not find method {0}")]
    MethodNotFound(Token),

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Oracle message (de)serialization error.
    #[error("{0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),
}

impl Error {
    /// Returns `true` when this error means "this protection is not present / does not apply",
    /// as opposed to "protection recognized, but recovery failed".
    #[must_use]
    pub fn is_not_applicable(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::InvalidMethodBody(_)
                | Error::Malformed { .. }
                | Error::OutOfBounds { .. }
        )
    }

    /// Returns `true` for errors after which processing of the current file must be abandoned.
    #[must_use]
    pub fn is_fatal_for_file(&self) -> bool {
        matches!(
            self,
            Error::OracleProtocol { .. }
                | Error::OracleTimeout { .. }
                | Error::Consistency { .. }
                | Error::MethodNotFound(_)
        )
    }

    /// Builds an [`Error::InvalidMethodBody`] from any message.
    pub(crate) fn invalid_body(reason: impl Into<String>) -> Self {
        Error::InvalidMethodBody(reason.into())
    }
}
