// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # dotreclaim
//!
//! Recovery of encrypted payloads from protected .NET images: method bodies hidden in
//! encrypted patch streams, resources moved into encrypted blobs, dword patch tables, magic-keyed
//! strings, and method bodies that only a supervised run of the target will reveal.
//!
//! ## Features
//!
//! - **Strict method body codec** - tiny and fat records, extra sections, `verify` probing
//! - **Cipher library** - AES, DES and triple DES in CBC mode, XXTEA, XTEA, hashes, inflate
//! - **Resource recovery** - salted length-prefixed framing and key-prefixed DES resources
//! - **Method patch engine** - validated stream layouts, address index, native stub rewriting,
//!   opaque method re-encryption into fixed-size resource slots
//! - **Decryption oracle** - a typed request/response protocol to a helper process that is torn
//!   down on every exit path
//! - **Batch processing** - independent files in parallel, every failure reported per file
//!
//! The crate does not open or write assemblies itself. It sees an image through the
//! [`file::ContainerImage`] and [`file::OutputWriter`] traits; [`file::MemoryImage`] implements
//! both for owned bytes.
//!
//! ## Quick Start
//!
//! ```rust
//! use dotreclaim::{
//!     file::MemoryImage,
//!     recovery::resources::{recover, EncryptedResourceContext},
//!     utils::crypto::{encrypt_cbc, CipherKind},
//! };
//!
//! let key = b"0123456789abcdef";
//! let iv = b"fedcba9876543210";
//!
//! // No entry names, the payload runs to the end
//! let container = [0u8, 0, 0, 0, b'M', b'Z'];
//! let blob = encrypt_cbc(CipherKind::Aes, &container, key, iv)?;
//! let image = MemoryImage::new(blob.clone()).with_resource("data", 0, blob.len());
//!
//! let context = EncryptedResourceContext::new("data", CipherKind::Aes, key, iv);
//! let recovered = recover(&context, &image)?.expect("resource present");
//! assert_eq!(recovered.payload, b"MZ");
//! # Ok::<(), dotreclaim::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - Method body records and metadata tokens
//! - [`utils`] - Stateless cipher, hash, decompression and pattern primitives
//! - [`file`] - Bounds-checked readers, variable-length encodings, container traits
//! - [`recovery`] - The engine: resources, method streams, patches, strings, oracle, schemes
//!
//! ## Error Handling
//!
//! Every operation returns [`Result<T, Error>`](Result). [`Error::is_not_applicable`] separates
//! "this protection is not present" from "recognized but recovery failed", and
//! [`Error::is_fatal_for_file`] marks the errors after which a file must be abandoned.
//!
//! ```rust
//! use dotreclaim::{metadata::method::MethodBody, Error};
//!
//! match MethodBody::parse(&[0x03]) {
//!     Err(e) if e.is_not_applicable() => println!("not a method body: {e}"),
//!     Err(e) => println!("other error: {e}"),
//!     Ok(_) => println!("parsed"),
//! }
//! ```

#[macro_use]
pub(crate) mod error;

/// Raw image access and the container traits
pub mod file;

/// Method body records and metadata tokens
pub mod metadata;

/// The encrypted payload recovery engine
///
/// # Examples
///
/// ```rust
/// use dotreclaim::recovery::methods::xor_mask;
///
/// let mut stream = vec![0u8; 8];
/// xor_mask(&mut stream, 0x0807_0605_0403_0201);
/// assert_eq!(stream, [1, 2, 3, 4, 5, 6, 7, 8]);
/// ```
pub mod recovery;

/// Stateless cipher, hash and decompression primitives
pub mod utils;

/// `dotreclaim` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `dotreclaim` Error type
///
/// The variants are grouped into families that callers treat differently: format errors,
/// decryption errors, resolution misses, oracle faults and consistency errors.
pub use error::Error;

/// Bounds-checked cursor over a byte slice
///
/// # Examples
///
/// ```rust
/// use dotreclaim::Parser;
///
/// let mut parser = Parser::new(&[0x2A, 0x00, 0x00, 0x00]);
/// assert_eq!(parser.read_le::<u32>()?, 42);
/// # Ok::<(), dotreclaim::Error>(())
/// ```
pub use file::parser::Parser;
