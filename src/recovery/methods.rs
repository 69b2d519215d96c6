//! Remapping of decrypted method streams onto the method table.
//!
//! A protector that encrypts method bodies ships them as one stream of records, each naming
//! a code address and carrying the real bytes. [`MethodPatchEngine`] detects which of the
//! three stream layouts is in use, applies direct writes to a copy of the image, resolves
//! every per-method record to its token through an [`AddressIndex`], and collects the result
//! as [`DumpedMethods`] for the writer.
//!
//! Records flagged as native code are either trivial constant-return stubs, which are
//! rewritten to the equivalent CIL, or opaque. Opaque bodies are kept verbatim in
//! [`OpaqueMethods`] and replaced by a placeholder that throws; at output time
//! [`MethodPatchEngine::re_encrypt_opaque_methods`] puts them back into the encrypted resource.
//!
//! # Stream layouts
//!
//! Every stream starts with `patch_count: i32, mode: i32`, where a dword patch is a
//! `(rva: u32, value: u32)` pair.
//!
//! | Layout | Body |
//! |--------|------|
//! | [`MethodStreamFormat::LegacyTokenRva`] | `patch_count` skipped `(token, rva)` pairs, a second header, dword patches, then `(token, dword_count)` groups of dword patches |
//! | [`MethodStreamFormat::RvaTokenSize`] | dword patches, then `(rva, token, size, bytes)` direct writes |
//! | [`MethodStreamFormat::RvaIndexSize`] | dword patches, a method count, then `(code_rva, index, size, bytes)` method records |

use std::collections::{btree_map, hash_map, BTreeMap, HashMap};

use strum::Display;

use crate::{
    file::{io::push_le, parser::Parser, ContainerImage, MethodRow, OutputWriter},
    metadata::{
        method::{
            MethodBody, MethodBodyFlags, MethodBodyHeader, TINY_MAX_CODE_SIZE, TINY_MAX_STACK,
        },
        token::{Token, METHOD_DEF_TABLE},
    },
    recovery::{patch::PatchAddressing, resources::EncryptedResourceContext},
    utils::pattern::{is_code, PatternByte},
    Error, Result,
};

/// Method indices at or above this value mark native code in a method record.
pub const NATIVE_INDEX_BASE: u32 = 0x7000_0000;

/// CIL that replaces an opaque native body: `ldc.i4 0xDEADC0DE; conv.u4; throw`.
pub const OPAQUE_PLACEHOLDER: [u8; 7] = [0x20, 0xDE, 0xC0, 0xAD, 0xDE, 0x6D, 0x7A];

const STREAM_HEADER_SIZE: usize = 12;
const METHOD_RECORD_SIZE: usize = 12;

/// Apply the 64-bit stream mask to `data` in place.
///
/// The key is XOR-ed onto every whole 8-byte little-endian chunk; trailing bytes stay as they
/// are and a zero key leaves the data unchanged. Applying the mask twice restores the input.
pub fn xor_mask(data: &mut [u8], key: i64) {
    if key == 0 {
        return;
    }
    for chunk in data.chunks_exact_mut(8) {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(i64::from_le_bytes(word) ^ key).to_le_bytes());
    }
}

/// Map from the first code byte of every method body to the row that owns it.
///
/// Keys are code addresses, not header addresses: a stream record names the address the
/// runtime would execute, which lies one byte (tiny) or one header (fat) past the row RVA.
#[derive(Debug, Clone, Default)]
pub struct AddressIndex {
    rows: HashMap<u32, MethodRow>,
    generation: u64,
}

impl AddressIndex {
    /// Scan every method row of `image` once.
    ///
    /// Rows without a body (RVA 0) and rows whose header cannot be read are left out. When two
    /// rows share a code address, the later row wins.
    #[must_use]
    pub fn build(image: &impl ContainerImage) -> Self {
        let mut rows = HashMap::with_capacity(image.method_rows().len());

        for row in image.method_rows().iter().filter(|row| row.rva != 0) {
            let header_size = image
                .slice_at_rva(row.rva)
                .and_then(MethodBody::header_size_from_prefix);
            match header_size {
                Ok(size) => {
                    rows.insert(row.rva.wrapping_add(size as u32), *row);
                }
                Err(error) => {
                    log::debug!(
                        "Skipping method {} at RVA {:08X}: {}",
                        row.token(),
                        row.rva,
                        error
                    );
                }
            }
        }

        AddressIndex {
            rows,
            generation: image.generation(),
        }
    }

    /// Token of the method whose code starts at `code_rva`.
    #[must_use]
    pub fn resolve(&self, code_rva: u32) -> Option<Token> {
        self.rows.get(&code_rva).map(MethodRow::token)
    }

    /// Row of the method whose code starts at `code_rva`.
    #[must_use]
    pub fn row(&self, code_rva: u32) -> Option<MethodRow> {
        self.rows.get(&code_rva).copied()
    }

    /// Like [`AddressIndex::row`], but a miss is an error.
    ///
    /// # Errors
    /// Returns [`Error::AddressMiss`] if no method owns `code_rva`.
    pub fn lookup(&self, code_rva: u32) -> Result<MethodRow> {
        self.row(code_rva).ok_or(Error::AddressMiss(code_rva))
    }

    /// Image generation this index was built from.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of indexed methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if no method is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Lazily built [`AddressIndex`] that is rebuilt whenever the image generation moves on.
#[derive(Debug, Clone, Default)]
pub struct AddressIndexCache {
    index: Option<AddressIndex>,
}

impl AddressIndexCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The index for `image`, building it on first use or after a reload.
    pub fn get(&mut self, image: &impl ContainerImage) -> &AddressIndex {
        if self
            .index
            .as_ref()
            .is_some_and(|index| index.generation() != image.generation())
        {
            self.index = None;
        }
        self.index.get_or_insert_with(|| AddressIndex::build(image))
    }

    /// Drop the cached index.
    pub fn invalidate(&mut self) {
        self.index = None;
    }
}

/// Parameters of a method stream that the stream itself does not carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodStreamHints {
    /// The protector hooks the JIT, so per-method records are address/index based
    pub hooks_jitter: bool,
    /// Direct writes address file offsets instead of RVAs
    pub use_file_offsets: bool,
    /// 64-bit stream mask, 0 for none
    pub xor_key: i64,
}

/// Layout of a decrypted method stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MethodStreamFormat {
    /// Token/RVA table followed by grouped dword patches
    LegacyTokenRva,
    /// Direct `(rva, token, size, bytes)` writes
    RvaTokenSize,
    /// Per-method `(code_rva, index, size, bytes)` records
    RvaIndexSize,
}

impl MethodStreamFormat {
    /// Decide the layout of an (unmasked) stream.
    ///
    /// The legacy layout is only chosen when the token word of every pair in the leading table
    /// carries the method table tag. Otherwise the mode word and the hints pick between the
    /// other two. The chosen layout is then walked completely without writing anything; a
    /// stream that does not fit it is rejected.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the stream does not parse as the detected layout and
    /// [`Error::OutOfBounds`] if it is shorter than its header.
    pub fn detect(stream: &[u8], hints: &MethodStreamHints) -> Result<Self> {
        let mut parser = Parser::new(stream);
        let patch_count = parser.read_le::<i32>()?;
        let mode = parser.read_le::<i32>()?;

        let format = if legacy_table_is_tagged(stream, patch_count) {
            MethodStreamFormat::LegacyTokenRva
        } else if !hints.hooks_jitter || mode == 1 {
            MethodStreamFormat::RvaTokenSize
        } else {
            MethodStreamFormat::RvaIndexSize
        };

        walk(stream, format).map_err(|error| {
            malformed_error!("Method stream does not parse as {} - {}", format, error)
        })?;
        Ok(format)
    }
}

fn legacy_table_is_tagged(stream: &[u8], patch_count: i32) -> bool {
    let Ok(count) = usize::try_from(patch_count) else {
        return false;
    };
    let table_end = count.checked_mul(8).and_then(|size| size.checked_add(8));
    let Some(table) = table_end.and_then(|end| stream.get(8..end)) else {
        return false;
    };

    count > 0
        && table
            .chunks_exact(8)
            .all(|pair| pair[3] == METHOD_DEF_TABLE)
}

#[derive(Debug, Clone, Copy)]
enum StreamRecord<'a> {
    Dword { rva: u32, value: [u8; 4] },
    Write { address: u32, data: &'a [u8] },
    Method { code_rva: u32, index: u32, data: &'a [u8] },
}

fn read_count(parser: &mut Parser, what: &str) -> Result<usize> {
    let count = parser.read_le::<i32>()?;
    usize::try_from(count).map_err(|_| malformed_error!("Negative {} {}", what, count))
}

fn read_dwords<'a>(
    parser: &mut Parser<'a>,
    count: usize,
    records: &mut Vec<StreamRecord<'a>>,
) -> Result<()> {
    for _ in 0..count {
        let rva = parser.read_le::<u32>()?;
        let value = parser.read_le::<u32>()?.to_le_bytes();
        records.push(StreamRecord::Dword { rva, value });
    }
    Ok(())
}

fn has_record(parser: &Parser) -> bool {
    parser.pos() + 1 < parser.len()
}

fn walk(stream: &[u8], format: MethodStreamFormat) -> Result<Vec<StreamRecord<'_>>> {
    let mut parser = Parser::new(stream);
    let mut records = Vec::new();

    let patch_count = read_count(&mut parser, "patch count")?;
    let _mode = parser.read_le::<i32>()?;

    match format {
        MethodStreamFormat::LegacyTokenRva => {
            let table_size = patch_count.checked_mul(8).ok_or(out_of_bounds_error!())?;
            parser.advance_by(table_size)?;

            let patch_count = read_count(&mut parser, "patch count")?;
            let _mode = parser.read_le::<i32>()?;
            read_dwords(&mut parser, patch_count, &mut records)?;

            while has_record(&parser) {
                let _token = parser.read_le::<u32>()?;
                let dword_count = read_count(&mut parser, "dword count")?;
                read_dwords(&mut parser, dword_count / 2, &mut records)?;
            }
        }
        MethodStreamFormat::RvaTokenSize => {
            read_dwords(&mut parser, patch_count, &mut records)?;

            while has_record(&parser) {
                let address = parser.read_le::<u32>()?;
                let _token = parser.read_le::<u32>()?;
                let size = parser.read_le::<i32>()?;
                if size > 0 {
                    let data = parser.read_bytes(size as usize)?;
                    records.push(StreamRecord::Write { address, data });
                }
            }
        }
        MethodStreamFormat::RvaIndexSize => {
            read_dwords(&mut parser, patch_count, &mut records)?;
            let _method_count = parser.read_le::<i32>()?;

            while has_record(&parser) {
                let code_rva = parser.read_le::<u32>()?;
                let index = parser.read_le::<u32>()?;
                let size = read_count(&mut parser, "method size")?;
                let data = parser.read_bytes(size)?;
                records.push(StreamRecord::Method {
                    code_rva,
                    index,
                    data,
                });
            }
        }
    }

    Ok(records)
}

const NATIVE_LDC_I4: [PatternByte; 10] = [
    Some(0x55),
    Some(0x8B),
    Some(0xEC),
    Some(0xB8),
    None,
    None,
    None,
    None,
    Some(0x5D),
    Some(0xC3),
];

const NATIVE_LDC_I4_0: [PatternByte; 7] = [
    Some(0x55),
    Some(0x8B),
    Some(0xEC),
    Some(0x33),
    Some(0xC0),
    Some(0x5D),
    Some(0xC3),
];

/// Classification of a native method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeStub {
    /// `push ebp; mov ebp, esp; mov eax, imm32; pop ebp; ret`
    ReturnConstant(u32),
    /// `push ebp; mov ebp, esp; xor eax, eax; pop ebp; ret`
    ReturnZero,
    /// Anything else
    Opaque,
}

impl NativeStub {
    /// Classify x86 code.
    #[must_use]
    pub fn classify(code: &[u8]) -> Self {
        if is_code(&NATIVE_LDC_I4, code) {
            NativeStub::ReturnConstant(u32::from_le_bytes([code[4], code[5], code[6], code[7]]))
        } else if is_code(&NATIVE_LDC_I4_0, code) {
            NativeStub::ReturnZero
        } else {
            NativeStub::Opaque
        }
    }

    /// CIL with the same result: `ldc.i4 imm32; ret`, `ldc.i4.0; ret`, or the throwing
    /// placeholder for opaque code.
    #[must_use]
    pub fn to_cil(&self) -> Vec<u8> {
        match self {
            NativeStub::ReturnConstant(value) => {
                let mut code = Vec::with_capacity(6);
                code.push(0x20);
                code.extend_from_slice(&value.to_le_bytes());
                code.push(0x2A);
                code
            }
            NativeStub::ReturnZero => vec![0x16, 0x2A],
            NativeStub::Opaque => OPAQUE_PLACEHOLDER.to_vec(),
        }
    }
}

/// A method body recovered from a decrypted stream or the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpedMethod {
    /// Method token
    pub token: Token,
    /// RVA of the method header in the image
    pub rva: u32,
    /// Header to emit; `code_size` always matches `code`
    pub header: MethodBodyHeader,
    /// CIL code
    pub code: Vec<u8>,
    /// Raw extra data sections
    pub extra_sections: Option<Vec<u8>>,
}

impl DumpedMethod {
    /// Wrap a complete body.
    #[must_use]
    pub fn from_body(token: Token, rva: u32, body: MethodBody) -> Self {
        DumpedMethod {
            token,
            rva,
            header: body.header,
            code: body.code,
            extra_sections: body.extra_sections,
        }
    }

    /// Keep the header and sections of `original` but replace its code.
    ///
    /// A tiny header that cannot describe the new code is widened to a fat one.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMethodBody`] if the code is too large for any header.
    pub fn with_code(token: Token, rva: u32, original: MethodBody, code: Vec<u8>) -> Result<Self> {
        let code_size =
            u32::try_from(code.len()).map_err(|_| Error::invalid_body("Code too large"))?;

        let mut header = original.header;
        if header.is_tiny() && code_size > TINY_MAX_CODE_SIZE {
            header = MethodBodyHeader::fat(MethodBodyFlags::empty(), TINY_MAX_STACK, code_size, 0);
        }
        header.code_size = code_size;

        Ok(DumpedMethod {
            token,
            rva,
            header,
            code,
            extra_sections: original.extra_sections,
        })
    }

    /// The method as a body record.
    #[must_use]
    pub fn to_body(&self) -> MethodBody {
        MethodBody {
            header: self.header,
            code: self.code.clone(),
            extra_sections: self.extra_sections.clone(),
        }
    }

    /// Encode the method body.
    ///
    /// # Errors
    /// See [`MethodBody::serialize`].
    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.to_body().serialize()
    }
}

/// Token-keyed table of recovered methods, handed to the writer.
///
/// Both the static stream path and the oracle fill the same table; a later entry for a token
/// replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpedMethods {
    methods: HashMap<Token, DumpedMethod>,
}

impl DumpedMethods {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `method`, returning the entry it replaced.
    pub fn add(&mut self, method: DumpedMethod) -> Option<DumpedMethod> {
        self.methods.insert(method.token, method)
    }

    /// Move every entry of `other` into this table, replacing entries with the same token.
    pub fn merge(&mut self, other: DumpedMethods) {
        self.methods.extend(other.methods);
    }

    /// The entry for `token`.
    #[must_use]
    pub fn get(&self, token: Token) -> Option<&DumpedMethod> {
        self.methods.get(&token)
    }

    /// Returns `true` if there is an entry for `token`.
    #[must_use]
    pub fn contains(&self, token: Token) -> bool {
        self.methods.contains_key(&token)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns `true` if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Iterate over all entries in arbitrary order.
    pub fn iter(&self) -> hash_map::Values<'_, Token, DumpedMethod> {
        self.methods.values()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.methods.clear();
    }
}

impl FromIterator<DumpedMethod> for DumpedMethods {
    fn from_iter<I: IntoIterator<Item = DumpedMethod>>(iter: I) -> Self {
        let mut methods = DumpedMethods::new();
        for method in iter {
            methods.add(method);
        }
        methods
    }
}

impl IntoIterator for DumpedMethods {
    type Item = DumpedMethod;
    type IntoIter = hash_map::IntoValues<Token, DumpedMethod>;

    fn into_iter(self) -> Self::IntoIter {
        self.methods.into_values()
    }
}

/// Native bodies that could not be rewritten, kept for re-encryption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpaqueMethods {
    methods: BTreeMap<Token, Vec<u8>>,
}

impl OpaqueMethods {
    /// Store the original bytes of `token`.
    pub fn insert(&mut self, token: Token, code: Vec<u8>) {
        self.methods.insert(token, code);
    }

    /// Original bytes of `token`.
    #[must_use]
    pub fn get(&self, token: Token) -> Option<&[u8]> {
        self.methods.get(&token).map(Vec::as_slice)
    }

    /// Number of stored methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Iterate in token order.
    pub fn iter(&self) -> btree_map::Iter<'_, Token, Vec<u8>> {
        self.methods.iter()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.methods.clear();
    }

    /// Check that every stored method still exists in a reloaded image.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] for the first token the image does not define.
    pub fn rebind(&self, image: &impl ContainerImage) -> Result<()> {
        match self.methods.keys().find(|token| !image.contains_method(**token)) {
            Some(token) => Err(Error::MethodNotFound(*token)),
            None => Ok(()),
        }
    }

    fn surviving<'a>(
        &'a self,
        writer: &'a (impl OutputWriter + ?Sized),
    ) -> impl Iterator<Item = (Token, &'a [u8])> + 'a {
        self.methods.iter().filter_map(move |(token, code)| {
            if writer.method_exists(*token) {
                Some((*token, code.as_slice()))
            } else {
                log::debug!("Opaque method {} was removed, not re-encrypting it", token);
                None
            }
        })
    }

    /// Ciphertext size the re-encrypted stream will have for a cipher with `block_size`
    /// byte blocks, or `None` if no stored method survived into the output.
    ///
    /// The writer reserves exactly this many bytes for the resource.
    #[must_use]
    pub fn prepare_slot(
        &self,
        writer: &(impl OutputWriter + ?Sized),
        block_size: usize,
    ) -> Option<usize> {
        let mut count = 0usize;
        let plain_len = self.surviving(writer).fold(STREAM_HEADER_SIZE, |len, (_, code)| {
            count += 1;
            len + METHOD_RECORD_SIZE + code.len()
        });

        if count == 0 || block_size == 0 {
            return None;
        }
        Some(plain_len - plain_len % block_size + block_size)
    }

    /// Serialize the surviving methods in the [`MethodStreamFormat::RvaIndexSize`] layout,
    /// addressed by their code RVA in the output. Returns the unmasked stream and the number
    /// of methods in it, or `None` when nothing survived.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the writer did not lay out a surviving method.
    pub fn serialize(
        &self,
        writer: &(impl OutputWriter + ?Sized),
    ) -> Result<Option<(Vec<u8>, usize)>> {
        let survivors: Vec<(Token, &[u8])> = self.surviving(writer).collect();
        if survivors.is_empty() {
            return Ok(None);
        }

        let size = survivors.iter().fold(STREAM_HEADER_SIZE, |len, (_, code)| {
            len + METHOD_RECORD_SIZE + code.len()
        });
        let mut stream = Vec::with_capacity(size);
        push_le(&mut stream, 0u32);
        push_le(&mut stream, 0u32);
        push_le(&mut stream, survivors.len() as u32);

        for (index, (token, code)) in survivors.iter().enumerate() {
            let body = writer
                .method_body(*token)
                .ok_or(Error::MethodNotFound(*token))?;
            push_le(&mut stream, body.code_rva()?);
            push_le(&mut stream, NATIVE_INDEX_BASE + index as u32);
            push_le(&mut stream, code.len() as u32);
            stream.extend_from_slice(code);
        }

        Ok(Some((stream, survivors.len())))
    }
}

/// Outcome of [`MethodPatchEngine::apply_decrypted_methods`].
#[derive(Debug, Clone)]
pub struct MethodStreamOutcome {
    /// Detected stream layout
    pub format: MethodStreamFormat,
    /// Recovered per-method bodies
    pub dumped: DumpedMethods,
    /// Number of direct writes made to the image copy
    pub writes: usize,
    /// Code addresses that no method owns
    pub misses: Vec<u32>,
}

/// Applies decrypted method streams to an image and re-encrypts what must stay encrypted.
///
/// One engine serves one input file: the address index and the opaque method table describe
/// that file only. Call [`MethodPatchEngine::reset`] before reusing it.
///
/// # Examples
///
/// ```rust
/// use dotreclaim::{
///     file::{ContainerImage, MemoryImage},
///     recovery::methods::{MethodPatchEngine, MethodStreamFormat, MethodStreamHints},
/// };
///
/// // Tiny body with two code bytes at RVA 0x10, code at 0x11
/// let mut data = vec![0u8; 0x20];
/// data[0x10] = (2 << 2) | 2;
/// let mut image = MemoryImage::new(data);
/// let token = image.add_method(0x10);
///
/// // No dword patches, one method record: code RVA 0x11, index 0, 2 bytes
/// let mut stream = Vec::new();
/// for word in [0i32, 0, 1, 0x11, 0, 2] {
///     stream.extend_from_slice(&word.to_le_bytes());
/// }
/// stream.extend_from_slice(&[0x17, 0x2A]);
///
/// let mut engine = MethodPatchEngine::new(MethodStreamHints {
///     hooks_jitter: true,
///     ..Default::default()
/// });
/// let mut copy = image.data().to_vec();
/// let outcome = engine.apply_decrypted_methods(&stream, &image, &mut copy)?;
///
/// assert_eq!(outcome.format, MethodStreamFormat::RvaIndexSize);
/// assert_eq!(outcome.dumped.get(token).unwrap().code, vec![0x17, 0x2A]);
/// # Ok::<(), dotreclaim::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct MethodPatchEngine {
    hints: MethodStreamHints,
    index: AddressIndexCache,
    opaque: OpaqueMethods,
}

impl MethodPatchEngine {
    /// An engine for streams described by `hints`.
    #[must_use]
    pub fn new(hints: MethodStreamHints) -> Self {
        MethodPatchEngine {
            hints,
            ..Default::default()
        }
    }

    /// Stream parameters.
    #[must_use]
    pub fn hints(&self) -> &MethodStreamHints {
        &self.hints
    }

    /// The address index of `image`, built on first use and after every reload.
    pub fn build_index(&mut self, image: &impl ContainerImage) -> &AddressIndex {
        self.index.get(image)
    }

    /// Native bodies stored for re-encryption.
    #[must_use]
    pub fn opaque_methods(&self) -> &OpaqueMethods {
        &self.opaque
    }

    /// Forget all per-file state.
    pub fn reset(&mut self) {
        self.index.invalidate();
        self.opaque.clear();
    }

    /// Apply a decrypted (still masked) method stream.
    ///
    /// Direct writes and dword patches go into `target`, which must be a copy of
    /// `image.data()`. Every write is translated and bounds-checked before the first one
    /// happens. Method records are resolved against `image`; records whose code address no
    /// method owns are logged and skipped. Headers of resolved methods are read from `target`
    /// after the writes.
    ///
    /// On error `target` may already hold the writes and must be discarded.
    ///
    /// # Errors
    /// Returns a format error if the stream matches no layout, a write falls outside the
    /// image, or the original body of a resolved method cannot be parsed.
    pub fn apply_decrypted_methods(
        &mut self,
        stream: &[u8],
        image: &impl ContainerImage,
        target: &mut [u8],
    ) -> Result<MethodStreamOutcome> {
        let mut stream = stream.to_vec();
        xor_mask(&mut stream, self.hints.xor_key);

        let format = MethodStreamFormat::detect(&stream, &self.hints)?;
        let records = walk(&stream, format)?;
        let direct = if self.hints.use_file_offsets {
            PatchAddressing::FileOffset
        } else {
            PatchAddressing::Rva
        };

        let mut writes = Vec::new();
        for record in &records {
            match record {
                StreamRecord::Dword { rva, value } => {
                    let range = PatchAddressing::Rva.resolve(image, *rva, 4, target.len())?;
                    writes.push((range, &value[..]));
                }
                StreamRecord::Write { address, data } => {
                    let range = direct.resolve(image, *address, data.len(), target.len())?;
                    writes.push((range, *data));
                }
                StreamRecord::Method { .. } => {}
            }
        }
        for (range, data) in &writes {
            target[range.clone()].copy_from_slice(data);
        }

        let mut dumped = DumpedMethods::new();
        let mut misses = Vec::new();
        let index = self.index.get(image);
        for record in &records {
            let StreamRecord::Method {
                code_rva,
                index: method_index,
                data,
            } = *record
            else {
                continue;
            };

            let Some(row) = index.row(code_rva) else {
                log::warn!("Could not find method having code RVA {:08X}", code_rva);
                misses.push(code_rva);
                continue;
            };
            let token = row.token();

            let code = if method_index >= NATIVE_INDEX_BASE {
                let stub = NativeStub::classify(data);
                if stub == NativeStub::Opaque {
                    self.opaque.insert(token, data.to_vec());
                }
                stub.to_cil()
            } else {
                data.to_vec()
            };

            let offset = image.rva_to_offset(row.rva).ok_or(out_of_bounds_error!())?;
            let original =
                MethodBody::parse(target.get(offset..).ok_or(out_of_bounds_error!())?)?;
            dumped.add(DumpedMethod::with_code(token, row.rva, original, code)?);
        }

        log::info!(
            "Method stream ({}): {} writes, {} methods, {} opaque, {} unresolved",
            format,
            writes.len(),
            dumped.len(),
            self.opaque.len(),
            misses.len()
        );

        Ok(MethodStreamOutcome {
            format,
            dumped,
            writes: writes.len(),
            misses,
        })
    }

    /// Re-encrypt the opaque methods that survived into the output and overwrite the
    /// resource named by `context` with the ciphertext. Returns the number of methods written.
    ///
    /// # Errors
    /// Returns [`Error::Consistency`] if the ciphertext does not exactly fill the resource slot,
    /// [`Error::NotFound`] if the writer has no such resource and [`Error::MethodNotFound`] if a
    /// surviving method has no body in the output.
    pub fn re_encrypt_opaque_methods(
        &self,
        writer: &mut (impl OutputWriter + ?Sized),
        context: &EncryptedResourceContext,
    ) -> Result<usize> {
        let Some((mut stream, count)) = self.opaque.serialize(writer)? else {
            return Ok(0);
        };
        xor_mask(&mut stream, self.hints.xor_key);
        let encrypted = context.encrypt(&stream)?;

        let slot = writer
            .resource_data_mut(&context.resource_name)
            .ok_or_else(|| Error::NotFound(format!("resource '{}'", context.resource_name)))?;
        if slot.len() != encrypted.len() {
            return Err(Error::Consistency {
                expected: slot.len(),
                actual: encrypted.len(),
            });
        }
        slot.copy_from_slice(&encrypted);

        log::info!(
            "Re-encrypted {} opaque methods into '{}'",
            count,
            context.resource_name
        );
        Ok(count)
    }
}
