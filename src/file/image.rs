//! Container traits and an owned in-memory image.
//!
//! The engine does not parse PE/metadata structures itself. It consumes an already opened
//! image through [`ContainerImage`] (symbol table rows, resource lookup, RVA translation and
//! the raw bytes) and hands results to the output writer through [`OutputWriter`].
//!
//! [`MemoryImage`] is a complete, owned implementation of both traits. Callers that already
//! have a metadata reader fill it from their tables; [`MemoryImage::from_pe`] fills the section
//! map straight from a PE header.

use std::collections::HashMap;

use crate::{
    metadata::{method::MethodBody, token::Token},
    Result,
};

/// Where a named embedded resource lives inside the raw image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLocation {
    /// File offset of the first byte of resource data
    pub offset: usize,
    /// Length of the resource data in bytes
    pub length: usize,
}

/// One row of the method definition table, reduced to what the engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodRow {
    /// 1-based row index
    pub rid: u32,
    /// RVA of the method header, 0 for methods without a body
    pub rva: u32,
}

impl MethodRow {
    /// Token of the method this row defines.
    #[must_use]
    pub fn token(&self) -> Token {
        Token::method_def(self.rid)
    }
}

/// A method body as laid out by the output writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenMethodBody {
    /// RVA of the header in the output image
    pub rva: u32,
    /// Serialized body, header first
    pub body: Vec<u8>,
}

impl WrittenMethodBody {
    /// RVA of the first code byte, i.e. the header RVA plus the header size.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidMethodBody`] if the body does not start with a valid header.
    pub fn code_rva(&self) -> Result<u32> {
        let header_size = MethodBody::header_size_from_prefix(&self.body)?;
        self.rva
            .checked_add(header_size as u32)
            .ok_or(out_of_bounds_error!())
    }
}

/// Read-only view of a loaded container image.
pub trait ContainerImage {
    /// The whole raw image.
    fn data(&self) -> &[u8];

    /// Every row of the method definition table, in table order.
    fn method_rows(&self) -> &[MethodRow];

    /// Translate an RVA to a file offset, `None` if no section backs it.
    fn rva_to_offset(&self, rva: u32) -> Option<usize>;

    /// Locate an embedded resource by name.
    fn resource_by_name(&self, name: &str) -> Option<ResourceLocation>;

    /// Counter that changes every time the image is replaced by a freshly parsed copy.
    fn generation(&self) -> u64;

    /// Raw bytes of a named resource.
    fn resource_data(&self, name: &str) -> Option<&[u8]> {
        let location = self.resource_by_name(name)?;
        let end = location.offset.checked_add(location.length)?;
        self.data().get(location.offset..end)
    }

    /// Bytes of the image starting at `rva`, up to the end of the file.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the RVA is not file-backed.
    fn slice_at_rva(&self, rva: u32) -> Result<&[u8]> {
        let offset = self.rva_to_offset(rva).ok_or(out_of_bounds_error!())?;
        self.data().get(offset..).ok_or(out_of_bounds_error!())
    }

    /// Returns `true` if the method table has a row for `token`.
    fn contains_method(&self, token: Token) -> bool {
        token.is_method_def() && self.method_rows().iter().any(|row| row.rid == token.row())
    }
}

/// Output-side view used when encrypted payloads are written back.
pub trait OutputWriter {
    /// Returns `true` if the method survived pruning and its declaring type is still emitted.
    fn method_exists(&self, token: Token) -> bool;

    /// Final layout of a method body, if the writer emitted one.
    fn method_body(&self, token: Token) -> Option<WrittenMethodBody>;

    /// Mutable backing bytes of a resource in the output.
    fn resource_data_mut(&mut self, name: &str) -> Option<&mut [u8]>;
}

/// A PE section mapping, as found in the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    /// RVA at which the section is mapped
    pub virtual_address: u32,
    /// Size of the section in memory
    pub virtual_size: u32,
    /// File offset of the section data
    pub raw_offset: u32,
    /// Size of the section data in the file
    pub raw_size: u32,
}

impl Section {
    fn translate(&self, rva: u32) -> Option<usize> {
        let delta = rva.checked_sub(self.virtual_address)?;
        let mapped = self.virtual_size.max(self.raw_size);
        if delta >= mapped || delta >= self.raw_size {
            return None;
        }
        Some(self.raw_offset as usize + delta as usize)
    }
}

/// Owned in-memory container image.
///
/// Without sections, RVAs map one-to-one onto file offsets.
///
/// # Examples
///
/// ```rust
/// use dotreclaim::file::{ContainerImage, MemoryImage, Section};
///
/// let mut image = MemoryImage::new(vec![0u8; 0x400]).with_section(Section {
///     virtual_address: 0x2000,
///     virtual_size: 0x200,
///     raw_offset: 0x200,
///     raw_size: 0x200,
/// });
/// let token = image.add_method(0x2050);
///
/// assert_eq!(image.rva_to_offset(0x2050), Some(0x250));
/// assert!(image.contains_method(token));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    data: Vec<u8>,
    sections: Vec<Section>,
    methods: Vec<MethodRow>,
    resources: HashMap<String, ResourceLocation>,
    generation: u64,
}

impl MemoryImage {
    /// Wrap raw bytes without any section map.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        MemoryImage {
            data,
            ..Default::default()
        }
    }

    /// Wrap a PE file, taking the section map from its section table.
    ///
    /// # Errors
    /// Returns [`crate::Error::GoblinErr`] if the PE headers cannot be parsed.
    pub fn from_pe(data: Vec<u8>) -> Result<Self> {
        let sections = {
            let pe = goblin::pe::PE::parse(&data)?;
            pe.sections
                .iter()
                .map(|section| Section {
                    virtual_address: section.virtual_address,
                    virtual_size: section.virtual_size,
                    raw_offset: section.pointer_to_raw_data,
                    raw_size: section.size_of_raw_data,
                })
                .collect::<Vec<_>>()
        };

        Ok(MemoryImage {
            data,
            sections,
            ..Default::default()
        })
    }

    /// Add a section mapping.
    #[must_use]
    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    /// Register a named resource.
    #[must_use]
    pub fn with_resource(mut self, name: &str, offset: usize, length: usize) -> Self {
        self.resources
            .insert(name.to_string(), ResourceLocation { offset, length });
        self
    }

    /// Append a method table row whose header lives at `rva`; returns its token.
    pub fn add_method(&mut self, rva: u32) -> Token {
        let row = MethodRow {
            rid: self.methods.len() as u32 + 1,
            rva,
        };
        self.methods.push(row);
        row.token()
    }

    /// Mutable access to the raw bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consume the image, returning its raw bytes.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Replace the raw bytes with a freshly produced copy of the same layout.
    ///
    /// Sections, rows and resources stay, the generation moves on so that caches keyed
    /// on the previous bytes are rebuilt.
    pub fn reload(&mut self, data: Vec<u8>) {
        self.data = data;
        self.generation += 1;
    }
}

impl ContainerImage for MemoryImage {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn method_rows(&self) -> &[MethodRow] {
        &self.methods
    }

    fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        let offset = if self.sections.is_empty() {
            rva as usize
        } else {
            self.sections.iter().find_map(|section| section.translate(rva))?
        };

        (offset < self.data.len()).then_some(offset)
    }

    fn resource_by_name(&self, name: &str) -> Option<ResourceLocation> {
        self.resources.get(name).copied()
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

impl OutputWriter for MemoryImage {
    fn method_exists(&self, token: Token) -> bool {
        self.contains_method(token)
    }

    fn method_body(&self, token: Token) -> Option<WrittenMethodBody> {
        let row = self.methods.iter().find(|row| row.token() == token)?;
        if row.rva == 0 {
            return None;
        }

        let data = self.slice_at_rva(row.rva).ok()?;
        let body = MethodBody::parse(data).ok()?;
        Some(WrittenMethodBody {
            rva: row.rva,
            body: data[..body.total_size()].to_vec(),
        })
    }

    fn resource_data_mut(&mut self, name: &str) -> Option<&mut [u8]> {
        let location = self.resources.get(name).copied()?;
        let end = location.offset.checked_add(location.length)?;
        self.data.get_mut(location.offset..end)
    }
}
