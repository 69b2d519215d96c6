//! Raw image access: bounds-checked integer I/O, the cursor [`parser::Parser`], variable-length
//! encodings, and the container traits through which the engine sees a loaded image.

pub mod image;
pub mod io;
pub mod parser;
pub mod varint;

pub use image::{
    ContainerImage, MemoryImage, MethodRow, OutputWriter, ResourceLocation, Section,
    WrittenMethodBody,
};
