//! Stateless primitives used by the recovery engine.
//!
//! Every function here is pure and reentrant; none keeps state between calls, so they can be
//! used from worker threads processing independent files.

pub mod crypto;
pub mod decompress;
pub mod pattern;
pub mod tea;
