//! Metadata primitives shared by the recovery engine.
//!
//! # Key Components
//!
//! - [`method`] - Method body record codec and exception clauses
//! - [`token`] - Metadata table row references used throughout .NET

/// Implementation of the method body record codec
pub mod method;
/// Commonly used metadata token type
pub mod token;
