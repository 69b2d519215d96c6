//! CIL method body records.
//!
//! - [`MethodBody`] / [`MethodBodyHeader`]: tiny and fat record codec with strict validation
//! - [`ExceptionHandler`]: clauses decoded on demand from the extra sections span
//! - [`MethodBodyFlags`], [`SectionFlags`]: header and section flag bits

mod body;
mod exceptions;
mod types;

pub use body::*;
pub use exceptions::*;
pub use types::*;
