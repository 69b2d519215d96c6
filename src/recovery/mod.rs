//! The encrypted payload recovery engine.
//!
//! # Key Components
//!
//! - [`resources`] - Encrypted resource blobs: decryption and framing
//! - [`methods`] - Decrypted method streams: address index, patching, re-encryption
//! - [`patch`] - Dword patch tables
//! - [`strings`] - Magic-keyed string decryption
//! - [`oracle`] - Decryption by supervised execution in a helper process
//! - [`scheme`] - Protection schemes and module states
//! - [`batch`] - Parallel processing of independent files

pub mod batch;
pub mod methods;
pub mod oracle;
pub mod patch;
pub mod resources;
pub mod scheme;
pub mod strings;

pub use batch::{recover_batch, BatchSummary, FileReport, Outcome};
pub use methods::{
    AddressIndex, AddressIndexCache, DumpedMethod, DumpedMethods, MethodPatchEngine,
    MethodStreamFormat, MethodStreamHints, NativeStub, OpaqueMethods,
};
pub use oracle::{OracleConfig, OracleSession, RuntimeVersion, SessionState};
pub use patch::{apply_dword_patches, PatchAddressing, PatchInfo};
pub use resources::{EncryptedResourceContext, RecoveredResource};
pub use scheme::{
    AnalyzedModule, DecryptedModule, ProtectionScheme, RawModule, SchemeKind,
};
pub use strings::StringDecrypters;
