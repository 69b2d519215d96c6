//! Protection schemes and the module states they move an image through.
//!
//! Every supported protection is one [`ProtectionScheme`]: a small value holding the
//! parameters the detection layer found (resource name, key material, patch table, oracle
//! configuration) and composing the shared primitives of this crate. A scheme has four
//! capabilities:
//!
//! - `locate` - cheap check whether the protection is present in an image
//! - `decrypt` - produce the plaintext [`Payload`] without touching the image
//! - `patch` - apply the payload to a copy of the image bytes
//! - `write_back` - re-encrypt what has to stay encrypted in the output
//!
//! A module is processed in explicit steps, each its own value:
//!
//! ```text
//! RawModule --analyze--> AnalyzedModule --decrypt--> DecryptedModule
//! ```
//!
//! After every scheme that changed bytes the image is reloaded from the patched copy, so the
//! next scheme sees the decrypted code and caches keyed on the image generation are rebuilt.
//!
//! # Examples
//!
//! ```rust
//! use dotreclaim::{
//!     file::{ContainerImage, MemoryImage},
//!     recovery::{
//!         patch::PatchInfo,
//!         scheme::{MemoryPatchScheme, RawModule, SchemeKind},
//!     },
//! };
//!
//! let image = MemoryImage::new(vec![0u8; 0x100]);
//! let patch = PatchInfo::new(vec![0x40], vec![[0xDE, 0xAD, 0xBE, 0xEF]])?;
//!
//! let analyzed = RawModule::new(image).analyze(vec![Box::new(MemoryPatchScheme::new(patch))]);
//! assert_eq!(analyzed.kinds(), vec![SchemeKind::MemoryPatch]);
//!
//! let decrypted = analyzed.decrypt()?;
//! assert_eq!(&decrypted.image().data()[0x40..0x44], &[0xDE, 0xAD, 0xBE, 0xEF]);
//! # Ok::<(), dotreclaim::Error>(())
//! ```

use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    file::{ContainerImage, MemoryImage, OutputWriter},
    recovery::{
        methods::{DumpedMethods, MethodPatchEngine, MethodStreamHints},
        oracle::{decrypt_methods_out_of_process, OracleConfig, RuntimeVersion, TargetSource},
        patch::{apply_dword_patches, PatchAddressing, PatchInfo},
        resources::{recover, recover_key_prefixed, EncryptedResourceContext, RecoveredResource},
    },
    Error, Result,
};

/// The kinds of protection this crate recovers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum SchemeKind {
    /// Method bodies stored in an encrypted resource as a patch stream
    NativeMethods,
    /// Resources moved into one encrypted blob
    Resource,
    /// Dword patches applied to the loaded image
    MemoryPatch,
    /// Method bodies only obtainable by running the target
    Oracle,
}

/// Plaintext produced by [`ProtectionScheme::decrypt`].
#[derive(Debug, Clone, IntoStaticStr)]
pub enum Payload {
    /// Nothing to decrypt; everything happens in `patch`
    Nothing,
    /// A decrypted method stream
    MethodStream(Vec<u8>),
    /// A recovered resource payload
    Resource(RecoveredResource),
    /// Complete method bodies
    Methods(DumpedMethods),
}

/// What one scheme contributed to a module.
#[derive(Debug, Clone, Default)]
pub struct SchemeOutcome {
    /// Recovered method bodies
    pub methods: DumpedMethods,
    /// Recovered resource payloads
    pub resources: Vec<RecoveredResource>,
    /// Number of byte ranges overwritten in the image copy
    pub writes: usize,
}

/// One protection, with the parameters found for a particular module.
pub trait ProtectionScheme: Send {
    /// Which protection this is.
    fn kind(&self) -> SchemeKind;

    /// Returns `true` if the protection is present in `image`.
    fn locate(&self, image: &MemoryImage) -> bool;

    /// Decrypt the protected material.
    ///
    /// # Errors
    /// Returns a decryption or format error if the material does not decrypt.
    fn decrypt(&self, image: &MemoryImage) -> Result<Payload>;

    /// Apply `payload` to `target`, a copy of the bytes of `image`.
    ///
    /// # Errors
    /// Returns a format error if the payload does not fit the image.
    fn patch(
        &mut self,
        image: &MemoryImage,
        payload: Payload,
        target: &mut [u8],
    ) -> Result<SchemeOutcome>;

    /// Check per-module state against the final, reloaded image.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if state refers to a method the image lacks.
    fn rebind(&self, _image: &MemoryImage) -> Result<()> {
        Ok(())
    }

    /// Re-encrypt into `output` whatever must stay encrypted; returns the number of items
    /// written.
    ///
    /// # Errors
    /// Returns [`Error::Consistency`] if a re-encrypted payload does not fit its slot.
    fn write_back(&self, _output: &mut dyn OutputWriter) -> Result<usize> {
        Ok(0)
    }
}

fn unexpected_payload(kind: SchemeKind, payload: &Payload) -> Error {
    let name: &'static str = payload.into();
    malformed_error!("{} scheme cannot apply a {} payload", kind, name)
}

/// Method bodies kept in an encrypted resource as a patch stream.
#[derive(Debug, Clone)]
pub struct NativeMethodsScheme {
    context: EncryptedResourceContext,
    engine: MethodPatchEngine,
}

impl NativeMethodsScheme {
    /// Scheme reading the stream from the resource described by `context`.
    #[must_use]
    pub fn new(context: EncryptedResourceContext, hints: MethodStreamHints) -> Self {
        NativeMethodsScheme {
            context,
            engine: MethodPatchEngine::new(hints),
        }
    }

    /// The engine holding the opaque methods of the processed module.
    #[must_use]
    pub fn engine(&self) -> &MethodPatchEngine {
        &self.engine
    }
}

impl ProtectionScheme for NativeMethodsScheme {
    fn kind(&self) -> SchemeKind {
        SchemeKind::NativeMethods
    }

    fn locate(&self, image: &MemoryImage) -> bool {
        image.resource_by_name(&self.context.resource_name).is_some()
    }

    fn decrypt(&self, image: &MemoryImage) -> Result<Payload> {
        Ok(match self.context.decrypt_resource(image)? {
            Some((_, stream)) => Payload::MethodStream(stream),
            None => Payload::Nothing,
        })
    }

    fn patch(
        &mut self,
        image: &MemoryImage,
        payload: Payload,
        target: &mut [u8],
    ) -> Result<SchemeOutcome> {
        match payload {
            Payload::Nothing => Ok(SchemeOutcome::default()),
            Payload::MethodStream(stream) => {
                let outcome = self.engine.apply_decrypted_methods(&stream, image, target)?;
                Ok(SchemeOutcome {
                    methods: outcome.dumped,
                    resources: Vec::new(),
                    writes: outcome.writes,
                })
            }
            other => Err(unexpected_payload(self.kind(), &other)),
        }
    }

    fn rebind(&self, image: &MemoryImage) -> Result<()> {
        self.engine.opaque_methods().rebind(image)
    }

    fn write_back(&self, output: &mut dyn OutputWriter) -> Result<usize> {
        self.engine.re_encrypt_opaque_methods(output, &self.context)
    }
}

/// How a protected resource is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceLayout {
    /// Encrypted with known key material, then framed
    Framed(EncryptedResourceContext),
    /// DES key and IV stored in front of the ciphertext
    KeyPrefixed(String),
}

impl ResourceLayout {
    fn resource_name(&self) -> &str {
        match self {
            ResourceLayout::Framed(context) => &context.resource_name,
            ResourceLayout::KeyPrefixed(name) => name,
        }
    }
}

/// Resources moved into one encrypted blob.
#[derive(Debug, Clone)]
pub struct ResourceScheme {
    layout: ResourceLayout,
}

impl ResourceScheme {
    /// Scheme for a resource stored in `layout`.
    #[must_use]
    pub fn new(layout: ResourceLayout) -> Self {
        ResourceScheme { layout }
    }
}

impl ProtectionScheme for ResourceScheme {
    fn kind(&self) -> SchemeKind {
        SchemeKind::Resource
    }

    fn locate(&self, image: &MemoryImage) -> bool {
        image.resource_by_name(self.layout.resource_name()).is_some()
    }

    fn decrypt(&self, image: &MemoryImage) -> Result<Payload> {
        let recovered = match &self.layout {
            ResourceLayout::Framed(context) => recover(context, image)?,
            ResourceLayout::KeyPrefixed(name) => recover_key_prefixed(image, name)?,
        };
        Ok(recovered.map_or(Payload::Nothing, Payload::Resource))
    }

    fn patch(
        &mut self,
        _image: &MemoryImage,
        payload: Payload,
        _target: &mut [u8],
    ) -> Result<SchemeOutcome> {
        match payload {
            Payload::Nothing => Ok(SchemeOutcome::default()),
            Payload::Resource(resource) => Ok(SchemeOutcome {
                resources: vec![resource],
                ..Default::default()
            }),
            other => Err(unexpected_payload(self.kind(), &other)),
        }
    }
}

/// Dword patches applied to the image.
#[derive(Debug, Clone)]
pub struct MemoryPatchScheme {
    patch: PatchInfo,
    addressing: PatchAddressing,
}

impl MemoryPatchScheme {
    /// Scheme applying `patch` at RVAs.
    #[must_use]
    pub fn new(patch: PatchInfo) -> Self {
        MemoryPatchScheme {
            patch,
            addressing: PatchAddressing::Rva,
        }
    }

    /// Interpret the patch offsets with `addressing`.
    #[must_use]
    pub fn with_addressing(mut self, addressing: PatchAddressing) -> Self {
        self.addressing = addressing;
        self
    }
}

impl ProtectionScheme for MemoryPatchScheme {
    fn kind(&self) -> SchemeKind {
        SchemeKind::MemoryPatch
    }

    fn locate(&self, _image: &MemoryImage) -> bool {
        !self.patch.is_empty()
    }

    fn decrypt(&self, _image: &MemoryImage) -> Result<Payload> {
        Ok(Payload::Nothing)
    }

    fn patch(
        &mut self,
        image: &MemoryImage,
        payload: Payload,
        target: &mut [u8],
    ) -> Result<SchemeOutcome> {
        if !matches!(payload, Payload::Nothing) {
            return Err(unexpected_payload(self.kind(), &payload));
        }

        let writes = apply_dword_patches(&self.patch, image, target, self.addressing)?;
        Ok(SchemeOutcome {
            writes,
            ..Default::default()
        })
    }
}

/// Method bodies obtained from a supervised run of the target.
#[derive(Debug, Clone)]
pub struct OracleScheme {
    config: OracleConfig,
    runtime: RuntimeVersion,
    module_cctor: Vec<u8>,
}

impl OracleScheme {
    /// Scheme running the target on `runtime`, bootstrapped with `module_cctor`.
    #[must_use]
    pub fn new(config: OracleConfig, runtime: RuntimeVersion, module_cctor: Vec<u8>) -> Self {
        OracleScheme {
            config,
            runtime,
            module_cctor,
        }
    }
}

impl ProtectionScheme for OracleScheme {
    fn kind(&self) -> SchemeKind {
        SchemeKind::Oracle
    }

    fn locate(&self, image: &MemoryImage) -> bool {
        self.config.helper_for(self.runtime).is_some() && !image.method_rows().is_empty()
    }

    fn decrypt(&self, image: &MemoryImage) -> Result<Payload> {
        let methods = decrypt_methods_out_of_process(
            &self.config,
            self.runtime,
            TargetSource::Bytes(image.data().to_vec()),
            &self.module_cctor,
        )?;
        Ok(Payload::Methods(methods))
    }

    fn patch(
        &mut self,
        _image: &MemoryImage,
        payload: Payload,
        _target: &mut [u8],
    ) -> Result<SchemeOutcome> {
        match payload {
            Payload::Methods(methods) => Ok(SchemeOutcome {
                methods,
                ..Default::default()
            }),
            other => Err(unexpected_payload(self.kind(), &other)),
        }
    }
}

/// A freshly opened module, nothing known about its protection yet.
#[derive(Debug)]
pub struct RawModule {
    image: MemoryImage,
}

impl RawModule {
    /// Wrap an opened image.
    #[must_use]
    pub fn new(image: MemoryImage) -> Self {
        RawModule { image }
    }

    /// The image.
    #[must_use]
    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    /// Keep the candidate schemes whose protection is present.
    #[must_use]
    pub fn analyze(self, candidates: Vec<Box<dyn ProtectionScheme>>) -> AnalyzedModule {
        let schemes: Vec<_> = candidates
            .into_iter()
            .filter(|scheme| {
                let found = scheme.locate(&self.image);
                log::debug!("Scheme {} present: {}", scheme.kind(), found);
                found
            })
            .collect();

        AnalyzedModule {
            image: self.image,
            schemes,
        }
    }
}

/// A module with the schemes bound to it.
pub struct AnalyzedModule {
    image: MemoryImage,
    schemes: Vec<Box<dyn ProtectionScheme>>,
}

impl AnalyzedModule {
    /// The image.
    #[must_use]
    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    /// Kinds of the bound schemes, in application order.
    #[must_use]
    pub fn kinds(&self) -> Vec<SchemeKind> {
        self.schemes.iter().map(|scheme| scheme.kind()).collect()
    }

    /// Returns `true` if any protection was found.
    #[must_use]
    pub fn is_protected(&self) -> bool {
        !self.schemes.is_empty()
    }

    /// Run every bound scheme in order, reloading the image after each one that wrote.
    ///
    /// Method tables of later schemes replace entries of earlier ones for the same token.
    ///
    /// # Errors
    /// Returns the first error of any scheme; the module is lost in that case.
    pub fn decrypt(self) -> Result<DecryptedModule> {
        let AnalyzedModule {
            mut image,
            mut schemes,
        } = self;
        let mut methods = DumpedMethods::new();
        let mut resources = Vec::new();

        for scheme in &mut schemes {
            let kind = scheme.kind();
            let mut target = image.data().to_vec();
            let outcome = scheme
                .decrypt(&image)
                .and_then(|payload| scheme.patch(&image, payload, &mut target))
                .inspect_err(|error| log::warn!("Scheme {} failed: {}", kind, error))?;

            log::debug!(
                "Scheme {}: {} methods, {} resources, {} writes",
                kind,
                outcome.methods.len(),
                outcome.resources.len(),
                outcome.writes
            );
            if outcome.writes > 0 {
                image.reload(target);
            }
            methods.merge(outcome.methods);
            resources.extend(outcome.resources);
        }

        for scheme in &schemes {
            scheme.rebind(&image)?;
        }

        Ok(DecryptedModule {
            image,
            methods,
            resources,
            schemes,
        })
    }
}

/// A module after every bound scheme ran.
pub struct DecryptedModule {
    image: MemoryImage,
    methods: DumpedMethods,
    resources: Vec<RecoveredResource>,
    schemes: Vec<Box<dyn ProtectionScheme>>,
}

impl DecryptedModule {
    /// The patched image.
    #[must_use]
    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    /// Recovered method bodies for the writer.
    #[must_use]
    pub fn methods(&self) -> &DumpedMethods {
        &self.methods
    }

    /// Recovered resource payloads, to be merged as nested modules.
    #[must_use]
    pub fn resources(&self) -> &[RecoveredResource] {
        &self.resources
    }

    /// Re-encrypt into `output` everything that has to stay encrypted.
    ///
    /// # Errors
    /// Returns the first error of any scheme, see [`ProtectionScheme::write_back`].
    pub fn write_back(&self, output: &mut dyn OutputWriter) -> Result<usize> {
        let mut written = 0;
        for scheme in &self.schemes {
            written += scheme.write_back(output)?;
        }
        Ok(written)
    }

    /// Split into the patched image, the method table and the recovered resources.
    #[must_use]
    pub fn into_parts(self) -> (MemoryImage, DumpedMethods, Vec<RecoveredResource>) {
        (self.image, self.methods, self.resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        file::varint::write_prefixed_string,
        metadata::token::Token,
        recovery::methods::{NATIVE_INDEX_BASE, OPAQUE_PLACEHOLDER},
        utils::crypto::{encrypt_cbc, CipherKind},
    };

    const KEY: &[u8; 16] = b"scheme-key-16byt";
    const IV: &[u8; 16] = b"scheme-iv-16byte";

    struct Fixture {
        image: MemoryImage,
        method: Token,
        methods_ciphertext: Vec<u8>,
    }

    /// Tiny body at 0x100 (code at 0x101), method stream resource and framed resource
    /// appended after 0x400.
    fn fixture() -> Fixture {
        let mut data = vec![0u8; 0x400];
        data[0x100..0x104].copy_from_slice(&[(3 << 2) | 2, 0x00, 0x00, 0x2A]);

        let mut stream = Vec::new();
        for word in [0u32, 0, 1, 0x101, NATIVE_INDEX_BASE, 2] {
            stream.extend_from_slice(&word.to_le_bytes());
        }
        stream.extend_from_slice(&[0x90, 0x90]);
        let methods_ciphertext = encrypt_cbc(CipherKind::Aes, &stream, KEY, IV).unwrap();

        let mut container = Vec::new();
        container.extend_from_slice(&1i32.to_le_bytes());
        write_prefixed_string(&mut container, "a.resources");
        container.extend_from_slice(b"NESTED");
        let resource_ciphertext = encrypt_cbc(CipherKind::Aes, &container, KEY, IV).unwrap();

        let methods_offset = data.len();
        data.extend_from_slice(&methods_ciphertext);
        let resource_offset = data.len();
        data.extend_from_slice(&resource_ciphertext);

        let mut image = MemoryImage::new(data)
            .with_resource("methods", methods_offset, methods_ciphertext.len())
            .with_resource("blob", resource_offset, resource_ciphertext.len());
        let method = image.add_method(0x100);

        Fixture {
            image,
            method,
            methods_ciphertext,
        }
    }

    fn schemes() -> Vec<Box<dyn ProtectionScheme>> {
        let hints = MethodStreamHints {
            hooks_jitter: true,
            ..Default::default()
        };
        let methods = EncryptedResourceContext::new("methods", CipherKind::Aes, KEY, IV);
        let blob = EncryptedResourceContext::new("blob", CipherKind::Aes, KEY, IV);
        let patch = PatchInfo::new(vec![0x300], vec![[1, 2, 3, 4]]).unwrap();

        vec![
            Box::new(NativeMethodsScheme::new(methods, hints)),
            Box::new(MemoryPatchScheme::new(patch)),
            Box::new(ResourceScheme::new(ResourceLayout::Framed(blob))),
            Box::new(ResourceScheme::new(ResourceLayout::KeyPrefixed(
                "absent".to_string(),
            ))),
        ]
    }

    #[test]
    fn analyze_keeps_located_schemes() {
        let analyzed = RawModule::new(fixture().image).analyze(schemes());
        assert!(analyzed.is_protected());
        assert_eq!(
            analyzed.kinds(),
            vec![
                SchemeKind::NativeMethods,
                SchemeKind::MemoryPatch,
                SchemeKind::Resource
            ]
        );

        let unprotected = RawModule::new(MemoryImage::new(vec![0u8; 16])).analyze(Vec::new());
        assert!(!unprotected.is_protected());
    }

    #[test]
    fn decrypt_runs_every_scheme() {
        let fixture = fixture();
        let decrypted = RawModule::new(fixture.image)
            .analyze(schemes())
            .decrypt()
            .unwrap();

        let image = decrypted.image();
        assert_eq!(image.generation(), 1);
        assert_eq!(&image.data()[0x300..0x304], &[1, 2, 3, 4]);

        let method = decrypted.methods().get(fixture.method).unwrap();
        assert_eq!(method.code, OPAQUE_PLACEHOLDER.to_vec());

        assert_eq!(decrypted.resources().len(), 1);
        assert_eq!(decrypted.resources()[0].payload, b"NESTED");
    }

    #[test]
    fn write_back_restores_the_method_resource() {
        let fixture = fixture();
        let decrypted = RawModule::new(fixture.image)
            .analyze(schemes())
            .decrypt()
            .unwrap();

        let mut output = decrypted.image().clone();
        let location = output.resource_by_name("methods").unwrap();
        output.data_mut()[location.offset..location.offset + location.length].fill(0);

        assert_eq!(decrypted.write_back(&mut output).unwrap(), 1);
        assert_eq!(
            output.resource_data("methods").unwrap(),
            &fixture.methods_ciphertext[..]
        );
    }

    #[test]
    fn wrong_key_fails_the_module() {
        let fixture = fixture();
        let context =
            EncryptedResourceContext::new("blob", CipherKind::Aes, b"0000000000000000", IV);
        let scheme = ResourceScheme::new(ResourceLayout::Framed(context));
        let analyzed = RawModule::new(fixture.image).analyze(vec![Box::new(scheme)]);
        assert!(analyzed.decrypt().is_err());
    }

    #[test]
    fn oracle_needs_a_helper() {
        let mut config = OracleConfig::default();
        config.helpers.clear();
        let scheme = OracleScheme::new(config, RuntimeVersion::Clr40, vec![0x2A]);
        assert!(!scheme.locate(&fixture().image));

        let scheme = OracleScheme::new(OracleConfig::default(), RuntimeVersion::Clr40, vec![0x2A]);
        assert!(scheme.locate(&fixture().image));
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let image = MemoryImage::new(vec![0u8; 16]);
        let mut target = image.data().to_vec();
        let mut scheme = MemoryPatchScheme::new(PatchInfo::new(vec![0], vec![[0; 4]]).unwrap());
        assert!(matches!(
            scheme.patch(&image, Payload::MethodStream(Vec::new()), &mut target),
            Err(Error::Malformed { .. })
        ));
        assert_eq!(
            "native-methods".parse::<SchemeKind>().unwrap(),
            SchemeKind::NativeMethods
        );
    }
}
