//! Bootstrap module compilation and serialization.
//!
//! [`CompiledModule`] wraps the Wasmtime [`Module`] an isolate boots from.
//! It is produced either by compiling a [`Bootstrap`] from source, or by
//! deserializing a startup snapshot previously created with
//! [`CompiledModule::serialize`].

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::{Engine, Module, ModuleExport};

use isolate_host_common::RuntimeError;

use crate::snapshot::SnapshotBlob;

/// Source of the module every main environment boots from.
#[derive(Debug, Clone)]
pub enum Bootstrap {
    /// WebAssembly binary.
    Binary(Arc<[u8]>),
    /// WebAssembly text format.
    Text(Arc<str>),
}

impl Bootstrap {
    /// Bootstrap from WebAssembly binary bytes.
    pub fn binary(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Binary(bytes.into())
    }

    /// Bootstrap from WebAssembly text.
    pub fn text(wat: impl Into<Arc<str>>) -> Self {
        Self::Text(wat.into())
    }

    /// Hash of the source bytes, as reported by [`CompiledModule::content_hash`].
    pub fn content_hash(&self) -> String {
        match self {
            Bootstrap::Binary(bytes) => compute_hash(bytes),
            Bootstrap::Text(wat) => compute_hash(wat.as_bytes()),
        }
    }
}

/// A compiled bootstrap module.
///
/// Cloning is cheap; the underlying Wasmtime module is reference counted.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,

    /// Hash of the bootstrap source this module was built from.
    content_hash: String,
}

impl CompiledModule {
    /// Compile a [`Bootstrap`] for `engine`.
    pub fn compile(engine: &Engine, bootstrap: &Bootstrap) -> Result<Self, RuntimeError> {
        match bootstrap {
            Bootstrap::Binary(bytes) => Self::from_bytes(engine, bytes),
            Bootstrap::Text(wat) => Self::from_wat(engine, wat),
        }
    }

    /// Compile a module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails (e.g., invalid Wasm).
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Bootstrap module compiled"
        );

        Ok(Self {
            module,
            content_hash,
        })
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT bootstrap module compiled"
        );

        Ok(Self {
            module,
            content_hash,
        })
    }

    /// Restore a module from a snapshot blob built from the bootstrap whose
    /// hash is `content_hash`.
    ///
    /// # Safety
    ///
    /// Deserializing maps machine code from the blob. The engine rejects
    /// blobs from another engine version or configuration, but cannot tell
    /// a tampered blob from a genuine one: snapshot files are trusted input,
    /// like the host binary itself.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::SnapshotRejected`] if the engine refuses the
    /// blob (version or configuration mismatch).
    #[allow(unsafe_code)]
    #[instrument(skip(engine, blob), fields(blob_len = blob.len()))]
    pub fn from_snapshot(
        engine: &Engine,
        blob: &SnapshotBlob,
        content_hash: &str,
    ) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        // SAFETY: snapshot files are trusted like the host binary; the
        // engine still checks version and configuration compatibility.
        let module = unsafe { Module::deserialize(engine, blob.as_bytes()) }
            .map_err(|e| RuntimeError::snapshot_rejected(e.to_string()))?;

        debug!(
            content_hash,
            duration_us = start.elapsed().as_micros(),
            "Bootstrap module deserialized"
        );

        Ok(Self {
            module,
            content_hash: content_hash.to_string(),
        })
    }

    /// Serialize the compiled module into snapshot bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, RuntimeError> {
        self.module.serialize().map_err(|e| {
            RuntimeError::compilation_failed(format!("Module serialization failed: {e}"))
        })
    }

    /// Position of the export called `name` in export order.
    pub fn export_position(&self, name: &str) -> Option<usize> {
        self.module.exports().position(|export| export.name() == name)
    }

    /// Lookup index of the export at `position` in export order.
    pub fn export_at(&self, position: usize) -> Option<(&str, ModuleExport)> {
        let name = self.module.exports().nth(position)?.name();
        let export = self.module.get_export_index(name)?;
        Some((name, export))
    }

    /// Lookup index of the export called `name`.
    pub fn export_named(&self, name: &str) -> Option<ModuleExport> {
        self.module.get_export_index(name)
    }

    /// Get the inner Wasmtime module.
    pub fn as_module(&self) -> &Module {
        &self.module
    }

    /// Get the content hash of the source bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
