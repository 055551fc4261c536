//! Startup snapshots and the build configuration that carries them.
//!
//! A snapshot is a serialized, precompiled bootstrap module plus an
//! [`IndexTable`] locating each per-isolate property inside it, tagged with
//! the content hash of the bootstrap it was built from. All three are
//! supplied through a [`SnapshotSource`], which is part of the
//! [`BuildConfig`] handed to the main instance once at process start.
//!
//! # Container format
//!
//! [`SnapshotSource::to_bytes`] writes, all integers little-endian:
//!
//! ```text
//! magic "ISNP" | version: u32 | hash length: u32 | bootstrap hash (UTF-8)
//!              | index count: u32 | indexes: u64 * count
//!              | blob length: u64 | blob bytes
//! ```
//!
//! The blob itself is opaque and owned by the engine.

use std::borrow::Cow;

use tracing::{debug, info, instrument};

use isolate_host_common::RuntimeError;

use crate::isolate_data::ISOLATE_DATA_PROPERTIES;
use crate::{Bootstrap, CompiledModule, IndexTable, Isolate};

const MAGIC: &[u8; 4] = b"ISNP";
const FORMAT_VERSION: u32 = 1;

/// Serialized startup state, as produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBlob(Cow<'static, [u8]>);

impl SnapshotBlob {
    /// Wrap a blob compiled into the binary.
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self(Cow::Borrowed(bytes))
    }

    /// The raw blob bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Blob length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for an empty blob.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for SnapshotBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Cow::Owned(bytes))
    }
}

/// Where the startup snapshot comes from, if anywhere.
///
/// Both accessors return `None` when no snapshot was provided. Queries are
/// side-effect free.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSource {
    blob: Option<SnapshotBlob>,
    indexes: Option<Cow<'static, [usize]>>,
    bootstrap_hash: Option<String>,
}

impl SnapshotSource {
    /// No snapshot: every isolate compiles its bootstrap from source.
    pub const fn none() -> Self {
        Self {
            blob: None,
            indexes: None,
            bootstrap_hash: None,
        }
    }

    /// A snapshot made of `blob` and its deserialization indexes, built from
    /// the bootstrap whose [`Bootstrap::content_hash`] is `bootstrap_hash`.
    pub fn embedded(
        blob: SnapshotBlob,
        indexes: impl Into<Cow<'static, [usize]>>,
        bootstrap_hash: impl Into<String>,
    ) -> Self {
        Self {
            blob: Some(blob),
            indexes: Some(indexes.into()),
            bootstrap_hash: Some(bootstrap_hash.into()),
        }
    }

    /// Indexes used to restore per-isolate data from the blob.
    pub fn isolate_data_indexes(&self) -> Option<IndexTable<'_>> {
        self.indexes.as_deref().map(IndexTable::new)
    }

    /// The embedded snapshot blob.
    pub fn embedded_snapshot_blob(&self) -> Option<&SnapshotBlob> {
        self.blob.as_ref()
    }

    /// Content hash of the bootstrap the snapshot was built from.
    pub fn bootstrap_hash(&self) -> Option<&str> {
        self.bootstrap_hash.as_deref()
    }

    /// Returns `true` if both the blob and its indexes are present.
    pub fn is_available(&self) -> bool {
        self.blob.is_some() && self.indexes.is_some()
    }

    /// Compile `bootstrap` on `isolate` and capture it as a snapshot.
    ///
    /// The snapshot can only be loaded by isolates created with the same
    /// configuration as `isolate`.
    #[instrument(skip_all, fields(isolate_id = %isolate.id()))]
    pub fn build(isolate: &Isolate, bootstrap: &Bootstrap) -> Result<Self, RuntimeError> {
        let module = CompiledModule::compile(isolate.engine(), bootstrap)?;
        let blob = SnapshotBlob::from(module.serialize()?);

        let indexes: Vec<usize> = ISOLATE_DATA_PROPERTIES
            .iter()
            .map(|name| {
                module
                    .export_position(name)
                    .unwrap_or(IndexTable::NOT_PRESENT)
            })
            .collect();

        info!(
            blob_len = blob.len(),
            indexes = ?indexes,
            "Startup snapshot built"
        );

        Ok(Self::embedded(blob, indexes, module.content_hash()))
    }

    /// Encode the snapshot into the container format.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidSnapshot`] if there is no snapshot to
    /// encode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RuntimeError> {
        let (Some(blob), Some(indexes), Some(hash)) =
            (&self.blob, &self.indexes, &self.bootstrap_hash)
        else {
            return Err(RuntimeError::invalid_snapshot("no snapshot to encode"));
        };

        let hash_len = u32::try_from(hash.len())
            .map_err(|_| RuntimeError::invalid_snapshot("bootstrap hash too long"))?;
        let count = u32::try_from(indexes.len())
            .map_err(|_| RuntimeError::invalid_snapshot("too many indexes"))?;

        let mut out = Vec::with_capacity(28 + hash.len() + indexes.len() * 8 + blob.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&hash_len.to_le_bytes());
        out.extend_from_slice(hash.as_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        for &index in indexes.iter() {
            let encoded = if index == IndexTable::NOT_PRESENT {
                u64::MAX
            } else {
                index as u64
            };
            out.extend_from_slice(&encoded.to_le_bytes());
        }
        out.extend_from_slice(&(blob.len() as u64).to_le_bytes());
        out.extend_from_slice(blob.as_bytes());

        Ok(out)
    }

    /// Decode a container written by [`SnapshotSource::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RuntimeError> {
        let mut reader = Reader { bytes };

        if reader.take(4)? != MAGIC {
            return Err(RuntimeError::invalid_snapshot("bad magic number"));
        }

        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(RuntimeError::invalid_snapshot(format!(
                "unsupported format version {version}"
            )));
        }

        let hash_len = reader.u32()? as usize;
        let hash = std::str::from_utf8(reader.take(hash_len)?)
            .map_err(|_| RuntimeError::invalid_snapshot("bootstrap hash is not UTF-8"))?
            .to_string();

        let count = reader.u32()? as usize;
        if count != ISOLATE_DATA_PROPERTIES.len() {
            return Err(RuntimeError::invalid_snapshot(format!(
                "expected {} indexes, found {count}",
                ISOLATE_DATA_PROPERTIES.len()
            )));
        }

        let mut indexes = Vec::with_capacity(count);
        for _ in 0..count {
            let index = match reader.u64()? {
                u64::MAX => IndexTable::NOT_PRESENT,
                value => usize::try_from(value)
                    .map_err(|_| RuntimeError::invalid_snapshot("index out of range"))?,
            };
            indexes.push(index);
        }

        let blob_len = usize::try_from(reader.u64()?)
            .map_err(|_| RuntimeError::invalid_snapshot("blob too large"))?;
        let blob = reader.take(blob_len)?.to_vec();

        if !reader.bytes.is_empty() {
            return Err(RuntimeError::invalid_snapshot(format!(
                "{} trailing bytes",
                reader.bytes.len()
            )));
        }

        debug!(blob_len, "Snapshot container decoded");

        Ok(Self::embedded(SnapshotBlob::from(blob), indexes, hash))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], RuntimeError> {
        if self.bytes.len() < len {
            return Err(RuntimeError::invalid_snapshot("truncated container"));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, RuntimeError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, RuntimeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Build-time startup configuration, injected once into the main instance.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Module the main environment boots from.
    pub bootstrap: Bootstrap,

    /// Optional precompiled snapshot of `bootstrap`.
    pub snapshot: SnapshotSource,
}

impl BuildConfig {
    /// Boot from source without a snapshot.
    pub fn new(bootstrap: Bootstrap) -> Self {
        Self {
            bootstrap,
            snapshot: SnapshotSource::none(),
        }
    }

    /// Attach a snapshot.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: SnapshotSource) -> Self {
        self.snapshot = snapshot;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolate_host_common::IsolateConfig;

    const BOOTSTRAP_WAT: &str = r#"
        (module
            (func (export "_start"))
        )
    "#;

    #[test]
    fn test_none_has_no_snapshot() {
        let source = SnapshotSource::none();

        assert!(source.isolate_data_indexes().is_none());
        assert!(source.embedded_snapshot_blob().is_none());
        assert!(!source.is_available());
    }

    #[test]
    fn test_queries_are_idempotent() {
        let source = SnapshotSource::embedded(SnapshotBlob::from_static(b"blob"), vec![0, 1], "h");

        assert_eq!(source.isolate_data_indexes(), source.isolate_data_indexes());
        assert_eq!(
            source.embedded_snapshot_blob().map(SnapshotBlob::as_bytes),
            Some(&b"blob"[..])
        );
        assert!(source.is_available());
    }

    #[test]
    fn test_build_records_property_positions() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let source = SnapshotSource::build(&isolate, &Bootstrap::text(BOOTSTRAP_WAT)).unwrap();

        let indexes = source.isolate_data_indexes().unwrap();
        assert_eq!(indexes.len(), ISOLATE_DATA_PROPERTIES.len());
        // "_start" is the only export; "memory" is absent.
        assert_eq!(indexes.get(0), 0);
        assert_eq!(indexes.get(1), IndexTable::NOT_PRESENT);
        assert!(!source.embedded_snapshot_blob().unwrap().is_empty());
        assert_eq!(
            source.bootstrap_hash(),
            Some(Bootstrap::text(BOOTSTRAP_WAT).content_hash().as_str())
        );
    }

    #[test]
    fn test_container_encoding() {
        let source = SnapshotSource::embedded(
            SnapshotBlob::from(vec![1, 2, 3]),
            vec![0, IndexTable::NOT_PRESENT],
            "6bb92c4ab43a0392",
        );

        let decoded = SnapshotSource::from_bytes(&source.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, source);
    }

    #[test]
    fn test_encode_without_snapshot_fails() {
        let err = SnapshotSource::none().to_bytes().unwrap_err();
        assert!(err.is_snapshot_error());
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let err = SnapshotSource::from_bytes(b"NOPE\x01\x00\x00\x00").unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let source = SnapshotSource::embedded(SnapshotBlob::from(vec![9; 16]), vec![0, 1], "h");
        let bytes = source.to_bytes().unwrap();

        let err = SnapshotSource::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_decode_rejects_wrong_index_count() {
        let source = SnapshotSource::embedded(SnapshotBlob::from(vec![9]), vec![0, 1, 2], "h");
        let bytes = source.to_bytes().unwrap();

        let err = SnapshotSource::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("expected 2 indexes"));
    }

    #[test]
    fn test_build_config_defaults_to_no_snapshot() {
        let config = BuildConfig::new(Bootstrap::text(BOOTSTRAP_WAT));
        assert!(!config.snapshot.is_available());

        let config = config.with_snapshot(SnapshotSource::embedded(
            SnapshotBlob::from_static(b"x"),
            vec![0, 0],
            "h",
        ));
        assert!(config.snapshot.is_available());
    }
}
