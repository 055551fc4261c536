//! Per-isolate data shared by every environment on an isolate.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::ModuleExport;

use isolate_host_common::RuntimeError;

use crate::{Allocator, BuildConfig, CompiledModule, IndexTable, Isolate};

/// Export the main environment starts executing at.
pub const ENTRY_POINT: &str = "_start";

/// Linear memory export read by host functions.
pub const MEMORY_EXPORT: &str = "memory";

/// Per-isolate properties, in snapshot index order.
pub const ISOLATE_DATA_PROPERTIES: &[&str] = &[ENTRY_POINT, MEMORY_EXPORT];

const ENTRY_POINT_SLOT: usize = 0;
const MEMORY_EXPORT_SLOT: usize = 1;

/// Isolate-scoped data: the allocator, the bootstrap module, and the
/// resolved per-isolate properties.
///
/// Built in one of two modes with identical observable results:
/// - **deserialize**: the bootstrap is restored from the snapshot blob and
///   properties are located through the snapshot's [`IndexTable`]
/// - **fresh**: the bootstrap is compiled and properties are looked up by
///   name
pub struct IsolateData<'a> {
    allocator: Arc<Allocator>,
    indexes: Option<IndexTable<'a>>,
    module: CompiledModule,
    entry_point: Option<ModuleExport>,
    memory_export: Option<ModuleExport>,
}

impl<'a> IsolateData<'a> {
    /// Build the isolate data for `isolate`.
    ///
    /// Deserializes when `build` carries both a snapshot blob and its
    /// indexes, and compiles the bootstrap otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the bootstrap does not compile, or the snapshot
    /// was built from another bootstrap, is rejected, or does not match its
    /// indexes.
    ///
    /// # Panics
    ///
    /// Panics if the index table does not have one slot per property.
    #[instrument(skip_all, fields(isolate_id = %isolate.id()))]
    pub fn new(
        isolate: &Isolate,
        allocator: Arc<Allocator>,
        build: &'a BuildConfig,
    ) -> Result<Self, RuntimeError> {
        let start = Instant::now();
        let snapshot = &build.snapshot;

        let data = match (
            snapshot.embedded_snapshot_blob(),
            snapshot.isolate_data_indexes(),
        ) {
            (Some(blob), Some(indexes)) => {
                assert_eq!(
                    indexes.len(),
                    ISOLATE_DATA_PROPERTIES.len(),
                    "snapshot index table does not match the per-isolate properties"
                );

                let expected_hash = build.bootstrap.content_hash();
                if snapshot.bootstrap_hash() != Some(expected_hash.as_str()) {
                    return Err(RuntimeError::invalid_snapshot(format!(
                        "snapshot was built from bootstrap {:?}, configured bootstrap is {expected_hash}",
                        snapshot.bootstrap_hash()
                    )));
                }

                let module =
                    CompiledModule::from_snapshot(isolate.engine(), blob, &expected_hash)?;
                let entry_point = Self::restore(&module, indexes, ENTRY_POINT_SLOT)?;
                let memory_export = Self::restore(&module, indexes, MEMORY_EXPORT_SLOT)?;

                Self {
                    allocator,
                    indexes: Some(indexes),
                    module,
                    entry_point,
                    memory_export,
                }
            }
            (blob, indexes) => {
                if blob.is_some() || indexes.is_some() {
                    debug!(
                        has_blob = blob.is_some(),
                        has_indexes = indexes.is_some(),
                        "Incomplete snapshot, compiling bootstrap"
                    );
                }

                let module = CompiledModule::compile(isolate.engine(), &build.bootstrap)?;
                let entry_point = module.export_named(ENTRY_POINT);
                let memory_export = module.export_named(MEMORY_EXPORT);

                Self {
                    allocator,
                    indexes: None,
                    module,
                    entry_point,
                    memory_export,
                }
            }
        };

        info!(
            deserialized = data.is_deserialized(),
            duration_us = start.elapsed().as_micros(),
            "Isolate data ready"
        );

        Ok(data)
    }

    fn restore(
        module: &CompiledModule,
        indexes: IndexTable<'_>,
        slot: usize,
    ) -> Result<Option<ModuleExport>, RuntimeError> {
        let position = indexes.get(slot);
        if position == IndexTable::NOT_PRESENT {
            return Ok(None);
        }

        let expected = ISOLATE_DATA_PROPERTIES[slot];
        match module.export_at(position) {
            Some((name, export)) if name == expected => Ok(Some(export)),
            found => Err(RuntimeError::invalid_snapshot(format!(
                "index {position} should locate `{expected}`, found {:?}",
                found.map(|(name, _)| name)
            ))),
        }
    }

    /// The allocator charged by every environment on this isolate.
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// The snapshot indexes, present only in deserialize mode.
    pub fn indexes(&self) -> Option<IndexTable<'a>> {
        self.indexes
    }

    /// Returns `true` if this data was restored from a snapshot.
    pub fn is_deserialized(&self) -> bool {
        self.indexes.is_some()
    }

    /// The bootstrap module.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// The entry point export, if the bootstrap has one.
    pub fn entry_point(&self) -> Option<&ModuleExport> {
        self.entry_point.as_ref()
    }

    /// The linear memory export, if the bootstrap has one.
    pub fn memory_export(&self) -> Option<&ModuleExport> {
        self.memory_export.as_ref()
    }
}

impl std::fmt::Debug for IsolateData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateData")
            .field("deserialized", &self.is_deserialized())
            .field("module", &self.module)
            .field("has_entry_point", &self.entry_point.is_some())
            .field("has_memory_export", &self.memory_export.is_some())
            .finish_non_exhaustive()
    }
}
