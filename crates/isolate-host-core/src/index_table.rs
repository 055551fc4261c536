//! Read-only table of deserialization indexes.

/// Bounds-checked view over the indexes recorded in a startup snapshot.
///
/// Each slot locates one per-isolate property inside the deserialized
/// module. The table is produced by [`crate::SnapshotSource::build`] and
/// never by untrusted input, so an out-of-range lookup is a bug in the
/// host and panics instead of returning an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexTable<'a> {
    data: &'a [usize],
}

impl<'a> IndexTable<'a> {
    /// Slot value for a property the bootstrap module does not export.
    pub const NOT_PRESENT: usize = usize::MAX;

    /// Wrap a slice of indexes.
    pub const fn new(data: &'a [usize]) -> Self {
        Self { data }
    }

    /// Number of slots.
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the table has no slots.
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Value stored in slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn get(&self, index: usize) -> usize {
        assert!(
            index < self.data.len(),
            "index table lookup out of range: index {index}, length {}",
            self.data.len()
        );
        self.data[index]
    }

    /// Iterate over the slot values in order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = usize> + use<'a> {
        self.data.iter().copied()
    }
}
