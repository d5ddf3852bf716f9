//! Physical extent records and the equivalence test used to detect shared
//! storage.

/// A contiguous physical region of a file, as reported by the kernel.
///
/// Extent lists are ordered by logical offset; the kernel marks the final
/// extent of a file with `FIEMAP_EXTENT_LAST` in `flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Byte offset of the region within the file.
    pub logical: u64,
    /// Byte offset of the region on the underlying device.
    pub physical: u64,
    /// Region length in bytes.
    pub length: u64,
    /// Raw FIEMAP extent flags.
    pub flags: u32,
}

/// Reports whether two extent lists describe the same physical storage.
///
/// Lists are equivalent when they have equal length and agree pairwise on
/// `(physical, length)`. Logical offsets and flags are deliberately not
/// compared: identical content mapped to identical physical blocks is what
/// proves sharing, and flag bits differ for reasons unrelated to it.
pub fn same_extents(a: &[Extent], b: &[Extent]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.physical == y.physical && x.length == y.length)
}
