//! Extent map retrieval via the paged `FS_IOC_FIEMAP` ioctl protocol.

use std::path::Path;

use crate::{Extent, Result};

/// Returns the full physical extent map of the file at `path`.
///
/// The kernel caps how many extents one ioctl returns, so the map is fetched
/// in pages: request a batch starting at a logical cursor, append what comes
/// back, and continue past the last mapped extent until the kernel marks one
/// with `FIEMAP_EXTENT_LAST`. Every request sets `FIEMAP_FLAG_SYNC` so
/// delayed allocations are flushed and the reported extents are stable.
pub fn get_extents(path: &Path) -> Result<Vec<Extent>> {
    #[cfg(target_os = "linux")]
    {
        linux::get_extents(path)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
        Err(crate::PlatformError::Unsupported)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use crate::{Extent, Result};

    const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;
    const FIEMAP_FLAG_SYNC: u32 = 0x0000_0001;
    const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;
    /// Extents requested per ioctl; larger maps are paged in batches of this.
    const MAX_EXTENTS_PER_CALL: usize = 512;

    /// Mirrors `struct fiemap_extent` from `linux/fiemap.h`. Field order and
    /// sizes must match the C definition exactly.
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct FiemapExtent {
        fe_logical: u64,
        fe_physical: u64,
        fe_length: u64,
        fe_reserved64: [u64; 2],
        fe_flags: u32,
        fe_reserved: [u32; 3],
    }

    /// Mirrors `struct fiemap` from `linux/fiemap.h`, with the trailing
    /// extent array sized to one request batch.
    #[repr(C)]
    struct FiemapReq {
        fm_start: u64,
        fm_length: u64,
        fm_flags: u32,
        fm_mapped_extents: u32,
        fm_extent_count: u32,
        fm_reserved: u32,
        fm_extents: [FiemapExtent; MAX_EXTENTS_PER_CALL],
    }

    pub(super) fn get_extents(path: &Path) -> Result<Vec<Extent>> {
        let file = File::open(path)?;
        let fd = file.as_raw_fd();

        let mut extents = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            // All-zero is a valid initial state for both structs.
            let mut req: FiemapReq = unsafe { std::mem::zeroed() };
            req.fm_start = cursor;
            req.fm_length = u64::MAX;
            req.fm_flags = FIEMAP_FLAG_SYNC;
            req.fm_extent_count = MAX_EXTENTS_PER_CALL as u32;

            let rc = unsafe { libc::ioctl(fd, FS_IOC_FIEMAP, &mut req as *mut FiemapReq) };
            if rc != 0 {
                return Err(io::Error::last_os_error().into());
            }

            if req.fm_mapped_extents == 0 {
                break;
            }

            let mapped = &req.fm_extents[..req.fm_mapped_extents as usize];
            extents.extend(mapped.iter().map(|e| Extent {
                logical: e.fe_logical,
                physical: e.fe_physical,
                length: e.fe_length,
                flags: e.fe_flags,
            }));

            let last = mapped[mapped.len() - 1];
            if last.fe_flags & FIEMAP_EXTENT_LAST != 0 {
                break;
            }
            cursor = last.fe_logical + last.fe_length;
        }

        Ok(extents)
    }
}
