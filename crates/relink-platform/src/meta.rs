//! Stat-based identity, metadata snapshot and restore, and the
//! no-clobber rename used to displace files safely.

use std::io;
use std::path::Path;

use crate::Result;

/// Metadata captured from a file before it is replaced, sufficient to put
/// the replacement back the way the original looked.
///
/// Extended attributes, ACLs, and the set-user-id/set-group-id bits are not
/// carried: they belong to the inode being replaced, not to its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    /// Full `st_mode` bits (file type plus permissions).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Access time as (seconds, nanoseconds).
    pub atime: (i64, i64),
    /// Modification time as (seconds, nanoseconds).
    pub mtime: (i64, i64),
}

/// True iff both paths resolve to the same `(st_dev, st_ino)` pair, i.e.
/// they are hard links of one inode and already share all storage.
pub fn same_inode(a: &Path, b: &Path) -> Result<bool> {
    #[cfg(target_os = "linux")]
    {
        linux::same_inode(a, b)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (a, b);
        Err(crate::PlatformError::Unsupported)
    }
}

/// Snapshots `path`'s metadata without following a final symlink.
pub fn capture_metadata(path: &Path) -> Result<FileMeta> {
    #[cfg(target_os = "linux")]
    {
        linux::capture_metadata(path)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
        Err(crate::PlatformError::Unsupported)
    }
}

/// Restores a captured snapshot onto `path`.
///
/// Ownership is restored best-effort: an unprivileged process cannot chown
/// and that is not a failure. Permission bits and timestamps must succeed.
pub fn restore_metadata(path: &Path, meta: &FileMeta) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        linux::restore_metadata(path, meta)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (path, meta);
        Err(crate::PlatformError::Unsupported)
    }
}

/// Rename within a filesystem that refuses to clobber an existing
/// destination, failing with `AlreadyExists` instead.
pub fn rename_noreplace(from: &Path, to: &Path) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        linux::rename_noreplace(from, to)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (from, to);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "rename_noreplace requires Linux",
        ))
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;
    use std::fs;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::path::Path;

    use super::FileMeta;
    use crate::Result;

    pub(super) fn same_inode(a: &Path, b: &Path) -> Result<bool> {
        let meta_a = fs::metadata(a)?;
        let meta_b = fs::metadata(b)?;
        Ok(meta_a.dev() == meta_b.dev() && meta_a.ino() == meta_b.ino())
    }

    pub(super) fn capture_metadata(path: &Path) -> Result<FileMeta> {
        let md = fs::symlink_metadata(path)?;
        Ok(FileMeta {
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            atime: (md.atime(), md.atime_nsec()),
            mtime: (md.mtime(), md.mtime_nsec()),
        })
    }

    pub(super) fn restore_metadata(path: &Path, meta: &FileMeta) -> Result<()> {
        let cpath = cstring(path)?;

        // Ownership needs privilege; a failed chown is not worth failing
        // the dedup over.
        unsafe {
            let _ = libc::chown(cpath.as_ptr(), meta.uid, meta.gid);
        }

        fs::set_permissions(path, fs::Permissions::from_mode(meta.mode & 0o777))?;

        let times = [timespec(meta.atime), timespec(meta.mtime)];
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(())
    }

    pub(super) fn rename_noreplace(from: &Path, to: &Path) -> io::Result<()> {
        let cfrom = cstring(from)?;
        let cto = cstring(to)?;

        let rc = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                cfrom.as_ptr(),
                libc::AT_FDCWD,
                cto.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn cstring(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
    }

    fn timespec((sec, nsec): (i64, i64)) -> libc::timespec {
        libc::timespec {
            tv_sec: sec as libc::time_t,
            tv_nsec: nsec as libc::c_long,
        }
    }
}
