//! Whole-file copy-on-write cloning via the `FICLONE` ioctl.

use std::path::Path;

use crate::Result;

/// Creates `dst` as a new file with the given permission bits and makes it a
/// copy-on-write clone of `src`, sharing all physical blocks.
///
/// The destination is created outright, so callers that need atomicity must
/// have displaced any original beforehand. The open honors the process
/// umask; callers that need exact mode bits restore them afterwards. When
/// the clone ioctl fails the partially-created `dst` is removed before the
/// error is returned.
pub fn reflink_copy(src: &Path, dst: &Path, mode: u32) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        linux::reflink_copy(src, dst, mode)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (src, dst, mode);
        Err(crate::PlatformError::Unsupported)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{self, File, OpenOptions};
    use std::io;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use crate::Result;

    const FICLONE: libc::c_ulong = 0x4004_9409;

    pub(super) fn reflink_copy(src: &Path, dst: &Path, mode: u32) -> Result<()> {
        let src_file = File::open(src)?;
        let dst_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(dst)?;

        let rc = unsafe { libc::ioctl(dst_file.as_raw_fd(), FICLONE, src_file.as_raw_fd()) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            drop(dst_file);
            let _ = fs::remove_file(dst);
            return Err(err.into());
        }

        Ok(())
    }
}
