//! # relink-platform
//!
//! Kernel-level filesystem operations backing reflink deduplication.
//!
//! Everything here talks to the kernel directly: extent maps come from the
//! `FS_IOC_FIEMAP` ioctl, whole-file clones from `FICLONE`, and identity
//! from `stat`. Real implementations exist for Linux only; on other targets
//! every operation returns [`PlatformError::Unsupported`] immediately. There
//! is no software fallback: a deduplicator that copied bytes instead of
//! cloning them would report savings it never produced.

mod clone;
mod extent;
mod fiemap;
mod meta;

pub use clone::reflink_copy;
pub use extent::{same_extents, Extent};
pub use fiemap::get_extents;
pub use meta::{capture_metadata, rename_noreplace, restore_metadata, same_inode, FileMeta};

use std::io;

use thiserror::Error;

/// Errors from kernel-level operations.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("reflink deduplication requires a Linux filesystem with reflink support")]
    Unsupported,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PlatformError>;
