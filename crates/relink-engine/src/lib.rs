//! # relink-engine
//!
//! The two-pass deduplication engine.
//!
//! Pass 1 ([`survey`]) walks the tree in randomized order and builds a
//! bounded [`SizeMap`] histogram of file sizes. The driver selects the most
//! impactful size classes with [`SizeMap::top_n`], and pass 2 ([`dedup`])
//! re-walks the tree, groups files of those sizes by content, and replaces
//! duplicates with reflink clones of a per-group reference file.

mod dedup;
mod sizemap;
mod walk;

pub use dedup::{dedup, DedupStats};
pub use sizemap::{SizeEntry, SizeMap};
pub use walk::survey;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort an entire pass.
///
/// Per-file and per-directory problems are downgraded to logs (and, inside
/// the replace procedure, to the error counter); only an unreadable root or
/// a platform with no reflink support is worth stopping for.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot scan {}: {source}", .path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("this platform does not support reflink deduplication")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, EngineError>;
