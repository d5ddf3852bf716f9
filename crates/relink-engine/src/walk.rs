//! Randomized directory traversal shared by both passes.

use std::fs;
use std::io;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::debug;

use crate::{EngineError, Result, SizeMap};

/// Walks the tree under `root`, invoking `visit` with `(path, size)` for
/// every regular file of nonzero size.
///
/// Entries are shuffled uniformly at each directory level before descent, so
/// a walk cut short (or a histogram evicting under memory pressure) samples
/// the whole tree instead of its lexically-first corner. Symlinks
/// are neither followed nor reported, special files and empty files are
/// skipped, and unreadable children are logged at debug level and skipped.
/// Only an unreadable `root` is an error.
pub(crate) fn walk_random<F>(root: &Path, visit: &mut F) -> Result<()>
where
    F: FnMut(&Path, u64),
{
    let entries = read_shuffled(root).map_err(|source| EngineError::Scan {
        path: root.to_path_buf(),
        source,
    })?;
    walk_entries(entries, visit);
    Ok(())
}

/// Pass 1: records every regular file's size in the histogram.
///
/// Returns the number of files surveyed.
pub fn survey(root: &Path, sizes: &mut SizeMap) -> Result<u64> {
    let mut seen: u64 = 0;
    walk_random(root, &mut |_path, size| {
        sizes.add(size);
        seen += 1;
        if seen % 1_000_000 == 0 {
            debug!(files = seen, unique_sizes = sizes.len(), "size survey progress");
        }
    })?;
    Ok(seen)
}

fn read_shuffled(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.shuffle(&mut thread_rng());
    Ok(entries)
}

fn walk_entries<F>(entries: Vec<fs::DirEntry>, visit: &mut F)
where
    F: FnMut(&Path, u64),
{
    for entry in entries {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping entry with unreadable type");
                continue;
            }
        };

        if file_type.is_symlink() {
            continue;
        }

        if file_type.is_dir() {
            match read_shuffled(&path) {
                Ok(children) => walk_entries(children, visit),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable directory")
                }
            }
            continue;
        }

        if !file_type.is_file() {
            continue;
        }

        let size = match entry.metadata() {
            Ok(md) => md.len(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping file with unreadable metadata");
                continue;
            }
        };
        if size == 0 {
            continue;
        }

        visit(&path, size);
    }
}
