//! Pass 2: content grouping and atomic replacement with reflink clones.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use relink_platform as platform;
use relink_platform::{Extent, FileMeta, PlatformError};

use crate::walk::walk_random;
use crate::{EngineError, SizeEntry};

/// Bytes compared per step of the lockstep content comparison.
const COMPARE_CHUNK: usize = 256 * 1024;

/// Suffix under which a file is parked while being replaced. A survivor of
/// an interrupted run is an ordinary file to the next run; it is never
/// unlinked, and its presence makes the displace step fail cleanly.
const BACKUP_SUFFIX: &str = ".dedup-tmp";

/// Counters accumulated over one pass-2 run. All four only ever increase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    /// Bytes of physical storage released by successful dedups.
    pub bytes_saved: u64,
    /// Files replaced with a reflink clone of their group's reference.
    pub files_deduped: u64,
    /// Files found already sharing storage with their reference.
    pub already_deduped: u64,
    /// Replace procedures that failed after a content match.
    pub errors: u64,
}

/// Reference file for one content group: the canonical path (lexically
/// shortest seen so far) and its cached extent map.
struct FileRef {
    path: PathBuf,
    extents: Vec<Extent>,
}

/// What went wrong inside the replace procedure, by step.
#[derive(Debug, Error)]
enum ReplaceError {
    #[error("capture metadata: {0}")]
    Capture(#[source] PlatformError),

    #[error("displace to backup: {0}")]
    Displace(#[source] io::Error),

    #[error("reflink clone: {0}")]
    Clone(#[source] PlatformError),

    #[error("verify extents: {0}")]
    Verify(#[source] PlatformError),

    #[error("extent maps differ after clone; filesystem refused reflink")]
    CloneNotEffective,
}

/// Pass 2 entry point: dedups every file under `root` whose size is in
/// `targets`, returning the accumulated stats.
///
/// Files of each target size are grouped by content as they are
/// encountered: the first file of a new content group becomes its
/// reference, and later byte-identical files are replaced with reflink
/// clones of it. In dry-run mode matches are accounted and reported but
/// nothing is touched.
pub fn dedup(
    root: &Path,
    targets: &[SizeEntry],
    dry_run: bool,
) -> std::result::Result<DedupStats, EngineError> {
    let target_sizes: HashSet<u64> = targets.iter().map(|t| t.size).collect();
    let mut groups: HashMap<u64, Vec<FileRef>> = HashMap::new();
    let mut stats = DedupStats::default();
    let mut processed: u64 = 0;
    let mut fatal = None;

    walk_random(root, &mut |path, size| {
        if fatal.is_some() || !target_sizes.contains(&size) {
            return;
        }

        processed += 1;
        if processed % 100_000 == 0 {
            debug!(
                files_processed = processed,
                deduped = stats.files_deduped,
                saved_bytes = stats.bytes_saved,
                "dedup progress"
            );
        }

        if let Err(e) = process_file(path, size, &mut groups, &mut stats, dry_run) {
            fatal = Some(e);
        }
    })?;

    if let Some(e) = fatal {
        return Err(e);
    }

    info!(files_checked = processed, "dedup scan complete");
    Ok(stats)
}

/// Tests one candidate against the known references for its size class and
/// acts on the first tier that matches: same inode or same extents mean the
/// storage is already shared, equal bytes trigger a replacement. A candidate
/// matching nothing becomes a new reference for its size.
///
/// Only a platform with no reflink support at all is a hard error; any
/// per-file problem downgrades to a debug log or the error counter.
fn process_file(
    path: &Path,
    size: u64,
    groups: &mut HashMap<u64, Vec<FileRef>>,
    stats: &mut DedupStats,
    dry_run: bool,
) -> std::result::Result<(), EngineError> {
    let extents = match platform::get_extents(path) {
        Ok(extents) => extents,
        Err(PlatformError::Unsupported) => return Err(EngineError::Unsupported),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cannot read extents, skipping");
            return Ok(());
        }
    };

    let refs = groups.entry(size).or_default();

    for file_ref in refs.iter_mut() {
        // Tier 1: hard link of the reference.
        if platform::same_inode(&file_ref.path, path).unwrap_or(false) {
            promote_shorter_path(file_ref, path, &extents);
            stats.already_deduped += 1;
            return Ok(());
        }

        // Tier 2: pre-existing reflink of the reference.
        if platform::same_extents(&file_ref.extents, &extents) {
            promote_shorter_path(file_ref, path, &extents);
            stats.already_deduped += 1;
            return Ok(());
        }

        // Tier 3: different extents, possibly equal bytes.
        match files_equal(&file_ref.path, path) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                debug!(
                    a = %file_ref.path.display(),
                    b = %path.display(),
                    error = %e,
                    "content comparison failed"
                );
                continue;
            }
        }

        if dry_run {
            println!(
                "[dry-run] dedup: {} -> {} ({} bytes)",
                path.display(),
                file_ref.path.display(),
                size
            );
            stats.bytes_saved += size;
            stats.files_deduped += 1;
            return Ok(());
        }

        match replace_with_clone(&file_ref.path, path) {
            Ok(()) => {
                info!(
                    file = %path.display(),
                    reference = %file_ref.path.display(),
                    size,
                    "deduped"
                );
                stats.bytes_saved += size;
                stats.files_deduped += 1;
            }
            Err(e) => {
                warn!(
                    src = %file_ref.path.display(),
                    dst = %path.display(),
                    error = %e,
                    "dedup failed"
                );
                stats.errors += 1;
            }
        }
        return Ok(());
    }

    refs.push(FileRef {
        path: path.to_path_buf(),
        extents,
    });
    Ok(())
}

/// Tiers 1 and 2 canonicalize each group on the lexically shortest path,
/// which keeps reference paths in logs stable and close to the tree root.
fn promote_shorter_path(file_ref: &mut FileRef, path: &Path, extents: &[Extent]) {
    if path.as_os_str().len() < file_ref.path.as_os_str().len() {
        file_ref.path = path.to_path_buf();
        file_ref.extents = extents.to_vec();
    }
}

/// Byte-for-byte comparison of two files of equal size, reading both in
/// lockstep chunks and returning at the first differing chunk.
fn files_equal(a: &Path, b: &Path) -> io::Result<bool> {
    let mut file_a = File::open(a)?;
    let mut file_b = File::open(b)?;

    let mut buf_a = vec![0u8; COMPARE_CHUNK];
    let mut buf_b = vec![0u8; COMPARE_CHUNK];

    loop {
        let n_a = read_full(&mut file_a, &mut buf_a)?;
        let n_b = read_full(&mut file_b, &mut buf_b)?;
        if n_a != n_b || buf_a[..n_a] != buf_b[..n_b] {
            return Ok(false);
        }
        if n_a == 0 {
            return Ok(true);
        }
    }
}

/// Reads until `buf` is full or EOF; returns how many bytes were read.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Replaces `dst` with a reflink clone of `src`, preserving `dst`'s
/// metadata.
///
/// Sequence: capture dst's metadata, displace dst to `<dst>.dedup-tmp`
/// (refusing to clobber an existing backup), clone src into dst's place,
/// verify the clone actually shares src's extents, restore the captured
/// metadata, unlink the backup. Any failure between displace and verify
/// rolls back: the partial dst is removed and the backup renamed home, so
/// the original file is back at its original path with its original
/// content.
fn replace_with_clone(src: &Path, dst: &Path) -> std::result::Result<(), ReplaceError> {
    let meta = platform::capture_metadata(dst).map_err(ReplaceError::Capture)?;

    let backup = backup_path(dst);
    platform::rename_noreplace(dst, &backup).map_err(ReplaceError::Displace)?;

    if let Err(e) = clone_and_verify(src, dst, &meta) {
        let _ = fs::remove_file(dst);
        if let Err(restore_err) = fs::rename(&backup, dst) {
            warn!(
                path = %dst.display(),
                error = %restore_err,
                "rollback rename failed, original left at backup path"
            );
        }
        return Err(e);
    }

    // Committed: the clone is verified and in place, the backup is surplus.
    let _ = fs::remove_file(&backup);
    Ok(())
}

/// Clone, verification, and metadata restore, isolated so the caller owns
/// exactly one rollback edge.
fn clone_and_verify(
    src: &Path,
    dst: &Path,
    meta: &FileMeta,
) -> std::result::Result<(), ReplaceError> {
    platform::reflink_copy(src, dst, meta.mode & 0o777).map_err(ReplaceError::Clone)?;

    let src_extents = platform::get_extents(src).map_err(ReplaceError::Verify)?;
    let dst_extents = platform::get_extents(dst).map_err(ReplaceError::Verify)?;
    if !platform::same_extents(&src_extents, &dst_extents) {
        return Err(ReplaceError::CloneNotEffective);
    }

    // The file is correct from here on; a failed restore only means some
    // ancillary attribute is wrong.
    if let Err(e) = platform::restore_metadata(dst, meta) {
        debug!(path = %dst.display(), error = %e, "metadata restore incomplete");
    }

    Ok(())
}

fn backup_path(dst: &Path) -> PathBuf {
    let mut os = dst.as_os_str().to_os_string();
    os.push(BACKUP_SUFFIX);
    PathBuf::from(os)
}
