//! End-to-end scenarios for the two-pass engine.
//!
//! Anything that needs FIEMAP or FICLONE to succeed probes the backing
//! filesystem first and bails out quietly where the kernel refuses the
//! ioctl (tmpfs, overlay mounts), so the suite passes off btrfs too.

#![cfg(target_os = "linux")]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::tempdir;

use relink_engine::{dedup, survey, SizeEntry, SizeMap};
use relink_platform::{get_extents, reflink_copy, same_extents};

fn fiemap_works(dir: &Path) -> bool {
    let probe = dir.join("fiemap-probe");
    fs::write(&probe, b"probe").unwrap();
    get_extents(&probe).is_ok()
}

fn reflink_works(dir: &Path) -> bool {
    let src = dir.join("reflink-probe-src");
    let dst = dir.join("reflink-probe-dst");
    fs::write(&src, b"probe").unwrap();
    reflink_copy(&src, &dst, 0o644).is_ok()
}

/// Builds the target set the way the driver does: survey then top-N.
fn select_targets(root: &Path) -> Vec<SizeEntry> {
    let mut sizes = SizeMap::new(1000);
    survey(root, &mut sizes).unwrap();
    sizes.top_n(100)
}

fn assert_no_backups(root: &Path) {
    for entry in fs::read_dir(root).unwrap() {
        let name = entry.unwrap().file_name();
        assert!(
            !name.to_string_lossy().ends_with(".dedup-tmp"),
            "leftover backup file: {name:?}"
        );
    }
}

// Large enough that btrfs gives the content real (non-inline) extents.
const FILE_SIZE: usize = 8192;

#[test]
fn dedups_identical_files_and_is_idempotent() {
    let dir = tempdir().unwrap();
    if !fiemap_works(dir.path()) || !reflink_works(dir.path()) {
        eprintln!("skipping: filesystem does not support reflink dedup");
        return;
    }

    let tree = dir.path().join("tree");
    fs::create_dir(&tree).unwrap();
    let content = vec![0xabu8; FILE_SIZE];
    for name in ["a", "b", "c"] {
        fs::write(tree.join(name), &content).unwrap();
    }

    let targets = select_targets(&tree);
    assert_eq!(
        targets,
        vec![SizeEntry {
            size: FILE_SIZE as u64,
            count: 3
        }]
    );

    let stats = dedup(&tree, &targets, false).unwrap();
    assert_eq!(stats.files_deduped, 2);
    assert_eq!(stats.bytes_saved, 2 * FILE_SIZE as u64);
    assert_eq!(stats.already_deduped, 0);
    assert_eq!(stats.errors, 0);

    // Content is untouched and all three files share physical storage.
    for name in ["a", "b", "c"] {
        assert_eq!(fs::read(tree.join(name)).unwrap(), content);
    }
    let extents_a = get_extents(&tree.join("a")).unwrap();
    let extents_b = get_extents(&tree.join("b")).unwrap();
    let extents_c = get_extents(&tree.join("c")).unwrap();
    assert!(same_extents(&extents_a, &extents_b));
    assert!(same_extents(&extents_b, &extents_c));
    assert_no_backups(&tree);

    // Second run finds everything already shared and mutates nothing.
    let stats = dedup(&tree, &select_targets(&tree), false).unwrap();
    assert_eq!(stats.files_deduped, 0);
    assert_eq!(stats.bytes_saved, 0);
    assert_eq!(stats.already_deduped, 2);
    assert_eq!(stats.errors, 0);
}

#[test]
fn replace_preserves_content_on_every_outcome() {
    // On a reflink filesystem the pair dedups; on one that only supports
    // FIEMAP the clone fails and rolls back. Either way the bytes and the
    // paths must be exactly as they started.
    let dir = tempdir().unwrap();
    if !fiemap_works(dir.path()) {
        eprintln!("skipping: filesystem does not support FIEMAP");
        return;
    }

    let tree = dir.path().join("tree");
    fs::create_dir(&tree).unwrap();
    let content: Vec<u8> = (0..FILE_SIZE).map(|i| (i % 239) as u8).collect();
    fs::write(tree.join("a"), &content).unwrap();
    fs::write(tree.join("b"), &content).unwrap();

    let stats = dedup(&tree, &select_targets(&tree), false).unwrap();

    assert_eq!(stats.files_deduped + stats.errors, 1);
    assert_eq!(stats.already_deduped, 0);
    assert_eq!(fs::read(tree.join("a")).unwrap(), content);
    assert_eq!(fs::read(tree.join("b")).unwrap(), content);
    assert_no_backups(&tree);
}

#[test]
fn hard_links_count_as_already_shared() {
    let dir = tempdir().unwrap();
    if !fiemap_works(dir.path()) {
        eprintln!("skipping: filesystem does not support FIEMAP");
        return;
    }

    let tree = dir.path().join("tree");
    fs::create_dir(&tree).unwrap();
    fs::write(tree.join("a"), vec![1u8; 100]).unwrap();
    fs::hard_link(tree.join("a"), tree.join("b")).unwrap();

    let stats = dedup(&tree, &select_targets(&tree), false).unwrap();
    assert_eq!(stats.already_deduped, 1);
    assert_eq!(stats.files_deduped, 0);
    assert_eq!(stats.bytes_saved, 0);
    assert_eq!(stats.errors, 0);
}

#[test]
fn preexisting_reflinks_count_as_already_shared() {
    let dir = tempdir().unwrap();
    if !fiemap_works(dir.path()) || !reflink_works(dir.path()) {
        eprintln!("skipping: filesystem does not support reflink dedup");
        return;
    }

    let tree = dir.path().join("tree");
    fs::create_dir(&tree).unwrap();
    fs::write(tree.join("a"), vec![5u8; FILE_SIZE]).unwrap();
    reflink_copy(&tree.join("a"), &tree.join("b"), 0o644).unwrap();

    let before = fs::metadata(tree.join("b")).unwrap().modified().unwrap();
    let stats = dedup(&tree, &select_targets(&tree), false).unwrap();
    assert_eq!(stats.already_deduped, 1);
    assert_eq!(stats.files_deduped, 0);
    assert_eq!(stats.bytes_saved, 0);
    assert_eq!(
        fs::metadata(tree.join("b")).unwrap().modified().unwrap(),
        before
    );
}

#[test]
fn different_content_of_equal_size_is_left_alone() {
    let dir = tempdir().unwrap();
    if !fiemap_works(dir.path()) {
        eprintln!("skipping: filesystem does not support FIEMAP");
        return;
    }

    let tree = dir.path().join("tree");
    fs::create_dir(&tree).unwrap();
    let mut content = vec![0u8; FILE_SIZE];
    fs::write(tree.join("a"), &content).unwrap();
    content[1500] = 0xff;
    fs::write(tree.join("b"), &content).unwrap();

    let stats = dedup(&tree, &select_targets(&tree), false).unwrap();
    assert_eq!(stats, Default::default());
    assert_ne!(
        fs::read(tree.join("a")).unwrap(),
        fs::read(tree.join("b")).unwrap()
    );
}

#[test]
fn dry_run_accounts_without_mutating() {
    let dir = tempdir().unwrap();
    if !fiemap_works(dir.path()) {
        eprintln!("skipping: filesystem does not support FIEMAP");
        return;
    }

    let tree = dir.path().join("tree");
    fs::create_dir(&tree).unwrap();
    let content = vec![9u8; FILE_SIZE];
    fs::write(tree.join("a"), &content).unwrap();
    fs::write(tree.join("b"), &content).unwrap();

    let mtimes_before: Vec<_> = ["a", "b"]
        .iter()
        .map(|n| fs::metadata(tree.join(n)).unwrap().modified().unwrap())
        .collect();
    let extents_before: Vec<_> = ["a", "b"]
        .iter()
        .map(|n| get_extents(&tree.join(n)).unwrap())
        .collect();

    let stats = dedup(&tree, &select_targets(&tree), true).unwrap();
    assert_eq!(stats.files_deduped, 1);
    assert_eq!(stats.bytes_saved, FILE_SIZE as u64);
    assert_eq!(stats.errors, 0);

    for (i, name) in ["a", "b"].iter().enumerate() {
        let path = tree.join(name);
        assert_eq!(fs::read(&path).unwrap(), content);
        assert_eq!(
            fs::metadata(&path).unwrap().modified().unwrap(),
            mtimes_before[i]
        );
        assert!(same_extents(
            &get_extents(&path).unwrap(),
            &extents_before[i]
        ));
    }
    assert_no_backups(&tree);
}

#[test]
fn preexisting_backup_path_aborts_that_replacement() {
    let dir = tempdir().unwrap();
    if !fiemap_works(dir.path()) {
        eprintln!("skipping: filesystem does not support FIEMAP");
        return;
    }

    let tree = dir.path().join("tree");
    fs::create_dir(&tree).unwrap();
    let content = vec![4u8; FILE_SIZE];
    fs::write(tree.join("a"), &content).unwrap();
    fs::write(tree.join("b"), &content).unwrap();
    // Blockers for whichever file the walk picks as the candidate. Their
    // contents differ so they form two reference groups of their own.
    fs::write(tree.join("a.dedup-tmp"), b"x").unwrap();
    fs::write(tree.join("b.dedup-tmp"), b"y").unwrap();

    let stats = dedup(&tree, &select_targets(&tree), false).unwrap();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.files_deduped, 0);
    assert_eq!(stats.bytes_saved, 0);

    // Nothing moved: originals intact, blockers intact.
    assert_eq!(fs::read(tree.join("a")).unwrap(), content);
    assert_eq!(fs::read(tree.join("b")).unwrap(), content);
    assert_eq!(fs::read(tree.join("a.dedup-tmp")).unwrap(), b"x");
    assert_eq!(fs::read(tree.join("b.dedup-tmp")).unwrap(), b"y");
}

#[test]
fn unique_sizes_are_never_candidates() {
    let dir = tempdir().unwrap();

    let tree = dir.path().join("tree");
    fs::create_dir(&tree).unwrap();
    fs::write(tree.join("a"), vec![0u8; 100]).unwrap();
    fs::write(tree.join("b"), vec![0u8; 200]).unwrap();
    fs::write(tree.join("c"), vec![0u8; 300]).unwrap();

    // No size occurs twice, so pass 1 selects nothing and pass 2 has
    // nothing to do on any filesystem.
    let targets = select_targets(&tree);
    assert!(targets.is_empty());

    let stats = dedup(&tree, &targets, false).unwrap();
    assert_eq!(stats, Default::default());
}

#[test]
fn pair_dedup_across_many_groups() {
    let dir = tempdir().unwrap();
    if !fiemap_works(dir.path()) || !reflink_works(dir.path()) {
        eprintln!("skipping: filesystem does not support reflink dedup");
        return;
    }

    // Twenty files of one size with ten distinct contents: every content
    // appears exactly twice, so ten dedups reclaim ten files' bytes.
    let tree = dir.path().join("tree");
    fs::create_dir(&tree).unwrap();
    for i in 0..10u8 {
        let content = vec![i; FILE_SIZE];
        fs::write(tree.join(format!("first-{i}")), &content).unwrap();
        fs::write(tree.join(format!("second-{i}")), &content).unwrap();
    }

    let targets = select_targets(&tree);
    assert_eq!(
        targets,
        vec![SizeEntry {
            size: FILE_SIZE as u64,
            count: 20
        }]
    );

    let stats = dedup(&tree, &targets, false).unwrap();
    assert_eq!(stats.files_deduped, 10);
    assert_eq!(stats.bytes_saved, 10 * FILE_SIZE as u64);
    assert_eq!(stats.errors, 0);

    for i in 0..10u8 {
        let first: PathBuf = tree.join(format!("first-{i}"));
        let second: PathBuf = tree.join(format!("second-{i}"));
        assert_eq!(fs::read(&first).unwrap(), vec![i; FILE_SIZE]);
        assert_eq!(fs::read(&second).unwrap(), vec![i; FILE_SIZE]);
        assert!(same_extents(
            &get_extents(&first).unwrap(),
            &get_extents(&second).unwrap()
        ));
    }
}

#[test]
fn dedup_of_unreadable_root_fails() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing");
    let targets = [SizeEntry { size: 1, count: 2 }];
    assert!(dedup(&missing, &targets, false).is_err());
}

#[test]
fn files_outside_target_sizes_are_ignored() {
    let dir = tempdir().unwrap();

    let tree = dir.path().join("tree");
    fs::create_dir(&tree).unwrap();
    let content = vec![2u8; FILE_SIZE];
    fs::write(tree.join("a"), &content).unwrap();
    fs::write(tree.join("b"), &content).unwrap();

    // Target set names a size that matches nothing in the tree.
    let targets = [SizeEntry {
        size: 12345,
        count: 2,
    }];
    let stats = dedup(&tree, &targets, false).unwrap();
    assert_eq!(stats, Default::default());
}
