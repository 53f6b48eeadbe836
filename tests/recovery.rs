//! Crash-recovery scenarios: the journal failpoint stops a commit right
//! after the commit record is durable, modeling a crash before (or during)
//! the checkpoint; zeroing the log ring models a crash before the commit
//! record ever reached the log.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use waynefs::{mkfs::mkfs, FsError, WayneFS};

const UID: u32 = 1000;
const GID: u32 = 1000;

struct Geometry {
    block_size: u64,
    journal_start: u64,
    journal_blocks: u64,
}

fn new_image(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    let img = dir.path().join(name);
    mkfs(&img, 64, 4096, 512, None).unwrap();
    img
}

fn geometry(fs: &WayneFS) -> Geometry {
    let sb = fs.superblock();
    Geometry {
        block_size: sb.block_size as u64,
        journal_start: sb.journal_start as u64,
        journal_blocks: sb.journal_blocks as u64,
    }
}

/// Wipe the log ring (keeping the log superblock): as if the crash hit
/// before any record of the pending transaction reached the journal.
fn zero_journal_ring(img: &Path, geo: &Geometry) {
    let mut file = OpenOptions::new().write(true).open(img).unwrap();
    file.seek(SeekFrom::Start((geo.journal_start + 1) * geo.block_size))
        .unwrap();
    let zeros = vec![0u8; ((geo.journal_blocks - 1) * geo.block_size) as usize];
    file.write_all(&zeros).unwrap();
    file.flush().unwrap();
}

#[test]
fn test_s6_mkdir_crash_after_commit_record() {
    let dir = tempfile::tempdir().unwrap();
    let img = new_image(&dir, "s6a.img");

    {
        let mut fs = WayneFS::mount(&img).unwrap();
        fs.journal_mut().skip_checkpoint = true;
        fs.mkdir("/r", 0o755, UID, GID).unwrap();
        // drop without unmount: dirty pages and the checkpoint are lost
    }

    let mut fs = WayneFS::mount(&img).unwrap();
    let (_, inode) = fs.getattr("/r").unwrap();
    assert!(inode.is_dir());
    let names: Vec<String> = fs.readdir("/r").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec![".", ".."]);
    fs.check_consistency().unwrap();
}

#[test]
fn test_s6_mkdir_crash_before_commit_record() {
    let dir = tempfile::tempdir().unwrap();
    let img = new_image(&dir, "s6b.img");

    let geo = {
        let mut fs = WayneFS::mount(&img).unwrap();
        fs.journal_mut().skip_checkpoint = true;
        fs.mkdir("/r2", 0o755, UID, GID).unwrap();
        geometry(&fs)
    };
    zero_journal_ring(&img, &geo);

    let mut fs = WayneFS::mount(&img).unwrap();
    assert!(matches!(fs.getattr("/r2"), Err(FsError::NotFound)));
    fs.check_consistency().unwrap();
}

#[test]
fn test_recovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let img = new_image(&dir, "idem.img");

    {
        let mut fs = WayneFS::mount(&img).unwrap();
        fs.journal_mut().skip_checkpoint = true;
        fs.mkdir("/r", 0o755, UID, GID).unwrap();
    }
    // two remounts: the second finds a clean log
    {
        let mut fs = WayneFS::mount(&img).unwrap();
        fs.getattr("/r").unwrap();
        fs.check_consistency().unwrap();
    }
    let mut fs = WayneFS::mount(&img).unwrap();
    fs.getattr("/r").unwrap();
    fs.check_consistency().unwrap();
}

#[test]
fn test_rename_atomicity_after_commit() {
    let dir = tempfile::tempdir().unwrap();
    let img = new_image(&dir, "ren_commit.img");

    {
        let mut fs = WayneFS::mount(&img).unwrap();
        let (ino, _) = fs.create("/old", 0o644, UID, GID).unwrap();
        fs.write(ino, 0, b"payload").unwrap();
        fs.unmount().unwrap();
    }
    {
        let mut fs = WayneFS::mount(&img).unwrap();
        fs.journal_mut().skip_checkpoint = true;
        fs.rename("/old", "/new").unwrap();
    }

    let mut fs = WayneFS::mount(&img).unwrap();
    // committed: new present, old absent
    assert!(matches!(fs.getattr("/old"), Err(FsError::NotFound)));
    let (ino, _) = fs.getattr("/new").unwrap();
    assert_eq!(fs.read(ino, 0, 7).unwrap(), b"payload");
    fs.check_consistency().unwrap();
}

#[test]
fn test_rename_atomicity_before_commit() {
    let dir = tempfile::tempdir().unwrap();
    let img = new_image(&dir, "ren_nocommit.img");

    {
        let mut fs = WayneFS::mount(&img).unwrap();
        let (ino, _) = fs.create("/old", 0o644, UID, GID).unwrap();
        fs.write(ino, 0, b"payload").unwrap();
        fs.unmount().unwrap();
    }
    let geo = {
        let mut fs = WayneFS::mount(&img).unwrap();
        fs.journal_mut().skip_checkpoint = true;
        fs.rename("/old", "/new").unwrap();
        geometry(&fs)
    };
    zero_journal_ring(&img, &geo);

    let mut fs = WayneFS::mount(&img).unwrap();
    // not durable: old present, new absent, nothing dangling
    assert!(matches!(fs.getattr("/new"), Err(FsError::NotFound)));
    let (ino, _) = fs.getattr("/old").unwrap();
    assert_eq!(fs.read(ino, 0, 7).unwrap(), b"payload");
    fs.check_consistency().unwrap();
}

#[test]
fn test_replay_equals_clean_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let clean_img = new_image(&dir, "clean.img");
    let crash_img = new_image(&dir, "crash.img");

    let run_ops = |fs: &mut WayneFS| {
        fs.mkdir("/d", 0o755, UID, GID).unwrap();
        let (ino, _) = fs.create("/d/f", 0o644, UID, GID).unwrap();
        fs.write(ino, 0, b"replayed bytes").unwrap();
        fs.link("/d/f", "/d/g").unwrap();
        fs.symlink("/d/f", "/d/l", UID, GID).unwrap();
    };

    {
        let mut fs = WayneFS::mount(&clean_img).unwrap();
        run_ops(&mut fs);
        fs.unmount().unwrap();
    }
    {
        let mut fs = WayneFS::mount(&crash_img).unwrap();
        fs.journal_mut().skip_checkpoint = true;
        run_ops(&mut fs);
    }

    let mut clean = WayneFS::mount(&clean_img).unwrap();
    let mut crashed = WayneFS::mount(&crash_img).unwrap();

    let observe = |fs: &mut WayneFS| {
        let mut root: Vec<(String, u32)> = fs
            .readdir("/d")
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.ino))
            .collect();
        root.sort();
        let (f_ino, f) = fs.getattr("/d/f").unwrap();
        let data = fs.read(f_ino, 0, 64).unwrap();
        let target = fs.readlink("/d/l").unwrap();
        let stat = fs.statfs();
        (root, f.nlink, f.size, data, target, stat)
    };

    assert_eq!(observe(&mut clean), observe(&mut crashed));
    clean.check_consistency().unwrap();
    crashed.check_consistency().unwrap();
}

#[test]
fn test_ordered_mode_data_precedes_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let img = new_image(&dir, "ordered.img");

    {
        let mut fs = WayneFS::mount(&img).unwrap();
        fs.create("/f", 0o644, UID, GID).unwrap();
        fs.unmount().unwrap();
    }
    let payload: Vec<u8> = (0..20000u32).map(|i| (i % 241) as u8).collect();
    {
        let mut fs = WayneFS::mount(&img).unwrap();
        fs.journal_mut().skip_checkpoint = true;
        let (ino, _) = fs.getattr("/f").unwrap();
        fs.write(ino, 0, &payload).unwrap();
    }

    // after replay, every replayed pointer sees the bytes of its own
    // transaction, never stale data
    let mut fs = WayneFS::mount(&img).unwrap();
    let (ino, inode) = fs.getattr("/f").unwrap();
    assert_eq!(inode.size, payload.len() as u64);
    assert_eq!(fs.read(ino, 0, payload.len() as u32).unwrap(), payload);
    fs.check_consistency().unwrap();
}

#[test]
fn test_multiple_pending_transactions_replay_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let img = new_image(&dir, "multi.img");

    {
        let mut fs = WayneFS::mount(&img).unwrap();
        fs.journal_mut().skip_checkpoint = true;
        fs.mkdir("/x", 0o755, UID, GID).unwrap();
        let (ino, _) = fs.create("/x/y", 0o644, UID, GID).unwrap();
        fs.write(ino, 0, b"first").unwrap();
        fs.write(ino, 5, b" second").unwrap();
        fs.truncate("/x/y", 5).unwrap();
    }

    let mut fs = WayneFS::mount(&img).unwrap();
    let (ino, inode) = fs.getattr("/x/y").unwrap();
    assert_eq!(inode.size, 5);
    assert_eq!(fs.read(ino, 0, 64).unwrap(), b"first");
    fs.check_consistency().unwrap();
}

#[test]
fn test_unlink_crash_recovers_free_space() {
    let dir = tempfile::tempdir().unwrap();
    let img = new_image(&dir, "unlink.img");

    let free_after_create = {
        let mut fs = WayneFS::mount(&img).unwrap();
        let (ino, _) = fs.create("/doomed", 0o644, UID, GID).unwrap();
        fs.write(ino, 0, &vec![7u8; 20000]).unwrap();
        fs.unmount().unwrap();
        let mut fs = WayneFS::mount(&img).unwrap();
        let free = fs.statfs().free_blocks;
        fs.journal_mut().skip_checkpoint = true;
        fs.unlink("/doomed").unwrap();
        free
    };

    let mut fs = WayneFS::mount(&img).unwrap();
    assert!(matches!(fs.getattr("/doomed"), Err(FsError::NotFound)));
    // the five data blocks and the inode came back
    assert_eq!(fs.statfs().free_blocks, free_after_create + 5);
    fs.check_consistency().unwrap();
}

#[test]
fn test_bad_magic_refuses_mount() {
    let dir = tempfile::tempdir().unwrap();
    let img = new_image(&dir, "magic.img");

    let mut file = OpenOptions::new().write(true).open(&img).unwrap();
    file.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
    file.flush().unwrap();
    drop(file);

    match WayneFS::mount(&img) {
        Err(e @ FsError::BadMagic) => assert_eq!(e.exit_code(), 3),
        other => panic!("expected BadMagic, got {other:?}"),
    }
}

#[test]
fn test_corrupt_log_superblock_refuses_mount() {
    let dir = tempfile::tempdir().unwrap();
    let img = new_image(&dir, "logsb.img");

    let geo = {
        let fs = WayneFS::mount(&img).unwrap();
        geometry(&fs)
    };
    let mut file = OpenOptions::new().write(true).open(&img).unwrap();
    file.seek(SeekFrom::Start(geo.journal_start * geo.block_size))
        .unwrap();
    file.write_all(&vec![0xABu8; 16]).unwrap();
    file.flush().unwrap();
    drop(file);

    match WayneFS::mount(&img) {
        Err(e @ FsError::JournalCorrupt(_)) => assert_eq!(e.exit_code(), 4),
        other => panic!("expected JournalCorrupt, got {other:?}"),
    }
}
