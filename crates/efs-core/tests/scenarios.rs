//! End-to-end scenarios against freshly formatted images.

use efs_core::{
    EfsError, FileBlockDevice, FileKind, FileSystem, FormatOptions, MemBlockDevice, O_CREAT,
    O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MIB: u64 = 1024 * 1024;

fn mem_fs(size_mib: u64) -> FileSystem {
    let dev = MemBlockDevice::new(4096, size_mib * MIB / 4096);
    efs_core::format(Box::new(dev), &FormatOptions::default()).expect("format")
}

fn write_file(fs: &mut FileSystem, path: &str, data: &[u8]) {
    let fd = fs.openf(path, O_CREAT | O_WRONLY | O_TRUNC, 0o644).expect("openf");
    fs.write(fd, data, None).expect("write");
    fs.close(fd).expect("close");
}

fn read_file(fs: &mut FileSystem, path: &str) -> Vec<u8> {
    let fd = fs.openf(path, O_RDONLY, 0).expect("openf");
    let mut out = Vec::new();
    loop {
        let chunk = fs.read(fd, 64 * 1024, None).expect("read");
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    fs.close(fd).expect("close");
    out
}

fn names(fs: &FileSystem, path: &str) -> Vec<String> {
    fs.readdir(path)
        .expect("readdir")
        .into_iter()
        .map(|e| e.name_str())
        .collect()
}

// ── Scenario 1: fresh 8 MiB image ───────────────────────────────────────────

#[test]
fn fresh_image_geometry_and_empty_root() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");
    let dev = FileBlockDevice::create(&path, 4096, 8 * MIB / 4096).unwrap();
    let mut fs = efs_core::format(Box::new(dev), &FormatOptions::default()).unwrap();

    assert_eq!(fs.superblock().fs_size_blocks, 2048);
    assert_eq!(fs.superblock().block_size, 4096);

    let root = fs.stat("/").unwrap();
    assert_eq!(root.ino, 2);
    assert_eq!(root.kind, FileKind::Directory);
    assert_eq!(root.links_count, 2);

    assert_eq!(names(&fs, "/"), vec![".", ".."]);
    fs.verify_allocator_invariants().unwrap();

    // Remounting from disk sees the same state.
    fs.sync().unwrap();
    drop(fs);
    let fs = FileSystem::open_path(&path).unwrap();
    assert_eq!(fs.superblock().fs_size_blocks, 2048);
    assert_eq!(names(&fs, "/"), vec![".", ".."]);
    fs.verify_allocator_invariants().unwrap();
}

// ── Scenario 2: nested directories and a small file ─────────────────────────

#[test]
fn nested_mkdir_write_and_stat() {
    let mut fs = mem_fs(8);
    fs.mkdir("/a", 0o755).unwrap();
    fs.mkdir("/a/b", 0o755).unwrap();
    write_file(&mut fs, "/a/b/f", b"hi");

    assert_eq!(read_file(&mut fs, "/a/b/f"), b"hi");
    assert_eq!(fs.stat("/a/b/f").unwrap().size, 2);
    assert_eq!(fs.stat("/a/b/f").unwrap().kind, FileKind::Regular);

    // Directory link counts: parent gains one per subdirectory.
    assert_eq!(fs.stat("/").unwrap().links_count, 3);
    assert_eq!(fs.stat("/a").unwrap().links_count, 3);
    assert_eq!(fs.stat("/a/b").unwrap().links_count, 2);

    fs.verify_allocator_invariants().unwrap();
}

// ── Scenario 3: 1 MiB random round-trip across a remount ────────────────────

#[test]
fn large_random_file_survives_remount() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");
    let dev = FileBlockDevice::create(&path, 4096, 16 * MIB / 4096).unwrap();
    let mut fs = efs_core::format(Box::new(dev), &FormatOptions::default()).unwrap();

    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut data = vec![0_u8; MIB as usize];
    rng.fill(&mut data[..]);

    write_file(&mut fs, "/blob", &data);
    assert_eq!(fs.stat("/blob").unwrap().size, MIB);
    fs.verify_allocator_invariants().unwrap();
    drop(fs);

    let mut fs = FileSystem::open_path(&path).unwrap();
    assert_eq!(read_file(&mut fs, "/blob"), data);
}

// ── Scenario 4: directory churn keeps insertion order ───────────────────────

#[test]
fn thousands_of_entries_listed_in_insertion_order() {
    // Two block groups so 4000 inodes fit.
    let mut fs = mem_fs(64);

    for i in 0..4000 {
        let path = format!("/f{i:04}");
        let fd = fs.openf(&path, O_CREAT | O_WRONLY, 0o644).unwrap();
        fs.close(fd).unwrap();
    }
    for i in (0..4000).step_by(2) {
        fs.unlink(&format!("/f{i:04}")).unwrap();
    }

    let listed: Vec<String> = names(&fs, "/")
        .into_iter()
        .filter(|n| n != "." && n != "..")
        .collect();
    let expected: Vec<String> = (0..4000)
        .filter(|i| i % 2 == 1)
        .map(|i| format!("f{i:04}"))
        .collect();
    assert_eq!(listed, expected);

    // No duplicates, and every name still resolves to a live inode.
    let mut sorted = listed.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), listed.len());
    assert_eq!(fs.stat("/f0001").unwrap().kind, FileKind::Regular);

    fs.verify_allocator_invariants().unwrap();
}

// ── Scenario 5: hard links ──────────────────────────────────────────────────

#[test]
fn hard_link_keeps_data_alive_until_last_name() {
    let mut fs = mem_fs(8);
    let free_before = fs.df().free_blocks;

    write_file(&mut fs, "/x", &vec![7_u8; 10_000]);
    fs.link("/x", "/y").unwrap();
    assert_eq!(fs.stat("/x").unwrap().links_count, 2);
    assert_eq!(fs.stat("/y").unwrap().ino, fs.stat("/x").unwrap().ino);

    fs.unlink("/x").unwrap();
    assert_eq!(read_file(&mut fs, "/y"), vec![7_u8; 10_000]);
    assert_eq!(fs.stat("/y").unwrap().links_count, 1);

    fs.unlink("/y").unwrap();
    assert_eq!(fs.df().free_blocks, free_before);
    assert!(matches!(fs.stat("/y"), Err(EfsError::NotFound(_))));
    fs.verify_allocator_invariants().unwrap();
}

#[test]
fn hard_link_to_directory_is_rejected() {
    let mut fs = mem_fs(8);
    fs.mkdir("/d", 0o755).unwrap();
    assert!(matches!(
        fs.link("/d", "/d2"),
        Err(EfsError::IsDirectory(_))
    ));
}

// ── Scenario 6: symlinks ────────────────────────────────────────────────────

#[test]
fn symlinks_follow_and_loop_detection() {
    let mut fs = mem_fs(8);
    fs.mkdir("/a", 0o755).unwrap();
    fs.mkdir("/a/b", 0o755).unwrap();
    write_file(&mut fs, "/a/b/f", b"through the link");

    fs.symlink("/a/b/f", "/link").unwrap();
    assert_eq!(read_file(&mut fs, "/link"), b"through the link");
    assert_eq!(fs.lstat("/link").unwrap().kind, FileKind::Symlink);
    assert_eq!(fs.stat("/link").unwrap().kind, FileKind::Regular);
    assert_eq!(fs.read_link("/link").unwrap(), "/a/b/f");

    fs.symlink("/loop", "/loop").unwrap();
    assert!(matches!(
        fs.openf("/loop", O_RDONLY, 0),
        Err(EfsError::SymlinkLoop(_))
    ));

    // A target longer than the 48-byte inline window goes through a data
    // block and still round-trips.
    let long_target = format!("/a/b/{}", "x".repeat(80));
    fs.symlink(&long_target, "/long").unwrap();
    assert_eq!(fs.read_link("/long").unwrap(), long_target);
    assert_eq!(fs.lstat("/long").unwrap().size, long_target.len() as u64);

    fs.verify_allocator_invariants().unwrap();
}

#[test]
fn relative_symlink_resolves_from_its_directory() {
    let mut fs = mem_fs(8);
    fs.mkdir("/a", 0o755).unwrap();
    write_file(&mut fs, "/a/real", b"data");
    fs.symlink("real", "/a/alias").unwrap();
    assert_eq!(read_file(&mut fs, "/a/alias"), b"data");
}

// ── Scenario 7: exhaustion ──────────────────────────────────────────────────

#[test]
fn filling_the_filesystem_returns_nospc_and_keeps_size() {
    let mut fs = mem_fs(8);

    let fd = fs.openf("/big", O_CREAT | O_WRONLY, 0o644).unwrap();
    let chunk = vec![0xAB_u8; 256 * 1024];
    let mut written_total = 0_u64;
    let err = loop {
        match fs.write(fd, &chunk, None) {
            Ok(n) => written_total += n as u64,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, EfsError::NoSpace));
    assert!(written_total > 0);

    // The failed write left the size at the last successful byte and the
    // allocator consistent.
    assert_eq!(fs.stat("/big").unwrap().size, written_total);
    fs.verify_allocator_invariants().unwrap();

    // Freeing the file makes space again.
    fs.close(fd).unwrap();
    fs.unlink("/big").unwrap();
    write_file(&mut fs, "/small", b"fits again");
    assert_eq!(read_file(&mut fs, "/small"), b"fits again");
    fs.verify_allocator_invariants().unwrap();
}

// ── Write/overlay/truncate properties ───────────────────────────────────────

#[test]
fn write_then_read_at_offsets() {
    let mut fs = mem_fs(8);
    let fd = fs.openf("/f", O_CREAT | O_RDWR, 0o644).unwrap();

    fs.write(fd, b"hello world", Some(0)).unwrap();
    assert_eq!(fs.read(fd, 64, Some(0)).unwrap(), b"hello world");

    // Overlay in place.
    fs.write(fd, b"HELLO", Some(0)).unwrap();
    assert_eq!(fs.read(fd, 64, Some(0)).unwrap(), b"HELLO world");

    // Write past EOF materializes zeros, never stale bytes.
    fs.write(fd, b"tail", Some(100)).unwrap();
    let data = fs.read(fd, 200, Some(0)).unwrap();
    assert_eq!(data.len(), 104);
    assert_eq!(&data[..5], b"HELLO");
    assert!(data[11..100].iter().all(|&b| b == 0));
    assert_eq!(&data[100..], b"tail");

    fs.close(fd).unwrap();
    fs.verify_allocator_invariants().unwrap();
}

#[test]
fn cross_block_writes_round_trip() {
    let mut fs = mem_fs(8);
    let mut rng = StdRng::seed_from_u64(42);
    let mut data = vec![0_u8; 3 * 4096 + 1234];
    rng.fill(&mut data[..]);

    // Write in awkward chunk sizes spanning block boundaries.
    let fd = fs.openf("/f", O_CREAT | O_WRONLY, 0o644).unwrap();
    for piece in data.chunks(1000) {
        fs.write(fd, piece, None).unwrap();
    }
    fs.close(fd).unwrap();

    assert_eq!(read_file(&mut fs, "/f"), data);
}

#[test]
fn truncate_shrinks_grows_and_is_idempotent() {
    let mut fs = mem_fs(8);
    write_file(&mut fs, "/f", &vec![9_u8; 20_000]);
    let free_after_write = fs.df().free_blocks;

    let fd = fs.openf("/f", O_RDWR, 0).unwrap();
    fs.ftruncate(fd, 5_000).unwrap();
    assert_eq!(fs.stat("/f").unwrap().size, 5_000);
    assert_eq!(read_file(&mut fs, "/f"), vec![9_u8; 5_000]);
    assert!(fs.df().free_blocks > free_after_write);

    let free_after_shrink = fs.df().free_blocks;
    fs.ftruncate(fd, 5_000).unwrap();
    assert_eq!(fs.stat("/f").unwrap().size, 5_000);
    assert_eq!(fs.df().free_blocks, free_after_shrink);

    // Growth zero-fills, including the stale tail of the straddling block.
    fs.ftruncate(fd, 9_000).unwrap();
    let data = read_file(&mut fs, "/f");
    assert_eq!(data.len(), 9_000);
    assert_eq!(&data[..5_000], vec![9_u8; 5_000].as_slice());
    assert!(data[5_000..].iter().all(|&b| b == 0));

    fs.close(fd).unwrap();
    fs.verify_allocator_invariants().unwrap();
}

// ── Namespace behaviour ─────────────────────────────────────────────────────

#[test]
fn rmdir_semantics() {
    let mut fs = mem_fs(8);
    fs.mkdir("/d", 0o755).unwrap();
    write_file(&mut fs, "/d/f", b"x");

    assert!(matches!(fs.rmdir("/d"), Err(EfsError::NotEmpty(_))));
    assert!(matches!(fs.rmdir("/d/f"), Err(EfsError::NotDirectory(_))));

    fs.unlink("/d/f").unwrap();
    fs.rmdir("/d").unwrap();
    assert!(matches!(fs.stat("/d"), Err(EfsError::NotFound(_))));
    assert_eq!(fs.stat("/").unwrap().links_count, 2);
    fs.verify_allocator_invariants().unwrap();
}

#[test]
fn rmdir_recursive_removes_trees() {
    let mut fs = mem_fs(8);
    let free_before = fs.df().free_blocks;
    let inodes_before = fs.df().free_inodes;

    fs.mkdir("/top", 0o755).unwrap();
    fs.mkdir("/top/sub", 0o755).unwrap();
    write_file(&mut fs, "/top/a", b"a");
    write_file(&mut fs, "/top/sub/b", &vec![1_u8; 9000]);
    fs.symlink("/top/a", "/top/sub/l").unwrap();

    fs.rmdir_recursive("/top").unwrap();
    assert!(matches!(fs.stat("/top"), Err(EfsError::NotFound(_))));
    assert_eq!(fs.df().free_blocks, free_before);
    assert_eq!(fs.df().free_inodes, inodes_before);
    fs.verify_allocator_invariants().unwrap();
}

#[test]
fn unlinked_but_open_file_survives_until_close() {
    let mut fs = mem_fs(8);
    write_file(&mut fs, "/f", b"still here");
    let free_after_write = fs.df().free_blocks;

    let fd = fs.openf("/f", O_RDONLY, 0).unwrap();
    fs.unlink("/f").unwrap();
    assert!(matches!(fs.stat("/f"), Err(EfsError::NotFound(_))));

    // Data is still readable through the open descriptor.
    assert_eq!(fs.read(fd, 64, Some(0)).unwrap(), b"still here");
    assert_eq!(fs.df().free_blocks, free_after_write);

    // Last close frees blocks and the inode.
    let free_inodes = fs.df().free_inodes;
    fs.close(fd).unwrap();
    assert!(fs.df().free_blocks > free_after_write);
    assert_eq!(fs.df().free_inodes, free_inodes + 1);
    fs.verify_allocator_invariants().unwrap();
}

#[test]
fn chdir_and_relative_paths() {
    let mut fs = mem_fs(8);
    fs.mkdir("/a", 0o755).unwrap();
    fs.mkdir("/a/b", 0o755).unwrap();
    write_file(&mut fs, "/a/b/f", b"rel");

    assert_eq!(fs.getcwd(), "/");
    fs.chdir("/a").unwrap();
    assert_eq!(fs.getcwd(), "/a");
    assert_eq!(read_file(&mut fs, "b/f"), b"rel");

    fs.chdir("b").unwrap();
    assert_eq!(fs.getcwd(), "/a/b");
    fs.chdir("..").unwrap();
    assert_eq!(fs.getcwd(), "/a");
    fs.chdir("../..").unwrap();
    assert_eq!(fs.getcwd(), "/");
    // `..` at the root stays at the root.
    fs.chdir("..").unwrap();
    assert_eq!(fs.getcwd(), "/");

    assert!(matches!(
        fs.chdir("/a/b/f"),
        Err(EfsError::NotDirectory(_))
    ));
}

#[test]
fn chmod_chown_update_metadata() {
    let mut fs = mem_fs(8);
    write_file(&mut fs, "/f", b"x");

    fs.chmod("/f", 0o600).unwrap();
    let st = fs.stat("/f").unwrap();
    assert_eq!(st.mode & 0o7777, 0o600);
    assert_eq!(st.kind, FileKind::Regular);

    fs.chown("/f", 1000, 100).unwrap();
    let st = fs.stat("/f").unwrap();
    assert_eq!((st.uid, st.gid), (1000, 100));
}

#[test]
fn open_flags_are_enforced() {
    let mut fs = mem_fs(8);
    write_file(&mut fs, "/f", b"content");

    let fd = fs.openf("/f", O_RDONLY, 0).unwrap();
    assert!(matches!(
        fs.write(fd, b"nope", None),
        Err(EfsError::InvalidArgument(_))
    ));
    fs.close(fd).unwrap();

    let fd = fs.openf("/f", O_WRONLY, 0).unwrap();
    assert!(matches!(
        fs.read(fd, 10, None),
        Err(EfsError::InvalidArgument(_))
    ));
    fs.close(fd).unwrap();

    // O_TRUNC clears existing content.
    let fd = fs.openf("/f", O_WRONLY | O_TRUNC, 0).unwrap();
    fs.close(fd).unwrap();
    assert_eq!(fs.stat("/f").unwrap().size, 0);

    assert!(matches!(
        fs.openf("/missing", O_RDONLY, 0),
        Err(EfsError::NotFound(_))
    ));
    assert!(matches!(fs.read(99, 10, None), Err(EfsError::BadDescriptor(99))));
}
