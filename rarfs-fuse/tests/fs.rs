//! End-to-end pipeline tests over synthetic archives: materialization,
//! probing, nested unpacking, collision handling and both read paths.

mod common;

use std::path::Path;
use std::sync::Arc;

use anyhow::Error;

use common::{listing, rar4_volume, shared_for, simple_archive, write_split_set, Member, WalkerDecoder};
use rarfs_config::Options;
use rarfs_format::index::{sidecar_path, write_index, IndexEntry};
use rarfs_format::RawGeometry;
use rarfs_fuse::decoder::Decoder;
use rarfs_fuse::filecache::{EntryFlags, FileCacheEntry, Lookup};
use rarfs_fuse::reader::{PipedReader, ProducerSpec, RawReader};
use rarfs_fuse::{prober, Shared};

fn entry_of(shared: &Shared, vpath: &str) -> Option<FileCacheEntry> {
    let cache = shared.cache.read().unwrap();
    match cache.files.get(vpath) {
        Lookup::Entry(entry) => Some(entry.clone()),
        _ => None,
    }
}

fn is_local(shared: &Shared, vpath: &str) -> bool {
    let cache = shared.cache.read().unwrap();
    matches!(cache.files.get(vpath), Lookup::Local)
}

fn raw_read_all(entry: &FileCacheEntry) -> Vec<u8> {
    let mut reader = RawReader::new(entry).unwrap();
    let mut out = Vec::new();
    loop {
        let piece = reader.read_at(out.len() as u64, 97).unwrap();
        if piece.is_empty() {
            break;
        }
        out.extend_from_slice(&piece);
    }
    out
}

/// Rebuild the nested chain the way the session does before spawning a
/// producer, then stream the member through the piped path.
async fn piped_read_all(shared: &Arc<Shared>, vpath: &str) -> Vec<u8> {
    let entry = entry_of(shared, vpath).expect("entry exists");
    let chain = {
        let cache = shared.cache.read().unwrap();
        let mut chain = Vec::new();
        let mut cursor = entry.parent_archive_path.clone();
        while let Some(parent_vpath) = cursor {
            match cache.files.get(parent_vpath.to_str().unwrap()) {
                Lookup::Entry(parent) => {
                    chain.push(parent.member_name.clone());
                    cursor = parent.parent_archive_path.clone();
                }
                _ => break,
            }
        }
        chain.reverse();
        chain
    };
    let spec = ProducerSpec {
        decoder: Arc::new(WalkerDecoder),
        archive: entry.archive_path.clone(),
        chain,
        member: entry.member_name.clone(),
        password: None,
        save_eof: false,
        declared_size: entry.stat.size,
    };
    let mut reader = PipedReader::new(spec, shared.opts.seek_length());
    let mut out = Vec::new();
    loop {
        let piece = reader.read(out.len() as u64, 100).await.unwrap();
        if piece.is_empty() {
            break;
        }
        out.extend_from_slice(&piece);
    }
    reader.shutdown().await;
    out
}

#[test]
fn stored_single_file_archive() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let archive = simple_archive(&[Member::stored(b"hello.txt", b"HELLO\n")]);
    std::fs::write(dir.path().join("greeting.rar"), archive)?;

    let shared = shared_for(dir.path(), Options::default());
    assert_eq!(listing(&shared, "/"), ["hello.txt"]);

    let entry = entry_of(&shared, "/hello.txt").expect("member probed");
    assert!(entry.flags.contains(EntryFlags::RAW));
    assert!(entry.flags.contains(EntryFlags::VSIZE_RESOLVED));
    assert_eq!(entry.stat.size, 6);
    assert_eq!(rarfs_format::method_name(entry.method), "store");
    assert_eq!(raw_read_all(&entry), b"HELLO\n");

    // The archive itself is hidden behind its contents.
    let hidden = entry_of(&shared, "/greeting.rar").expect("hidden record");
    assert!(hidden.hide_from_listing);
    Ok(())
}

#[test]
fn member_subdirectories_materialize() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let archive = simple_archive(&[
        Member::stored(b"docs/a.txt", b"A"),
        Member::stored(b"docs/deep/b.txt", b"B"),
        Member::stored(b"top.txt", b"T"),
    ]);
    std::fs::write(dir.path().join("tree.rar"), archive)?;

    let shared = shared_for(dir.path(), Options::default());
    assert_eq!(listing(&shared, "/"), ["docs", "top.txt"]);
    assert_eq!(listing(&shared, "/docs"), ["a.txt", "deep"]);
    assert_eq!(listing(&shared, "/docs/deep"), ["b.txt"]);

    let synthetic = entry_of(&shared, "/docs").expect("synthetic dir");
    assert!(synthetic.is_dir());
    assert!(synthetic.member_name.is_empty());

    let deep = entry_of(&shared, "/docs/deep/b.txt").unwrap();
    assert_eq!(raw_read_all(&deep), b"B");
    Ok(())
}

#[test]
fn corrupt_archives_pass_through() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("noise.rar"), vec![0x37u8; 10 * 1024])?;
    // A truncation that still carries the signature.
    let valid = simple_archive(&[Member::stored(b"x", b"xxxx")]);
    std::fs::write(dir.path().join("cut.rar"), &valid[..20])?;

    let shared = shared_for(dir.path(), Options::default());
    let names = listing(&shared, "/");
    assert_eq!(names, ["cut.rar", "noise.rar"]);
    assert!(is_local(&shared, "/noise.rar"));
    assert!(is_local(&shared, "/cut.rar"));
    Ok(())
}

#[test]
fn passthrough_wins_name_collisions() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("dup.txt"), b"from the filesystem")?;
    let archive = simple_archive(&[Member::stored(b"dup.txt", b"from the archive")]);
    std::fs::write(dir.path().join("a.rar"), archive)?;

    let shared = shared_for(dir.path(), Options::default());
    assert_eq!(listing(&shared, "/"), ["dup.txt"]);
    assert!(is_local(&shared, "/dup.txt"));
    Ok(())
}

#[test]
fn multi_volume_raw_reads() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let content: Vec<u8> = (0..100_000u32).map(|v| (v % 253) as u8).collect();
    write_split_set(dir.path(), "big", b"big.bin", &content, 30_000);

    let shared = shared_for(dir.path(), Options::default());
    assert_eq!(listing(&shared, "/"), ["big.bin"]);

    let entry = entry_of(&shared, "/big.bin").expect("folded member");
    assert!(entry.flags.contains(EntryFlags::RAW));
    assert!(entry.flags.contains(EntryFlags::MULTIPART));
    assert!(entry.flags.contains(EntryFlags::VSIZE_RESOLVED));
    assert_eq!(entry.stat.size, content.len() as u64);
    assert_eq!(entry.geometry.volumes_spanned(entry.stat.size), 4);
    assert_eq!(raw_read_all(&entry), content);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn compressed_members_use_the_piped_path() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let payload: Vec<u8> = (0..5000u32).map(|v| (v % 249) as u8).collect();
    let archive = simple_archive(&[Member::compressed(b"packed.bin", &payload)]);
    std::fs::write(dir.path().join("c.rar"), archive)?;

    let shared = shared_for(dir.path(), Options::default());
    assert_eq!(listing(&shared, "/"), ["packed.bin"]);
    let entry = entry_of(&shared, "/packed.bin").unwrap();
    assert!(!entry.flags.contains(EntryFlags::RAW));
    assert_eq!(rarfs_format::method_name(entry.method), "normal");

    assert_eq!(piped_read_all(&shared, "/packed.bin").await, payload);
    Ok(())
}

fn nested_fixture(dir: &Path) {
    let inner = simple_archive(&[Member::stored(b"l3.txt", b"level three")]);
    let mid = simple_archive(&[
        Member::stored(b"l2.txt", b"level two"),
        Member::stored(b"inner.rar", &inner),
    ]);
    let outer = simple_archive(&[
        Member::stored(b"l1.txt", b"level one"),
        Member::stored(b"mid.rar", &mid),
    ]);
    std::fs::write(dir.join("outer.rar"), outer).unwrap();
}

#[test]
fn nested_archives_flatten_when_recursive() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    nested_fixture(dir.path());

    let shared = shared_for(
        dir.path(),
        Options {
            recursive: Some(true),
            ..Default::default()
        },
    );
    assert_eq!(listing(&shared, "/"), ["l1.txt", "l2.txt", "l3.txt"]);

    let l3 = entry_of(&shared, "/l3.txt").expect("deeply nested member");
    assert_eq!(l3.nested_depth, 2);
    assert!(!l3.flags.contains(EntryFlags::RAW));
    assert_eq!(
        l3.parent_archive_path.as_deref(),
        Some(Path::new("/inner.rar"))
    );

    let mid = entry_of(&shared, "/mid.rar").expect("hidden nested archive");
    assert!(mid.hide_from_listing);
    assert!(mid.flags.contains(EntryFlags::IS_NESTED_RAR));
    Ok(())
}

#[test]
fn nested_archives_stay_files_without_recursive() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    nested_fixture(dir.path());

    let shared = shared_for(dir.path(), Options::default());
    assert_eq!(listing(&shared, "/"), ["l1.txt", "mid.rar"]);
    let mid = entry_of(&shared, "/mid.rar").unwrap();
    assert!(!mid.hide_from_listing);
    assert!(mid.flags.contains(EntryFlags::RAW));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_members_read_through_the_chain() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    nested_fixture(dir.path());

    let shared = shared_for(
        dir.path(),
        Options {
            recursive: Some(true),
            ..Default::default()
        },
    );
    listing(&shared, "/");
    assert_eq!(piped_read_all(&shared, "/l2.txt").await, b"level two");
    assert_eq!(piped_read_all(&shared, "/l3.txt").await, b"level three");
    Ok(())
}

#[test]
fn recursion_depth_limits_flattening() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    nested_fixture(dir.path());

    // Depth 1: mid.rar expands, inner.rar does not.
    let shared = shared_for(
        dir.path(),
        Options {
            recursive: Some(true),
            recursion_depth: Some(1),
            ..Default::default()
        },
    );
    assert_eq!(listing(&shared, "/"), ["inner.rar", "l1.txt", "l2.txt"]);
    let inner = entry_of(&shared, "/inner.rar").unwrap();
    assert!(!inner.hide_from_listing);
    assert_eq!(inner.nested_depth, 1);
    Ok(())
}

#[test]
fn unpack_size_budget_blocks_expansion() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    nested_fixture(dir.path());

    let shared = shared_for(
        dir.path(),
        Options {
            recursive: Some(true),
            max_unpack_size: Some(16),
            ..Default::default()
        },
    );
    // Too small a budget: the nested archive is exposed as a plain file.
    assert_eq!(listing(&shared, "/"), ["l1.txt", "mid.rar"]);
    Ok(())
}

#[test]
fn sibling_nested_collisions_are_first_wins() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let first = simple_archive(&[Member::stored(b"dup.txt", b"from alpha")]);
    let second = simple_archive(&[Member::stored(b"dup.txt", b"from beta")]);
    let host_a = simple_archive(&[Member::stored(b"alpha.rar", &first)]);
    let host_b = simple_archive(&[Member::stored(b"beta.rar", &second)]);
    std::fs::write(dir.path().join("a.rar"), host_a)?;
    std::fs::write(dir.path().join("b.rar"), host_b)?;

    let shared = shared_for(
        dir.path(),
        Options {
            recursive: Some(true),
            ..Default::default()
        },
    );
    assert_eq!(listing(&shared, "/"), ["dup.txt"]);
    let winner = entry_of(&shared, "/dup.txt").unwrap();
    // Probe order is alphabetical, so alpha's copy wins.
    assert_eq!(
        winner.parent_archive_path.as_deref(),
        Some(Path::new("/alpha.rar"))
    );
    Ok(())
}

#[test]
fn identical_nested_siblings_are_not_a_cycle() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let leaf = simple_archive(&[Member::stored(b"one.txt", b"1")]);
    let outer = simple_archive(&[
        Member::stored(b"a/copy1.rar", &leaf),
        Member::stored(b"b/copy2.rar", &leaf),
    ]);
    std::fs::write(dir.path().join("twins.rar"), outer)?;

    let shared = shared_for(
        dir.path(),
        Options {
            recursive: Some(true),
            ..Default::default()
        },
    );
    // Identical bytes at sibling positions expand twice; the fingerprint
    // stack only rejects ancestors.
    assert_eq!(listing(&shared, "/"), ["a", "b"]);
    assert_eq!(listing(&shared, "/a"), ["one.txt"]);
    assert_eq!(listing(&shared, "/b"), ["one.txt"]);
    Ok(())
}

#[test]
fn aliases_rename_members() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let archive = simple_archive(&[Member::stored(b"ugly~name.mkv", b"movie bytes")]);
    std::fs::write(dir.path().join("show.rar"), archive)?;
    std::fs::write(
        dir.path().join(".rarconfig"),
        format!(
            "[{}]\nalias = \"ugly~name.mkv\", \"nice name.mkv\"\n",
            dir.path().canonicalize()?.join("show.rar").display()
        ),
    )?;

    let shared = shared_for(dir.path(), Options::default());
    assert_eq!(listing(&shared, "/"), ["nice name.mkv"]);
    let entry = entry_of(&shared, "/nice name.mkv").unwrap();
    // The decoder-facing name stays the original.
    assert_eq!(entry.member_name, "ugly~name.mkv");
    assert_eq!(raw_read_all(&entry), b"movie bytes");
    Ok(())
}

#[test]
fn symlink_members_resolve_targets() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let archive = simple_archive(&[
        Member::stored(b"real.txt", b"data"),
        Member {
            unix_mode: Some(0o120777),
            ..Member::stored(b"link.txt", b"real.txt")
        },
    ]);
    std::fs::write(dir.path().join("links.rar"), archive)?;

    let shared = shared_for(dir.path(), Options::default());
    listing(&shared, "/");
    let link = entry_of(&shared, "/link.txt").unwrap();
    assert!(link.stat.is_symlink());
    assert_eq!(link.link_target.as_deref(), Some("real.txt"));
    Ok(())
}

#[test]
fn flat_only_skips_directory_members() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let archive = simple_archive(&[
        Member::stored(b"top.txt", b"T"),
        Member::stored(b"sub/nested.txt", b"N"),
    ]);
    std::fs::write(dir.path().join("t.rar"), archive)?;

    let shared = shared_for(
        dir.path(),
        Options {
            flat_only: Some(true),
            ..Default::default()
        },
    );
    assert_eq!(listing(&shared, "/"), ["top.txt"]);
    assert!(entry_of(&shared, "/sub/nested.txt").is_none());
    Ok(())
}

#[test]
fn sidecar_index_skips_the_walk() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let archive = simple_archive(&[Member::stored(b"real.txt", b"payload!")]);
    let archive_path = dir.path().join("idx.rar");
    std::fs::write(&archive_path, &archive)?;

    // The index deliberately names a different member: if it is honored,
    // the walk was skipped.
    let data_offset = archive.len() as u64 - 8 - 7;
    write_index(
        &sidecar_path(&archive_path),
        &[IndexEntry {
            name: "from-index.txt".into(),
            size: 8,
            mtime: 1_700_000_000,
            unix_mode: Some(0o100644),
            method: 0,
            raw: true,
            directory: false,
            encrypted: false,
            multipart: false,
            link_target: None,
            geometry: RawGeometry {
                offset: data_offset,
                vsize_real_first: 8,
                vsize_first: archive.len() as u64,
                ..Default::default()
            },
        }],
    )?;

    for mmap_off in [false, true] {
        let shared = shared_for(
            dir.path(),
            Options {
                no_idx_mmap: Some(mmap_off),
                ..Default::default()
            },
        );
        assert_eq!(listing(&shared, "/"), ["from-index.txt"]);
        let entry = entry_of(&shared, "/from-index.txt").unwrap();
        assert!(entry.flags.contains(EntryFlags::RAW));
        assert_eq!(raw_read_all(&entry), b"payload!");
    }
    Ok(())
}

#[test]
fn encrypted_headers_fall_back_to_the_decoder_listing() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let archive = rar4_volume(
        &[Member::stored(b"secret.txt", b"classified")],
        false,
        false,
        true,
    );
    std::fs::write(dir.path().join("locked.rar"), archive)?;

    // Without a password the archive demotes to passthrough.
    let shared = shared_for(dir.path(), Options::default());
    assert_eq!(listing(&shared, "/"), ["locked.rar"]);
    assert!(is_local(&shared, "/locked.rar"));

    // With one, the decoder lists members; they are always piped.
    std::fs::write(
        dir.path().join(".rarconfig"),
        format!(
            "[{}]\npassword = \"pw\"\n",
            dir.path().canonicalize()?.join("locked.rar").display()
        ),
    )?;
    let shared = shared_for(dir.path(), Options::default());
    assert_eq!(listing(&shared, "/"), ["secret.txt"]);
    let entry = entry_of(&shared, "/secret.txt").unwrap();
    assert!(!entry.flags.contains(EntryFlags::RAW));
    assert!(entry.flags.contains(EntryFlags::ENCRYPTED));
    Ok(())
}

#[test]
fn light_pass_defers_archive_probing() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("plain.txt"), b"just a file")?;
    let archive = simple_archive(&[Member::stored(b"inside.txt", b"I")]);
    std::fs::write(dir.path().join("a.rar"), archive)?;

    let shared = shared_for(dir.path(), Options::default());
    prober::materialize_dir(&shared, "/", false)?;
    {
        let cache = shared.cache.read().unwrap();
        assert!(matches!(cache.files.get("/plain.txt"), Lookup::Local));
        match cache.files.get("/a.rar") {
            Lookup::Entry(placeholder) => {
                assert!(placeholder.flags.contains(EntryFlags::DETECTION_DEFERRED));
                assert!(placeholder.flags.contains(EntryFlags::UNRESOLVED));
            }
            other => panic!("expected a deferred placeholder, got {:?}", other),
        }
        // The member is not there yet.
        assert!(matches!(cache.files.get("/inside.txt"), Lookup::Miss));
    }

    // The full pass resolves the placeholder into members.
    assert_eq!(listing(&shared, "/"), ["inside.txt", "plain.txt"]);
    Ok(())
}

#[test]
fn repeated_materialization_is_stable() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let archive = simple_archive(&[Member::stored(b"one.txt", b"1"), Member::stored(b"two.txt", b"22")]);
    std::fs::write(dir.path().join("a.rar"), archive)?;

    let shared = shared_for(dir.path(), Options::default());
    let first = listing(&shared, "/");
    let again = listing(&shared, "/");
    assert_eq!(first, again);

    let stat_one = entry_of(&shared, "/one.txt").unwrap().stat;
    let stat_two = entry_of(&shared, "/one.txt").unwrap().stat;
    assert_eq!(stat_one, stat_two);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn decoder_extraction_helper_respects_names() -> Result<(), Error> {
    // extract_member must match decoder names after sanitization, so a
    // member recorded with backslashes is still found by its clean name.
    let archive = simple_archive(&[Member::stored(b"dir\\file.bin", b"found me")]);
    let source = rarfs_fuse::decoder::ArchiveSource::Memory {
        data: Arc::new(archive),
        name: "synthetic.rar".into(),
    };
    let decoder: Arc<dyn Decoder> = Arc::new(WalkerDecoder);
    let data = tokio::task::spawn_blocking(move || {
        rarfs_fuse::decoder::extract_member(&decoder, &source, None, "dir/file.bin", 1 << 20, None)
    })
    .await??;
    assert_eq!(data, b"found me");
    Ok(())
}
