//! End-to-end scenarios driven through the ops core, including full
//! commit / remount round trips and the unmount handshake.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use wimfs::archive::{CommitStream, StreamSource, WimArchive};
use wimfs::dentry::{DentryTree, FILE_ATTRIBUTE_NORMAL, ROOT_DENTRY};
use wimfs::error::WimError;
use wimfs::hash::sha1_bytes;
use wimfs::ops::{MountConfig, MountContext, StreamInterface};
use wimfs::staging::StagingDir;
use wimfs::unmount;

const NULL_FH: u64 = 0;

fn archive_path(dir: &Path) -> PathBuf {
    dir.join("test.wim")
}

fn config(read_write: bool, mountpoint: &str) -> MountConfig {
    MountConfig {
        read_write,
        stream_interface: StreamInterface::Windows,
        mountpoint: PathBuf::from(mountpoint),
        image_index: 1,
    }
}

/// Opens the archive in `dir`, keeping staging under the test dir instead of
/// the process cwd.
fn mount(dir: &Path, read_write: bool, mountpoint: &str) -> MountContext {
    let archive = WimArchive::open(&archive_path(dir)).unwrap();
    let mut ctx = MountContext::new(archive, config(read_write, mountpoint)).unwrap();
    if read_write {
        if let Some(old) = ctx.staging.take() {
            old.remove().unwrap();
        }
        ctx.staging = Some(StagingDir::create(dir).unwrap());
    }
    ctx
}

fn fresh_image(dir: &Path) {
    WimArchive::create(&archive_path(dir), "test-image").unwrap();
}

fn write_file(ctx: &mut MountContext, path: &str, data: &[u8]) {
    ctx.mknod(OsStr::new(path)).unwrap();
    let fh = ctx.open(OsStr::new(path), libc::O_WRONLY as u32).unwrap();
    assert_eq!(ctx.write(fh, 0, data).unwrap(), data.len());
    ctx.release(fh).unwrap();
}

fn read_path(ctx: &mut MountContext, path: &str) -> Vec<u8> {
    let fh = ctx.open(OsStr::new(path), libc::O_RDONLY as u32).unwrap();
    let mut out = Vec::new();
    loop {
        let chunk = ctx.read(fh, out.len() as u64, 4096).unwrap();
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    ctx.release(fh).unwrap();
    out
}

/// Builds an image containing `/a` = "hello" and returns a fresh context.
fn image_with_hello(dir: &Path, read_write: bool, mountpoint: &str) -> MountContext {
    fresh_image(dir);
    let mut ctx = mount(dir, true, mountpoint);
    write_file(&mut ctx, "/a", b"hello");
    ctx.shutdown(true, true).unwrap();
    mount(dir, read_write, mountpoint)
}

#[test]
fn read_only_mount_serves_archive_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = image_with_hello(dir.path(), false, "/mnt/ro");

    assert_eq!(read_path(&mut ctx, "/a"), b"hello");
    assert_eq!(ctx.stat_path(OsStr::new("/a")).unwrap().size, 5);
    ctx.verify_invariants().unwrap();

    // mutations are refused outright
    assert!(matches!(
        ctx.mknod(OsStr::new("/new")),
        Err(WimError::ReadOnly)
    ));
    assert!(matches!(
        ctx.open(OsStr::new("/a"), libc::O_WRONLY as u32),
        Err(WimError::ReadOnly)
    ));
}

#[test]
fn read_past_end_of_archive_stream() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = image_with_hello(dir.path(), false, "/mnt/ro-eof");

    let fh = ctx.open(OsStr::new("/a"), libc::O_RDONLY as u32).unwrap();
    // a short read at the boundary, an overflow past it
    assert_eq!(ctx.read(fh, 3, 100).unwrap(), b"lo");
    assert_eq!(ctx.read(fh, 5, 100).unwrap(), b"");
    assert!(matches!(ctx.read(fh, 6, 1), Err(WimError::Overflow)));
    ctx.release(fh).unwrap();
}

#[test]
fn empty_file_opens_as_null_handle_read_only() {
    let dir = tempfile::tempdir().unwrap();
    fresh_image(dir.path());
    let mut ctx = mount(dir.path(), true, "/mnt/empty");
    ctx.mknod(OsStr::new("/empty")).unwrap();
    ctx.shutdown(true, false).unwrap();

    let mut ro = mount(dir.path(), false, "/mnt/empty");
    let fh = ro.open(OsStr::new("/empty"), libc::O_RDONLY as u32).unwrap();
    assert_eq!(fh, NULL_FH);
    assert_eq!(ro.read(fh, 0, 100).unwrap(), b"");
    ro.release(fh).unwrap();
    assert_eq!(ro.stat_path(OsStr::new("/empty")).unwrap().size, 0);
}

#[test]
fn link_write_diverges_and_commits() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = image_with_hello(dir.path(), true, "/mnt/link");

    ctx.link(OsStr::new("/a"), OsStr::new("/b")).unwrap();
    let fh = ctx.open(OsStr::new("/a"), libc::O_WRONLY as u32).unwrap();
    ctx.write(fh, 0, b"H").unwrap();
    ctx.release(fh).unwrap();

    assert_eq!(read_path(&mut ctx, "/a"), b"Hello");
    assert_eq!(read_path(&mut ctx, "/b"), b"hello");
    assert_eq!(ctx.catalog.len(), 2);
    ctx.verify_invariants().unwrap();

    ctx.shutdown(true, true).unwrap();
    let mut reread = mount(dir.path(), false, "/mnt/link");
    assert_eq!(read_path(&mut reread, "/a"), b"Hello");
    assert_eq!(read_path(&mut reread, "/b"), b"hello");
}

#[test]
fn truncate_commits_empty_stream() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = image_with_hello(dir.path(), true, "/mnt/trunc");
    ctx.link(OsStr::new("/a"), OsStr::new("/b")).unwrap();

    ctx.truncate(OsStr::new("/a"), 0).unwrap();
    assert_eq!(read_path(&mut ctx, "/a"), b"");
    assert_eq!(ctx.stat_path(OsStr::new("/a")).unwrap().size, 0);
    ctx.verify_invariants().unwrap();

    ctx.shutdown(true, true).unwrap();
    let mut reread = mount(dir.path(), false, "/mnt/trunc");
    assert_eq!(read_path(&mut reread, "/a"), b"");
    assert_eq!(read_path(&mut reread, "/b"), b"hello");
}

#[test]
fn truncate_to_current_size_stays_archive_backed() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = image_with_hello(dir.path(), true, "/mnt/trunc-noop");

    ctx.truncate(OsStr::new("/a"), 5).unwrap();
    let (did, _) = ctx.tree.resolve(OsStr::new("/a"), false).unwrap();
    let hash = ctx.tree.get(did).unwrap().hash;
    let entry = ctx.catalog.get(ctx.catalog.lookup(hash).unwrap()).unwrap();
    assert!(
        entry.backing.resource().is_some(),
        "no-op truncate must not create a staging file"
    );
}

#[test]
fn rename_replaces_existing_target() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = image_with_hello(dir.path(), true, "/mnt/rename");

    write_file(&mut ctx, "/c", b"xyz");
    ctx.rename(OsStr::new("/c"), OsStr::new("/a")).unwrap();
    assert_eq!(read_path(&mut ctx, "/a"), b"xyz");
    assert!(ctx.stat_path(OsStr::new("/c")).is_err());
    ctx.verify_invariants().unwrap();

    ctx.shutdown(true, true).unwrap();
    let mut reread = mount(dir.path(), false, "/mnt/rename");
    assert_eq!(read_path(&mut reread, "/a"), b"xyz");
}

#[test]
fn unlinked_stream_survives_until_last_close() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = image_with_hello(dir.path(), true, "/mnt/unlink");

    let fh = ctx.open(OsStr::new("/a"), libc::O_RDONLY as u32).unwrap();
    ctx.unlink(OsStr::new("/a")).unwrap();

    assert!(ctx.stat_path(OsStr::new("/a")).is_err());
    assert_eq!(ctx.read(fh, 0, 16).unwrap(), b"hello");
    assert_eq!(ctx.catalog.len(), 1);

    ctx.release(fh).unwrap();
    assert_eq!(ctx.catalog.len(), 0);
}

#[test]
fn clean_commit_is_content_equivalent() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = image_with_hello(dir.path(), true, "/mnt/clean");
    let before = {
        let (did, _) = ctx.tree.resolve(OsStr::new("/a"), false).unwrap();
        ctx.tree.get(did).unwrap().hash
    };

    // no modifications at all; commit must preserve identity
    ctx.shutdown(true, true).unwrap();

    let reread = mount(dir.path(), false, "/mnt/clean");
    let after = {
        let (did, _) = reread.tree.resolve(OsStr::new("/a"), false).unwrap();
        reread.tree.get(did).unwrap().hash
    };
    assert_eq!(before, after);
    assert_eq!(after, sha1_bytes(b"hello"));
}

#[test]
fn commit_deduplicates_identical_staged_content() {
    let dir = tempfile::tempdir().unwrap();
    fresh_image(dir.path());
    let mut ctx = mount(dir.path(), true, "/mnt/dedup");

    write_file(&mut ctx, "/one", b"same bytes");
    write_file(&mut ctx, "/two", b"same bytes");
    assert_eq!(ctx.catalog.len(), 2);
    ctx.shutdown(true, true).unwrap();

    let reread = mount(dir.path(), false, "/mnt/dedup");
    assert_eq!(reread.catalog.len(), 1);
    let (did, _) = reread.tree.resolve(OsStr::new("/one"), false).unwrap();
    let hash = reread.tree.get(did).unwrap().hash;
    let entry = reread.catalog.get(reread.catalog.lookup(hash).unwrap()).unwrap();
    assert_eq!(entry.refcount, 2);
    reread.verify_invariants().unwrap();
}

#[test]
fn archive_hard_link_group_diverges_together() {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_path(dir.path());
    let mut archive = WimArchive::create(&path, "img").unwrap();

    // hand-build an image whose two names form one hard-link group
    let mut tree = DentryTree::new();
    let a = tree.new_node(OsStr::new("a"), FILE_ATTRIBUTE_NORMAL).unwrap();
    let b = tree.new_node(OsStr::new("b"), FILE_ATTRIBUTE_NORMAL).unwrap();
    tree.link_child(ROOT_DENTRY, a).unwrap();
    tree.link_child(ROOT_DENTRY, b).unwrap();
    let group = tree.get(a).unwrap().link_group;
    let hash = sha1_bytes(b"common");
    {
        let d = tree.get_mut(b).unwrap();
        d.link_group = group;
        d.hash = hash;
    }
    tree.get_mut(a).unwrap().hash = hash;

    let blob = dir.path().join("blob");
    std::fs::write(&blob, b"common").unwrap();
    let info = archive.image_info(1).unwrap().clone();
    archive
        .overwrite(
            1,
            &info,
            &tree,
            &[CommitStream {
                hash,
                original_size: 6,
                source: StreamSource::StagedFile(blob),
            }],
            true,
        )
        .unwrap();

    let mut ctx = mount(dir.path(), true, "/mnt/group");
    assert_eq!(ctx.stat_path(OsStr::new("/a")).unwrap().nlink, 2);

    // the whole group owns the entry, so divergence re-uses it and the
    // write is visible through both names
    let fh = ctx.open(OsStr::new("/a"), libc::O_WRONLY as u32).unwrap();
    ctx.write(fh, 0, b"COMMON").unwrap();
    ctx.release(fh).unwrap();

    assert_eq!(ctx.catalog.len(), 1);
    assert_eq!(read_path(&mut ctx, "/b"), b"COMMON");
    ctx.verify_invariants().unwrap();
}

#[test]
fn ads_streams_roundtrip_and_expose_as_xattrs() {
    let dir = tempfile::tempdir().unwrap();
    fresh_image(dir.path());
    let mut ctx = mount(dir.path(), true, "/mnt/ads");

    write_file(&mut ctx, "/f", b"primary");
    ctx.mknod(OsStr::new("/f:meta")).unwrap();
    let fh = ctx.open(OsStr::new("/f:meta"), libc::O_WRONLY as u32).unwrap();
    ctx.write(fh, 0, b"side data").unwrap();
    ctx.release(fh).unwrap();
    ctx.shutdown(true, true).unwrap();

    // windows addressing after remount
    let mut win = mount(dir.path(), true, "/mnt/ads");
    assert_eq!(read_path(&mut win, "/f:meta"), b"side data");
    assert_eq!(read_path(&mut win, "/f"), b"primary");
    win.verify_invariants().unwrap();
    win.shutdown(false, false).unwrap();

    // xattr addressing over the same image
    let archive = WimArchive::open(&archive_path(dir.path())).unwrap();
    let mut cfg = config(false, "/mnt/ads");
    cfg.stream_interface = StreamInterface::Xattr;
    let mut xat = MountContext::new(archive, cfg).unwrap();
    let names = xat.list_streams(OsStr::new("/f")).unwrap();
    assert_eq!(names, vec![std::ffi::OsString::from("user.meta")]);
    assert_eq!(
        xat.read_stream_xattr(OsStr::new("/f"), OsStr::new("user.meta"))
            .unwrap(),
        b"side data"
    );
}

#[test]
fn symlink_survives_commit() {
    let dir = tempfile::tempdir().unwrap();
    fresh_image(dir.path());
    let mut ctx = mount(dir.path(), true, "/mnt/symlink");

    ctx.symlink(OsStr::new("/etc/hosts"), OsStr::new("/link"))
        .unwrap();
    assert_eq!(
        ctx.readlink(OsStr::new("/link")).unwrap(),
        std::ffi::OsString::from("/etc/hosts")
    );
    ctx.shutdown(true, true).unwrap();

    let mut reread = mount(dir.path(), false, "/mnt/symlink");
    assert!(reread.stat_path(OsStr::new("/link")).unwrap().is_symlink);
    assert_eq!(
        reread.readlink(OsStr::new("/link")).unwrap(),
        std::ffi::OsString::from("/etc/hosts")
    );
}

#[test]
fn unmount_handshake_commits_over_message_queues() {
    let dir = tempfile::tempdir().unwrap();
    fresh_image(dir.path());
    let mountpoint = "/tmp/wimfs-it-handshake";
    let mut ctx = mount(dir.path(), true, mountpoint);
    write_file(&mut ctx, "/queued", b"via mq");

    let driver = std::thread::spawn({
        let mountpoint = PathBuf::from(mountpoint);
        move || {
            let queues =
                unmount::MessageQueues::open(&mountpoint, unmount::Side::Driver).unwrap();
            queues.send_command(true, true).unwrap();
            let status = queues.recv_status().unwrap();
            queues.close();
            status
        }
    });

    unmount::daemon_finish(&mut ctx);
    assert_eq!(driver.join().unwrap(), 0);

    let mut reread = mount(dir.path(), false, mountpoint);
    assert_eq!(read_path(&mut reread, "/queued"), b"via mq");
}

#[test]
fn unmount_timeout_discards_changes() {
    let dir = tempfile::tempdir().unwrap();
    fresh_image(dir.path());
    let mountpoint = "/tmp/wimfs-it-timeout";
    let mut ctx = mount(dir.path(), true, mountpoint);
    write_file(&mut ctx, "/doomed", b"never committed");
    let staging_path = ctx.staging.as_ref().unwrap().path().to_path_buf();

    // nobody drives the unmount: after 3 seconds the daemon gives up,
    // discards the changes, and still cleans the staging directory
    unmount::daemon_finish(&mut ctx);

    assert!(!staging_path.exists());
    let reread = mount(dir.path(), false, mountpoint);
    assert!(reread.stat_path(OsStr::new("/doomed")).is_err());
}
