// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end single-threaded scenarios against the public surface.

use memfs_core::{
    Credentials, EntryType, FsConfig, FsCore, FsError, OpenOptions, SetxattrFlags,
};

fn new_fs() -> FsCore {
    FsCore::new(FsConfig::default()).expect("core init")
}

#[test]
fn build_and_tear_down_a_tree() {
    let fs = new_fs();
    let cred = Credentials::root();

    fs.mkdir("/a", &cred, 0o755).expect("mkdir /a");
    fs.mkdir("/a/b", &cred, 0o755).expect("mkdir /a/b");
    let fh = fs.create("/a/b/c", &cred, 0o644).expect("create /a/b/c");
    fs.close(fh).expect("close");

    let dh = fs.opendir("/a/b", &cred, None).expect("opendir");
    let names: Vec<_> = fs
        .listdir(&dh)
        .expect("listdir")
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![".", "..", "c"]);
    fs.closedir(dh).expect("closedir");

    fs.unlink("/a/b/c", &cred).expect("unlink");
    fs.rmdir("/a/b", &cred).expect("rmdir /a/b");
    fs.rmdir("/a", &cred).expect("rmdir /a");

    let dh = fs.opendir("/", &cred, None).expect("opendir root");
    assert_eq!(fs.listdir(&dh).expect("listdir").len(), 2);
    fs.closedir(dh).expect("closedir");
}

#[test]
fn mkdir_rmdir_leaves_tree_unchanged() {
    let fs = new_fs();
    let cred = Credentials::root();

    let dh = fs.opendir("/", &cred, None).expect("opendir");
    let before = fs.listdir(&dh).expect("listdir before");
    fs.closedir(dh).expect("closedir");

    fs.mkdir("/tmp", &cred, 0o755).expect("mkdir");
    fs.rmdir("/tmp", &cred).expect("rmdir");

    let dh = fs.opendir("/", &cred, None).expect("opendir");
    let after = fs.listdir(&dh).expect("listdir after");
    fs.closedir(dh).expect("closedir");
    assert_eq!(before, after);
}

#[test]
fn xattr_law_round_trip() {
    let fs = new_fs();
    let cred = Credentials::root();
    let fh = fs.create("/f", &cred, 0o644).expect("create");
    fs.close(fh).expect("close");

    fs.setxattr("/f", &cred, "user.key", b"value", SetxattrFlags::Upsert)
        .expect("setxattr");
    assert_eq!(
        fs.getxattr("/f", &cred, "user.key").expect("getxattr"),
        b"value"
    );
    fs.removexattr("/f", &cred, "user.key").expect("removexattr");
    assert!(matches!(
        fs.getxattr("/f", &cred, "user.key"),
        Err(FsError::NotFound)
    ));
}

#[test]
fn write_then_reopen_and_read() {
    let fs = new_fs();
    let cred = Credentials::root();

    let data = b"the quick brown fox";
    let fh = fs.create("/f", &cred, 0o644).expect("create");
    assert_eq!(fs.write(&fh, data, 0).expect("write"), data.len());
    fs.close(fh).expect("close");

    let fh = fs
        .open("/f", &cred, &OpenOptions::read_only())
        .expect("reopen");
    let mut buf = vec![0u8; data.len()];
    assert_eq!(fs.read(&fh, &mut buf, 0).expect("read"), data.len());
    assert_eq!(&buf[..], data);
    fs.close(fh).expect("close");
}

#[test]
fn unlinked_file_lives_until_last_close() {
    let fs = new_fs();
    let cred = Credentials::root();

    let fh = fs.create("/f", &cred, 0o644).expect("create");
    fs.write(&fh, b"still here", 0).expect("write");
    fs.unlink("/f", &cred).expect("unlink");

    assert!(matches!(fs.stat("/f", &cred), Err(FsError::NotFound)));
    let dh = fs.opendir("/", &cred, None).expect("opendir");
    assert!(fs
        .listdir(&dh)
        .expect("listdir")
        .iter()
        .all(|e| e.name != "f"));
    fs.closedir(dh).expect("closedir");

    let mut buf = [0u8; 10];
    assert_eq!(fs.read(&fh, &mut buf, 0).expect("read after unlink"), 10);
    assert_eq!(&buf, b"still here");
    fs.close(fh).expect("close");
}

#[test]
fn symlinked_directory_is_transparent() {
    let fs = new_fs();
    let cred = Credentials::root();

    fs.symlink("/a", "/link", &cred).expect("symlink");
    fs.mkdir("/a", &cred, 0o755).expect("mkdir");
    let fh = fs.create("/link/b", &cred, 0o644).expect("create via symlink");
    fs.close(fh).expect("close");

    assert_eq!(
        fs.stat("/a/b", &cred).expect("stat real path").kind,
        EntryType::Regular
    );
}

#[test]
fn relative_symlink_splices_into_walk() {
    let fs = new_fs();
    let cred = Credentials::root();

    fs.mkdir("/base", &cred, 0o755).expect("mkdir base");
    fs.mkdir("/base/real", &cred, 0o755).expect("mkdir real");
    fs.symlink("real", "/base/alias", &cred).expect("symlink");
    let fh = fs.create("/base/alias/f", &cred, 0o644).expect("create");
    fs.close(fh).expect("close");

    assert_eq!(
        fs.stat("/base/real/f", &cred).expect("stat").kind,
        EntryType::Regular
    );
}

#[test]
fn dot_and_dotdot_walk_segments() {
    let fs = new_fs();
    let cred = Credentials::root();

    fs.mkdir("/a", &cred, 0o755).expect("mkdir");
    let fh = fs.create("/a/f", &cred, 0o644).expect("create");
    fs.close(fh).expect("close");

    assert!(fs.stat("/a/./f", &cred).is_ok());
    assert!(fs.stat("/a/../a/f", &cred).is_ok());
    // the root's `..` points back at the root
    assert_eq!(
        fs.stat("/..", &cred).expect("root dotdot").file_id,
        fs.stat("/", &cred).expect("root").file_id
    );
}

#[test]
fn rmdir_on_directory_with_file_fails_and_preserves_it() {
    let fs = new_fs();
    let cred = Credentials::root();

    fs.mkdir("/d", &cred, 0o755).expect("mkdir");
    let fh = fs.create("/d/keep", &cred, 0o644).expect("create");
    fs.close(fh).expect("close");

    assert!(matches!(fs.rmdir("/d", &cred), Err(FsError::NotEmpty)));
    assert!(fs.stat("/d/keep", &cred).is_ok());
}

#[test]
fn errno_codes_for_common_failures() {
    let fs = new_fs();
    let cred = Credentials::root();

    assert_eq!(fs.stat("/missing", &cred).unwrap_err().errno(), -2);
    fs.mkdir("/d", &cred, 0o755).expect("mkdir");
    assert_eq!(fs.mkdir("/d", &cred, 0o755).unwrap_err().errno(), -17);
    let fh = fs.create("/f", &cred, 0o644).expect("create");
    fs.close(fh).expect("close");
    assert_eq!(fs.stat("/f/x", &cred).unwrap_err().errno(), -20);
}
