//! Virtual filesystem: shadowing, recursion policy, and containment

use ftpd_rs::tvfs::{
    MountAccess, MountPoint, MountTable, PathFormat, Recursion, Resolution, Tvfs,
};

fn mount(v: &str, n: &str, access: MountAccess, recursion: Recursion) -> MountPoint {
    MountPoint {
        virtual_path: v.to_owned(),
        native_path: n.to_owned(),
        access,
        recursion,
        autocreate: false,
    }
}

/// Mounts `/` and `/pub`: listing `/` shows `pub` with the mount's access
/// bits even when a native `pub` exists, and the native one is invisible.
#[tokio::test]
async fn test_mount_shadows_native_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("srv-ftp");
    let public = dir.path().join("srv-public");
    tokio::fs::create_dir_all(root.join("pub")).await.expect("mkdir");
    tokio::fs::write(root.join("pub/native-only.txt"), b"hidden")
        .await
        .expect("fixture");
    tokio::fs::create_dir_all(&public).await.expect("mkdir");
    tokio::fs::write(public.join("shared.txt"), b"visible")
        .await
        .expect("fixture");

    let table = MountTable::with_format(
        vec![
            mount(
                "/",
                root.to_str().expect("utf8"),
                MountAccess::ReadOnly,
                Recursion::ApplyPermissions,
            ),
            mount(
                "/pub",
                public.to_str().expect("utf8"),
                MountAccess::ReadWrite,
                Recursion::ApplyPermissions,
            ),
        ],
        PathFormat::Unix,
    )
    .expect("table");
    let tvfs = Tvfs::bind(&table, "alice", None);

    let entries = tvfs.list("/").await.expect("list root");
    let pub_entry = entries.iter().find(|e| e.name == "pub").expect("pub entry");
    assert!(pub_entry.synthetic, "mount entry, not the native directory");
    assert!(pub_entry.writable, "carries the mount's access bits");

    // Paths below /pub resolve into the mounted directory, never the
    // shadowed native one.
    let inside = tvfs.list("/pub").await.expect("list pub");
    let names: Vec<&str> = inside.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["shared.txt"]);
    assert!(matches!(tvfs.resolve("/pub/native-only.txt"), Resolution::Native(t)
        if t.path.starts_with(&public)));
}

/// A `recursive = none` mount serves its own path and nothing below it.
#[tokio::test]
async fn test_non_recursive_boundary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let drop_dir = dir.path().join("dropbox");
    tokio::fs::create_dir_all(drop_dir.join("nested")).await.expect("mkdir");

    let table = MountTable::with_format(
        vec![mount(
            "/drop",
            drop_dir.to_str().expect("utf8"),
            MountAccess::ReadWrite,
            Recursion::None,
        )],
        PathFormat::Unix,
    )
    .expect("table");
    let tvfs = Tvfs::bind(&table, "alice", None);

    assert!(matches!(tvfs.resolve("/drop"), Resolution::Native(_)));
    assert!(matches!(tvfs.resolve("/drop/nested"), Resolution::NotFound));
    assert!(tvfs.stat("/drop").await.is_ok());
    assert!(tvfs.stat("/drop/nested").await.is_err());
}

/// Escaping the mount via dot-dot never reaches the filesystem: the
/// resolution itself reports not-found.
#[tokio::test]
async fn test_dot_dot_cannot_escape() {
    let dir = tempfile::tempdir().expect("tempdir");
    let jail = dir.path().join("jail");
    tokio::fs::create_dir_all(&jail).await.expect("mkdir");
    tokio::fs::write(dir.path().join("outside.txt"), b"secret")
        .await
        .expect("fixture");

    let table = MountTable::with_format(
        vec![mount(
            "/jail",
            jail.to_str().expect("utf8"),
            MountAccess::ReadWrite,
            Recursion::ApplyPermissionsAndAllowStructureModification,
        )],
        PathFormat::Unix,
    )
    .expect("table");
    let tvfs = Tvfs::bind(&table, "alice", None);

    for attempt in [
        "/jail/../outside.txt",
        "/jail/../../outside.txt",
        "/jail/a/../../outside.txt",
        "/../outside.txt",
    ] {
        assert!(
            matches!(tvfs.resolve(attempt), Resolution::NotFound),
            "{attempt} must not resolve"
        );
        assert!(tvfs.open_read(attempt, 0).await.is_err(), "{attempt}");
    }
}

/// The user placeholder lands each user in their own native directory.
#[tokio::test]
async fn test_user_placeholder_separation() {
    let dir = tempfile::tempdir().expect("tempdir");
    for user in ["alice", "bob"] {
        tokio::fs::create_dir_all(dir.path().join(user)).await.expect("mkdir");
        tokio::fs::write(dir.path().join(user).join("own.txt"), user.as_bytes())
            .await
            .expect("fixture");
    }

    let template = format!("{}/:u", dir.path().to_str().expect("utf8"));
    let table = MountTable::with_format(
        vec![mount("/", &template, MountAccess::ReadWrite, Recursion::ApplyPermissions)],
        PathFormat::Unix,
    )
    .expect("table");

    let alice = Tvfs::bind(&table, "alice", None);
    let bob = Tvfs::bind(&table, "bob", None);

    let (mut file, _) = alice.open_read("/own.txt", 0).await.expect("alice open");
    let mut content = String::new();
    use tokio::io::AsyncReadExt;
    file.read_to_string(&mut content).await.expect("read");
    assert_eq!(content, "alice");

    let (mut file, _) = bob.open_read("/own.txt", 0).await.expect("bob open");
    let mut content = String::new();
    file.read_to_string(&mut content).await.expect("read");
    assert_eq!(content, "bob");
}
