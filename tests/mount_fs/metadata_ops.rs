use std::time::{Duration, SystemTime};

use objectfs_core::{AccessMask, Caller, DriveError};

use crate::common::Fixture;

#[tokio::test]
async fn chmod_by_owner_updates_mode() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    fx.drive.mknod("/a", 0o644, caller).await.expect("mknod ok");
    fx.drive.chmod("/a", 0o600, caller).await.expect("chmod ok");

    let stat = fx.drive.getattr("/a").await.expect("getattr ok");
    assert_eq!(stat.mode & 0o7777, 0o600);
}

#[tokio::test]
async fn chmod_by_non_owner_is_denied() {
    let fx = Fixture::new().await;
    let owner = fx.caller();
    let other = Caller { uid: 9999, gid: 9999 };

    fx.drive.mknod("/a", 0o644, owner).await.expect("mknod ok");
    let err = fx.drive.chmod("/a", 0o600, other).await.unwrap_err();
    assert!(matches!(err, DriveError::PermissionDenied));
}

#[tokio::test]
async fn chown_and_utimens_by_owner() {
    let fx = Fixture::new().await;
    let owner = fx.caller();

    fx.drive.mknod("/a", 0o644, owner).await.expect("mknod ok");
    fx.drive.chown("/a", Some(42), Some(42), owner).await.expect("chown ok");

    let now = SystemTime::now();
    let later = now + Duration::from_secs(60);
    fx.drive.utimens("/a", now, later, owner).await.expect("utimens ok");

    let stat = fx.drive.getattr("/a").await.expect("getattr ok");
    assert_eq!(stat.uid, 42);
    assert_eq!(stat.mtime, later);
}

#[tokio::test]
async fn access_checks_requested_mask() {
    let fx = Fixture::new().await;
    let owner = fx.caller();

    fx.drive.mknod("/a", 0o600, owner).await.expect("mknod ok");
    fx.drive.access("/a", owner, AccessMask::READ).await.expect("owner can read");
    fx.drive.access("/a", owner, AccessMask::WRITE).await.expect("owner can write");

    let other = Caller { uid: 9999, gid: 9999 };
    let err = fx.drive.access("/a", other, AccessMask::READ).await.unwrap_err();
    assert!(matches!(err, DriveError::PermissionDenied));
}
