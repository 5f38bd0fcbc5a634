use crate::common::Fixture;
use objectfs_core::Caller;

#[tokio::test]
async fn unlink_removes_entry_and_cached_data() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    fx.drive.mknod("/a", 0o644, caller).await.expect("mknod ok");
    fx.drive.open("/a", caller).await.expect("open ok");
    fx.drive.write("/a", 0, b"data", caller).await.expect("write ok");
    fx.drive.flush("/a").await.expect("flush ok");

    fx.drive.unlink("/a", caller).await.expect("unlink ok");
    assert!(fx.drive.getattr("/a").await.is_err());
}

#[tokio::test]
async fn unlink_on_sticky_directory_blocks_non_owner() {
    let fx = Fixture::new().await;
    let owner = Caller { uid: 1000, gid: 1000 };
    let other = Caller { uid: 2000, gid: 2000 };

    fx.drive.mkdir("/tmp", 0o1777, owner).await.expect("mkdir ok");
    fx.drive.mknod("/tmp/a", 0o644, owner).await.expect("mknod ok");

    let err = fx.drive.unlink("/tmp/a", other).await.unwrap_err();
    assert!(matches!(err, objectfs_core::DriveError::StickyBit));

    fx.drive.unlink("/tmp/a", owner).await.expect("owner can still unlink");
}
