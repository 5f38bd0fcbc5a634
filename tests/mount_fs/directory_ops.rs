use crate::common::Fixture;

#[tokio::test]
async fn mkdir_then_lookup_and_listing() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    fx.drive.mkdir("/photos", 0o755, caller).await.expect("mkdir ok");
    fx.drive.mknod("/photos/a.jpg", 0o644, caller).await.expect("mknod ok");
    fx.drive.mknod("/photos/b.jpg", 0o644, caller).await.expect("mknod ok");

    let mut children = fx.drive.readdir("/photos").await.expect("readdir ok");
    children.sort();
    assert_eq!(children, vec!["/photos/a.jpg".to_string(), "/photos/b.jpg".to_string()]);

    let stat = fx.drive.getattr("/photos").await.expect("getattr ok");
    assert_eq!(stat.mode & 0o7777, 0o755);
}

#[tokio::test]
async fn rmdir_fails_when_not_empty_then_succeeds_once_emptied() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    fx.drive.mkdir("/d", 0o755, caller).await.expect("mkdir ok");
    fx.drive.mknod("/d/a", 0o644, caller).await.expect("mknod ok");

    let err = fx.drive.rmdir("/d", caller).await.unwrap_err();
    assert!(matches!(err, objectfs_core::DriveError::NotEmpty));

    fx.drive.unlink("/d/a", caller).await.expect("unlink ok");
    fx.drive.rmdir("/d", caller).await.expect("rmdir ok");
    assert!(fx.drive.getattr("/d").await.is_err());
}

#[tokio::test]
async fn mkdir_on_missing_parent_fails() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    let err = fx.drive.mkdir("/missing/child", 0o755, caller).await.unwrap_err();
    assert!(matches!(err, objectfs_core::DriveError::ParentMissing));
}
