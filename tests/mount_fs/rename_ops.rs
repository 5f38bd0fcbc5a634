use crate::common::Fixture;

#[tokio::test]
async fn rename_file_moves_content() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    fx.drive.mknod("/old.txt", 0o644, caller).await.expect("mknod ok");
    fx.drive.open("/old.txt", caller).await.expect("open ok");
    fx.drive.write("/old.txt", 0, b"payload", caller).await.expect("write ok");
    fx.drive.flush("/old.txt").await.expect("flush ok");

    fx.drive.rename("/old.txt", "/new.txt", caller).await.expect("rename ok");

    assert!(fx.drive.getattr("/old.txt").await.is_err());
    let stat = fx.drive.getattr("/new.txt").await.expect("getattr ok");
    assert_eq!(stat.size, 7);
}

#[tokio::test]
async fn rename_directory_moves_every_descendant() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    fx.drive.mkdir("/src", 0o755, caller).await.expect("mkdir ok");
    fx.drive.mknod("/src/a", 0o644, caller).await.expect("mknod ok");
    fx.drive.mknod("/src/b", 0o644, caller).await.expect("mknod ok");

    fx.drive.rename("/src", "/dst", caller).await.expect("rename ok");

    assert!(fx.drive.getattr("/src").await.is_err());
    assert!(fx.drive.getattr("/dst").await.is_ok());
    let mut children = fx.drive.readdir("/dst").await.expect("readdir ok");
    children.sort();
    assert_eq!(children, vec!["/dst/a".to_string(), "/dst/b".to_string()]);
}

#[tokio::test]
async fn rename_onto_existing_destination_fails() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    fx.drive.mknod("/a", 0o644, caller).await.expect("mknod ok");
    fx.drive.mknod("/b", 0o644, caller).await.expect("mknod ok");

    let err = fx.drive.rename("/a", "/b", caller).await.unwrap_err();
    assert!(matches!(err, objectfs_core::DriveError::AlreadyExists));
}
