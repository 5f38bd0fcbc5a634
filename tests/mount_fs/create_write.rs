use crate::common::Fixture;

#[tokio::test]
async fn create_write_flush_read_back() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    fx.drive.mknod("/greeting.txt", 0o644, caller).await.expect("mknod ok");
    fx.drive.open("/greeting.txt", caller).await.expect("open ok");
    fx.drive.write("/greeting.txt", 0, b"hello, world", caller).await.expect("write ok");
    fx.drive.flush("/greeting.txt").await.expect("flush ok");

    let mut buf = vec![0u8; 12];
    let read = fx.drive.read("/greeting.txt", 0, &mut buf, caller).await.expect("read ok");
    assert_eq!(read, 12);
    assert_eq!(&buf, b"hello, world");

    let stat = fx.drive.getattr("/greeting.txt").await.expect("getattr ok");
    assert_eq!(stat.size, 12);
}

#[tokio::test]
async fn sparse_write_past_current_size_extends_file() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    fx.drive.mknod("/sparse.bin", 0o644, caller).await.expect("mknod ok");
    fx.drive.open("/sparse.bin", caller).await.expect("open ok");
    fx.drive.write("/sparse.bin", 10, b"tail", caller).await.expect("write ok");

    let stat = fx.drive.getattr("/sparse.bin").await.expect("getattr ok");
    assert_eq!(stat.size, 14);
}

#[tokio::test]
async fn mknod_on_existing_path_fails_with_already_exists() {
    let fx = Fixture::new().await;
    let caller = fx.caller();

    fx.drive.mknod("/dup.txt", 0o644, caller).await.expect("mknod ok");
    let second = fx.drive.mknod("/dup.txt", 0o644, caller).await;
    assert!(matches!(second, Err(objectfs_core::DriveError::AlreadyExists)));
}
