//! objectfs-core - the orchestration core of a FUSE filesystem that
//! projects an object-storage bucket as a POSIX-like tree.
//!
//! The FUSE kernel binding and the raw object-store wire client are
//! deliberately out of core scope: this crate exposes [`Drive`], an
//! async orchestrator generic over anything implementing [`ObjectClient`],
//! for a thin outer binary to drive from FUSE upcalls.

mod cache;
mod client;
mod config;
mod credentials;
mod drive;
mod error;
mod meta_manager;
mod metadata;
mod mime;
mod node;
mod page;
mod tree;
mod transfer;

pub use client::{
    CompletedPart, HeadOutcome, InMemoryObjectClient, ObjectClient, ObjectSummary, StatVfs,
};
pub use config::{ConfigError, MountConfig, MountOptions};
pub use credentials::{Credentials, CredentialsProvider};
pub use drive::{Caller, Drive};
pub use error::{ClientError, ClientErrorKind, DataError, DriveError, Errno};
pub use metadata::{AccessMask, FileMetaData, FileType, Stat};

use std::sync::Arc;

/// Builds a [`Drive`] from CLI/config options and an already-constructed
/// client, the explicit construction step that replaces the original's
/// singleton `Connect()` bootstrap (§9 redesign flag).
///
/// The raw object-store wire client is out of core scope (§1); this
/// function is the seam where core tunables (`MountConfig`) and a caller-
/// supplied client come together into a usable, connected `Drive`.
pub async fn mount<C: ObjectClient + 'static>(
    client: Arc<C>,
    options: &MountOptions,
    root_uid: u32,
    root_gid: u32,
) -> Result<Drive<C>, DriveError> {
    let config = MountConfig::load(options.config_file.as_deref())
        .map_err(|err| DriveError::Fatal(ClientError::fatal(err.0)))?;
    let drive = Drive::new(client, config);
    drive.connect(root_uid, root_gid).await?;
    Ok(drive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mount_connects_and_seeds_root() {
        let client = Arc::new(InMemoryObjectClient::new());
        let options = MountOptions {
            bucket: "test-bucket".to_string(),
            mountpoint: std::path::PathBuf::from("/mnt/objectfs"),
            credentials_file: std::path::PathBuf::from("/dev/null"),
            config_file: None,
        };
        let drive = mount(client, &options, 1000, 1000).await.expect("mount ok");
        let stat = drive.getattr("/").await.expect("getattr ok");
        assert_eq!(stat.uid, 1000);
    }
}
