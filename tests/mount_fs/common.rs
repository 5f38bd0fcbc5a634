use std::sync::Arc;

use objectfs_core::{Caller, Drive, InMemoryObjectClient, MountConfig};
use tempfile::TempDir;

pub struct Fixture {
    pub drive: Drive<InMemoryObjectClient>,
    // kept alive so the spill directory isn't removed out from under the cache
    _spill: TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        let spill = TempDir::new().expect("create spill dir");
        let client = Arc::new(InMemoryObjectClient::new());
        let mut config = MountConfig::default();
        config.spill_directory = spill.path().to_path_buf();
        let drive = Drive::new(client, config);
        drive.connect(1000, 1000).await.expect("connect ok");
        Self { drive, _spill: spill }
    }

    pub fn caller(&self) -> Caller {
        Caller { uid: 1000, gid: 1000 }
    }
}
