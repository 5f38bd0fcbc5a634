//! `FileMetaData`: an inode-like record, one per known object (§3).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::MountConfig;

/// Object type, matching the POSIX file-type set FUSE exposes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    SymLink,
    Block,
    Character,
    Fifo,
    Socket,
}

impl FileType {
    fn mode_bits(self) -> u32 {
        (match self {
            FileType::File => libc::S_IFREG,
            FileType::Directory => libc::S_IFDIR,
            FileType::SymLink => libc::S_IFLNK,
            FileType::Block => libc::S_IFBLK,
            FileType::Character => libc::S_IFCHR,
            FileType::Fifo => libc::S_IFIFO,
            FileType::Socket => libc::S_IFSOCK,
        }) as u32
    }
}

/// A POSIX `struct stat`-shaped view of a [`FileMetaData`], produced by
/// [`FileMetaData::to_stat`]. Block size and block count are derived from
/// the constants named in §4.4: 4096-byte blocks, `size/512 + 1` 512-byte
/// blocks used.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub size: u64,
    pub blocks: u64,
    pub block_size: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// One per known object. Directories carry a trailing `/` in their path
/// (§3 invariant).
#[derive(Debug, Clone)]
pub struct FileMetaData {
    pub path: String,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub file_type: FileType,
    pub mime_type: String,
    pub etag: String,
    pub encrypted: bool,
    pub device: Option<u64>,
    pub link_count: u32,
    /// `needs-upload`: set by a buffered write, cleared on a successful
    /// flush/release/fsync upload.
    pub dirty: bool,
    /// Set while the file is open under at least one file handle; open
    /// files are unevictable from both the Cache and the MetaDataManager.
    pub open: bool,
}

impl FileMetaData {
    /// Construct metadata for the root directory, whose link count is
    /// reported as 1 (not 2) to satisfy FUSE, per §3.
    pub fn root(uid: u32, gid: u32, mode: u32) -> Self {
        let now = SystemTime::now();
        FileMetaData {
            path: "/".to_string(),
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            uid,
            gid,
            mode,
            file_type: FileType::Directory,
            mime_type: crate::mime::directory_mime_type().to_string(),
            etag: String::new(),
            encrypted: false,
            device: None,
            link_count: 1,
            dirty: false,
            open: false,
        }
    }

    pub fn new_directory(path: impl Into<String>, uid: u32, gid: u32, mode: u32) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        let now = SystemTime::now();
        FileMetaData {
            path,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            uid,
            gid,
            mode,
            file_type: FileType::Directory,
            mime_type: crate::mime::directory_mime_type().to_string(),
            etag: String::new(),
            encrypted: false,
            device: None,
            link_count: 2,
            dirty: false,
            open: false,
        }
    }

    pub fn new_file(path: impl Into<String>, uid: u32, gid: u32, mode: u32) -> Self {
        let path = path.into();
        let mime_type = crate::mime::lookup_mime_type(&path).to_string();
        let now = SystemTime::now();
        FileMetaData {
            path,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            uid,
            gid,
            mode,
            file_type: FileType::File,
            mime_type,
            etag: String::new(),
            encrypted: false,
            device: None,
            link_count: 1,
            dirty: false,
            open: false,
        }
    }

    pub fn new_symlink(path: impl Into<String>, uid: u32, gid: u32) -> Self {
        let path = path.into();
        let now = SystemTime::now();
        FileMetaData {
            path,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            uid,
            gid,
            mode: 0o777,
            file_type: FileType::SymLink,
            mime_type: crate::mime::symlink_mime_type().to_string(),
            etag: String::new(),
            encrypted: false,
            device: None,
            link_count: 1,
            dirty: false,
            open: false,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Verify the directory-suffix / size-zero / link-count invariants in
    /// §3. Returns `Err` with a human description on the first violated
    /// invariant; intended for tests and debug assertions, not the hot
    /// path.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.path.is_empty() {
            return Err("path must be non-empty".into());
        }
        if self.is_directory() {
            if !self.path.ends_with('/') {
                return Err("directory path must end with '/'".into());
            }
            if self.size != 0 {
                return Err("directory size must be zero".into());
            }
            if self.path != "/" && self.link_count != 2 {
                return Err("non-root directory link count must be 2".into());
            }
        } else if self.link_count != 1 {
            return Err("non-directory link count must be 1".into());
        }
        Ok(())
    }

    /// Produce a kernel-stat-shaped view (§4.4).
    pub fn to_stat(&self) -> Stat {
        const BLOCK_SIZE: u32 = 4096;
        Stat {
            size: self.size,
            blocks: self.size / 512 + 1,
            block_size: BLOCK_SIZE,
            mode: self.file_type.mode_bits() | (self.mode & 0o7777),
            nlink: self.link_count,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

/// Mask of access rights requested by an `access`/permission check,
/// matching the POSIX R_OK/W_OK/X_OK bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AccessMask(pub u32);

impl AccessMask {
    pub const READ: AccessMask = AccessMask(0b100);
    pub const WRITE: AccessMask = AccessMask(0b010);
    pub const EXEC: AccessMask = AccessMask(0b001);

    pub fn contains(self, bit: AccessMask) -> bool {
        self.0 & bit.0 == bit.0
    }
}

/// Evaluate `mask` against `meta` for the caller identified by `(uid, gid)`,
/// honoring the override-uid/override-gid and umask configuration knobs
/// from §4.4.
pub fn check_access(meta: &FileMetaData, uid: u32, gid: u32, mask: AccessMask, config: &MountConfig) -> bool {
    if uid == 0 {
        return true;
    }

    let effective_uid = config.override_uid.unwrap_or(meta.uid);
    let effective_gid = config.override_gid.unwrap_or(meta.gid);
    let mode = config.umask.unwrap_or(meta.mode);

    let bits = if uid == effective_uid {
        (mode >> 6) & 0o7
    } else if gid == effective_gid {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };

    bits & mask.0 == mask.0
}

/// §4.8 gate 3: when the parent directory has the sticky bit set, only
/// root, the file's owner, or the directory's owner may delete or rename
/// the entry.
pub fn sticky_bit_allows(parent: &FileMetaData, entry: &FileMetaData, uid: u32) -> bool {
    const STICKY: u32 = 0o1000;
    if parent.mode & STICKY == 0 {
        return true;
    }
    uid == 0 || uid == entry.uid || uid == parent.uid
}

pub fn unix_epoch() -> SystemTime {
    UNIX_EPOCH
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MountConfig {
        MountConfig::default()
    }

    #[test]
    fn root_passes_every_check() {
        let meta = FileMetaData::new_file("/a", 1000, 1000, 0o600);
        assert!(check_access(&meta, 0, 0, AccessMask::READ, &config()));
        assert!(check_access(&meta, 0, 0, AccessMask::WRITE, &config()));
    }

    #[test]
    fn owner_matrix_applies() {
        let meta = FileMetaData::new_file("/a", 1000, 1000, 0o640);
        assert!(check_access(&meta, 1000, 1000, AccessMask::READ, &config()));
        assert!(check_access(&meta, 1000, 1000, AccessMask::WRITE, &config()));
        assert!(!check_access(&meta, 1000, 1000, AccessMask::EXEC, &config()));
    }

    #[test]
    fn group_matrix_applies() {
        let meta = FileMetaData::new_file("/a", 1000, 2000, 0o640);
        assert!(check_access(&meta, 5000, 2000, AccessMask::READ, &config()));
        assert!(!check_access(&meta, 5000, 2000, AccessMask::WRITE, &config()));
    }

    #[test]
    fn other_matrix_applies() {
        let meta = FileMetaData::new_file("/a", 1000, 2000, 0o604);
        assert!(check_access(&meta, 5000, 5000, AccessMask::READ, &config()));
        assert!(!check_access(&meta, 5000, 5000, AccessMask::WRITE, &config()));
    }

    #[test]
    fn sticky_bit_protects_non_owner() {
        let parent = FileMetaData::new_directory("/t/", 0, 0, 0o1777);
        let file = FileMetaData::new_file("/t/x", 1001, 1001, 0o644);
        assert!(!sticky_bit_allows(&parent, &file, 1002));
        assert!(sticky_bit_allows(&parent, &file, 1001));
        assert!(sticky_bit_allows(&parent, &file, 0));
    }

    #[test]
    fn root_invariants_hold() {
        let root = FileMetaData::root(0, 0, 0o755);
        root.check_invariants().expect("root invariants hold");
        assert_eq!(root.link_count, 1);
    }

    #[test]
    fn to_stat_derives_blocks_from_size() {
        let mut meta = FileMetaData::new_file("/a", 0, 0, 0o644);
        meta.size = 5000;
        let stat = meta.to_stat();
        assert_eq!(stat.block_size, 4096);
        assert_eq!(stat.blocks, 5000 / 512 + 1);
    }
}
