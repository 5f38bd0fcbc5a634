//! Error taxonomy shared across components.
//!
//! Components return typed result values rather than throwing; the VFS
//! boundary (the only place that knows about errno) is the single spot
//! where a [`DriveError`] is mapped down to a negative errno.

use std::fmt;

/// Errors raised at a component boundary (Page, File, Cache, Node,
/// DirectoryTree, MetaDataManager).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataError {
    /// Bad offset/length/buffer at a component boundary.
    InvalidArgument,
    /// Page or File body seek/write failed.
    WriteFailed,
    /// Construction raced with a clear; the backing body is gone.
    BodyNull,
    /// Cache or MetaDataManager budget exhausted with no evictable victim.
    Full,
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DataError::InvalidArgument => "invalid argument",
            DataError::WriteFailed => "write failed",
            DataError::BodyNull => "body is null",
            DataError::Full => "cache full",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for DataError {}

/// Kind of failure returned by an [`crate::client::ObjectClient`] call.
///
/// The minimum enumeration needed at the store boundary (§6): `Good` is not
/// a real error and never constructed by a failing call, it exists so a
/// client implementation can round-trip a "no error" variant through the
/// same enum the wire layer uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientErrorKind {
    Good,
    NotFound,
    NoSuchUpload,
    ParameterMissing,
    RequestSendError,
    UnexpectedResponse,
    SignInvalid,
    Unknown,
}

/// Structured error returned by the [`crate::client::ObjectClient`]
/// capability.
#[derive(Debug, Clone)]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub retryable: bool,
    pub exception_name: String,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, retryable: bool, message: impl Into<String>) -> Self {
        Self { kind, retryable, exception_name: format!("{:?}", kind), message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::NotFound, false, message)
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::RequestSendError, true, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Unknown, false, message)
    }

    /// Whether the operation layer should retry this call. The core never
    /// retries at the Drive level (§4.7) — it only consults this flag.
    pub fn should_retry(&self) -> bool {
        self.retryable
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_name, self.message)
    }
}

impl std::error::Error for ClientError {}

/// Top level error taxonomy surfaced at the VFS boundary (§7).
#[derive(Debug)]
pub enum DriveError {
    /// Object or prefix does not exist.
    NotFound,
    /// A transient server/network condition the caller may retry.
    Retryable(ClientError),
    /// Signing, parameter, or protocol-invariant failure.
    Fatal(ClientError),
    /// Budget exhausted with no evictable victim, even after the
    /// grow-by-20% escape valve (see DESIGN.md Open Question 3).
    CacheFull,
    /// Bad offset/length/buffer at a component boundary.
    InvalidArgument,
    /// Access-check failure.
    PermissionDenied,
    /// Parent-directory sticky-bit policy forbids the operation.
    StickyBit,
    /// Parent directory does not exist.
    ParentMissing,
    /// Parent exists but is not a directory.
    ParentNotDir,
    /// Directory removal requested on a non-empty directory.
    NotEmpty,
    /// Create-like operation (mknod/mkdir/symlink/create/link) targeted a
    /// path that already has an entry.
    AlreadyExists,
    /// Name or path exceeded the configured length limit.
    NameTooLong,
    /// A HEAD revealed the local tree disagreed with the server; consumed
    /// by `Drive` internally in most cases, but can still escape to the
    /// VFS boundary for operations that chose not to retry.
    StaleLocalState,
    /// Catch-all used for conditions that don't need their own mapped
    /// errno (e.g. readdir buffer allocation failure).
    OutOfMemory,
}

impl From<DataError> for DriveError {
    fn from(value: DataError) -> Self {
        match value {
            DataError::InvalidArgument => DriveError::InvalidArgument,
            DataError::WriteFailed | DataError::BodyNull => {
                DriveError::Fatal(ClientError::fatal(value.to_string()))
            }
            DataError::Full => DriveError::CacheFull,
        }
    }
}

impl From<ClientError> for DriveError {
    fn from(value: ClientError) -> Self {
        match value.kind {
            ClientErrorKind::NotFound => DriveError::NotFound,
            _ if value.retryable => DriveError::Retryable(value),
            _ => DriveError::Fatal(value),
        }
    }
}

impl fmt::Display for DriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveError::NotFound => write!(f, "not found"),
            DriveError::Retryable(e) => write!(f, "retryable: {e}"),
            DriveError::Fatal(e) => write!(f, "fatal: {e}"),
            DriveError::CacheFull => write!(f, "cache full"),
            DriveError::InvalidArgument => write!(f, "invalid argument"),
            DriveError::PermissionDenied => write!(f, "permission denied"),
            DriveError::StickyBit => write!(f, "sticky bit violation"),
            DriveError::ParentMissing => write!(f, "parent missing"),
            DriveError::ParentNotDir => write!(f, "parent not a directory"),
            DriveError::NotEmpty => write!(f, "directory not empty"),
            DriveError::AlreadyExists => write!(f, "already exists"),
            DriveError::NameTooLong => write!(f, "name too long"),
            DriveError::StaleLocalState => write!(f, "stale local state"),
            DriveError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for DriveError {}

/// Negative errno value, matching FUSE's convention of returning `-errno`
/// from an upcall.
pub type Errno = i32;

impl DriveError {
    /// Map to the errno the VFS shim should return (§6).
    pub fn to_errno(&self) -> Errno {
        match self {
            DriveError::NotFound => -libc::ENOENT,
            DriveError::ParentMissing => -libc::EINVAL,
            DriveError::ParentNotDir => -libc::EINVAL,
            DriveError::PermissionDenied => -libc::EACCES,
            DriveError::StickyBit => -libc::EPERM,
            DriveError::NotEmpty => -libc::ENOTEMPTY,
            DriveError::AlreadyExists => -libc::EEXIST,
            DriveError::NameTooLong => -libc::ENAMETOOLONG,
            DriveError::Retryable(_) => -libc::EAGAIN,
            DriveError::OutOfMemory => -libc::ENOMEM,
            DriveError::InvalidArgument => -libc::EINVAL,
            DriveError::CacheFull => -libc::ENOSPC,
            DriveError::StaleLocalState => -libc::EAGAIN,
            DriveError::Fatal(_) => -libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_enoent() {
        assert_eq!(DriveError::NotFound.to_errno(), -libc::ENOENT);
    }

    #[test]
    fn sticky_bit_maps_to_eperm() {
        assert_eq!(DriveError::StickyBit.to_errno(), -libc::EPERM);
    }

    #[test]
    fn client_not_found_converts_to_drive_not_found() {
        let client_err = ClientError::not_found("no such key");
        assert!(matches!(DriveError::from(client_err), DriveError::NotFound));
    }

    #[test]
    fn retryable_client_error_converts_to_drive_retryable() {
        let client_err = ClientError::retryable("timed out");
        assert!(matches!(DriveError::from(client_err), DriveError::Retryable(_)));
    }
}
