//! Credentials-file parsing (§6 Persisted state).
//!
//! Format: one entry per line, either `accessKey:secretKey` (default key) or
//! `bucket:accessKey:secretKey` (per-bucket key). Comment lines begin with
//! `#`, blank lines are skipped, lines with a leading `[` or any whitespace
//! or tab are rejected, and the file itself must be readable only by its
//! owner (no group/other bits, no user-execute) — ported verbatim from
//! `original_source/src/client/Credentials.cpp`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{ClientError, ClientErrorKind};

/// An access key / secret key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("access_key_id", &self.access_key_id).finish()
    }
}

/// Parsed contents of a credentials file: at most one default key pair, plus
/// any number of per-bucket overrides.
#[derive(Default)]
pub struct CredentialsProvider {
    default_key: Option<Credentials>,
    bucket_map: HashMap<String, Credentials>,
}

impl CredentialsProvider {
    /// Parse the credentials file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        check_permissions(path)?;

        let contents = fs::read_to_string(path).map_err(|e| {
            ClientError::new(
                ClientErrorKind::ParameterMissing,
                false,
                format!("unable to read credentials file {}: {e}", path.display()),
            )
        })?;

        let mut provider = CredentialsProvider::default();
        for raw_line in contents.lines() {
            let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                return Err(parse_error(path, "line starting with '[' is not allowed"));
            }
            if line.contains(' ') || line.contains('\t') {
                return Err(parse_error(path, "line with whitespace or tab is not allowed"));
            }

            let first = line.find(':');
            let last = line.rfind(':');
            let (first, last) = match (first, last) {
                (Some(f), Some(l)) => (f, l),
                _ => return Err(parse_error(path, "line has no ':' separator")),
            };

            if first == last {
                let access_key = line[..first].to_string();
                let secret_key = line[first + 1..].to_string();
                if provider.default_key.is_some() {
                    tracing::warn!(
                        path = %path.display(),
                        "more than one default key pair in credentials file, keeping the first"
                    );
                    continue;
                }
                provider.default_key = Some(Credentials { access_key_id: access_key, secret_key });
            } else {
                let bucket = line[..first].to_string();
                let access_key = line[first + 1..last].to_string();
                let secret_key = line[last + 1..].to_string();
                if provider
                    .bucket_map
                    .insert(bucket.clone(), Credentials { access_key_id: access_key, secret_key })
                    .is_some()
                {
                    return Err(parse_error(
                        path,
                        &format!("duplicate key pair for bucket {bucket}"),
                    ));
                }
            }
        }

        Ok(provider)
    }

    /// Fetch the default key pair.
    pub fn default_credentials(&self) -> Result<&Credentials, ClientError> {
        self.default_key
            .as_ref()
            .ok_or_else(|| ClientError::fatal("no default credentials configured"))
    }

    /// Fetch the key pair configured for a specific bucket, if any.
    pub fn credentials_for_bucket(&self, bucket: &str) -> Result<&Credentials, ClientError> {
        self.bucket_map
            .get(bucket)
            .ok_or_else(|| ClientError::fatal(format!("no credentials configured for {bucket}")))
    }
}

fn parse_error(path: &Path, detail: &str) -> ClientError {
    ClientError::new(
        ClientErrorKind::ParameterMissing,
        false,
        format!("invalid credentials file {}: {detail}", path.display()),
    )
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), ClientError> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::metadata(path).map_err(|e| {
        ClientError::new(
            ClientErrorKind::ParameterMissing,
            false,
            format!("unable to stat credentials file {}: {e}", path.display()),
        )
    })?;
    let mode = meta.permissions().mode();

    if mode & (libc::S_IROTH | libc::S_IWOTH | libc::S_IXOTH) as u32 != 0 {
        return Err(parse_error(path, "must not grant any 'other' permissions"));
    }
    if mode & (libc::S_IRGRP | libc::S_IWGRP | libc::S_IXGRP) as u32 != 0 {
        return Err(parse_error(path, "must not grant any 'group' permissions"));
    }
    if mode & libc::S_IXUSR as u32 != 0 {
        return Err(parse_error(path, "must not be user-executable"));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<(), ClientError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::NamedTempFile;

    fn write_file(contents: &str, mode: u32) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write contents");
        file.as_file().set_permissions(std::fs::Permissions::from_mode(mode)).expect("chmod");
        file
    }

    #[test]
    fn parses_default_and_bucket_keys() {
        let file = write_file("# comment\ndefault-access:default-secret\nbucket1:ak1:sk1\n", 0o600);
        let provider = CredentialsProvider::load(file.path()).expect("parse");
        assert_eq!(provider.default_credentials().unwrap().access_key_id, "default-access");
        let creds = provider.credentials_for_bucket("bucket1").unwrap();
        assert_eq!(creds.access_key_id, "ak1");
        assert_eq!(creds.secret_key, "sk1");
    }

    #[test]
    fn rejects_group_readable_file() {
        let file = write_file("a:b\n", 0o640);
        assert!(CredentialsProvider::load(file.path()).is_err());
    }

    #[test]
    fn rejects_whitespace_line() {
        let file = write_file("access key:secret\n", 0o600);
        assert!(CredentialsProvider::load(file.path()).is_err());
    }

    #[test]
    fn rejects_bracket_line() {
        let file = write_file("[default]\naccess:secret\n", 0o600);
        assert!(CredentialsProvider::load(file.path()).is_err());
    }

    #[test]
    fn only_first_default_key_is_kept() {
        let file = write_file("a1:s1\na2:s2\n", 0o600);
        let provider = CredentialsProvider::load(file.path()).expect("parse");
        assert_eq!(provider.default_credentials().unwrap().access_key_id, "a1");
    }
}
