//! `ObjectClient`: the narrow, async, store-facing capability the rest of
//! the core consumes without owning (§4.6, §6).
//!
//! A plain trait of async methods, no blanket default impls, object-safe
//! via `Sync + Send`. The wire protocol, signing, and retries behind a
//! real implementation are out of scope (§1); this module also ships an
//! in-memory test double used by the integration tests.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub path: String,
    pub size: u64,
    pub mtime: SystemTime,
    pub etag: String,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub enum HeadOutcome {
    /// The caller's `modified_since` is still current; nothing changed.
    NotModified,
    Found(ObjectSummary),
}

#[derive(Debug, Clone, Copy)]
pub struct StatVfs {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// One part of a completed multipart upload, in upload order.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait ObjectClient: Sync + Send {
    async fn head_bucket(&self) -> Result<(), ClientError>;

    async fn stat_vfs(&self) -> Result<StatVfs, ClientError>;

    /// Paginated LIST with delimiter `/`, returning every entry (file or
    /// subdirectory marker) directly under `prefix`.
    async fn list_directory(&self, prefix: &str) -> Result<Vec<ObjectSummary>, ClientError>;

    async fn head_object(&self, path: &str, modified_since: Option<SystemTime>) -> Result<HeadOutcome, ClientError>;

    async fn get_object(&self, path: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>, ClientError>;

    /// `copy_source`, when set, performs a server-side copy instead of
    /// uploading `body` (used for move/rename).
    async fn put_object(
        &self,
        path: &str,
        content_type: &str,
        body: &[u8],
        copy_source: Option<&str>,
    ) -> Result<(), ClientError>;

    async fn delete_object(&self, path: &str) -> Result<(), ClientError>;

    async fn initiate_multipart_upload(&self, path: &str, content_type: &str) -> Result<String, ClientError>;

    async fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_number: u32,
        body: &[u8],
    ) -> Result<String, ClientError>;

    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ClientError>;

    async fn abort_multipart_upload(&self, path: &str, upload_id: &str) -> Result<(), ClientError>;
}

struct StoredObject {
    body: Vec<u8>,
    content_type: String,
    mtime: SystemTime,
    etag: String,
}

struct PendingUpload {
    path: String,
    parts: HashMap<u32, Vec<u8>>,
}

/// In-memory `ObjectClient` test double, used by the integration tests
/// (§1.1 ambient test tooling) in place of a real HTTP-backed store.
pub struct InMemoryObjectClient {
    objects: Mutex<HashMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    next_etag: Mutex<u64>,
}

impl InMemoryObjectClient {
    pub fn new() -> Self {
        InMemoryObjectClient {
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_etag: Mutex::new(0),
        }
    }

    async fn fresh_etag(&self) -> String {
        let mut counter = self.next_etag.lock().await;
        *counter += 1;
        format!("etag-{counter}")
    }
}

impl Default for InMemoryObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectClient for InMemoryObjectClient {
    async fn head_bucket(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn stat_vfs(&self) -> Result<StatVfs, ClientError> {
        Ok(StatVfs { total_bytes: u64::MAX, free_bytes: u64::MAX })
    }

    async fn list_directory(&self, prefix: &str) -> Result<Vec<ObjectSummary>, ClientError> {
        let objects = self.objects.lock().await;
        let mut out: Vec<ObjectSummary> = objects
            .iter()
            .filter(|(path, _)| {
                path.starts_with(prefix) && path[prefix.len()..].trim_end_matches('/').find('/').is_none() && *path != prefix
            })
            .map(|(path, obj)| ObjectSummary {
                path: path.clone(),
                size: obj.body.len() as u64,
                mtime: obj.mtime,
                etag: obj.etag.clone(),
                content_type: obj.content_type.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn head_object(&self, path: &str, modified_since: Option<SystemTime>) -> Result<HeadOutcome, ClientError> {
        let objects = self.objects.lock().await;
        let obj = objects.get(path).ok_or_else(|| ClientError::not_found(format!("no such key {path}")))?;
        if let Some(since) = modified_since {
            if obj.mtime <= since {
                return Ok(HeadOutcome::NotModified);
            }
        }
        Ok(HeadOutcome::Found(ObjectSummary {
            path: path.to_string(),
            size: obj.body.len() as u64,
            mtime: obj.mtime,
            etag: obj.etag.clone(),
            content_type: obj.content_type.clone(),
        }))
    }

    async fn get_object(&self, path: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>, ClientError> {
        let objects = self.objects.lock().await;
        let obj = objects.get(path).ok_or_else(|| ClientError::not_found(format!("no such key {path}")))?;
        match range {
            Some((start, end)) => {
                let start = start as usize;
                let end = (end as usize).min(obj.body.len());
                Ok(obj.body.get(start..end).unwrap_or_default().to_vec())
            }
            None => Ok(obj.body.clone()),
        }
    }

    async fn put_object(
        &self,
        path: &str,
        content_type: &str,
        body: &[u8],
        copy_source: Option<&str>,
    ) -> Result<(), ClientError> {
        let etag = self.fresh_etag().await;
        let mut objects = self.objects.lock().await;
        let body = match copy_source {
            Some(src) => objects.get(src).map(|o| o.body.clone()).ok_or_else(|| {
                ClientError::not_found(format!("copy source {src} missing"))
            })?,
            None => body.to_vec(),
        };
        objects.insert(
            path.to_string(),
            StoredObject { body, content_type: content_type.to_string(), mtime: SystemTime::now(), etag },
        );
        Ok(())
    }

    async fn delete_object(&self, path: &str) -> Result<(), ClientError> {
        let mut objects = self.objects.lock().await;
        objects.remove(path).ok_or_else(|| ClientError::not_found(format!("no such key {path}")))?;
        Ok(())
    }

    async fn initiate_multipart_upload(&self, path: &str, _content_type: &str) -> Result<String, ClientError> {
        let upload_id = format!("upload-{}", self.fresh_etag().await);
        self.uploads
            .lock()
            .await
            .insert(upload_id.clone(), PendingUpload { path: path.to_string(), parts: HashMap::new() });
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _path: &str,
        upload_id: &str,
        part_number: u32,
        body: &[u8],
    ) -> Result<String, ClientError> {
        let mut uploads = self.uploads.lock().await;
        let upload =
            uploads.get_mut(upload_id).ok_or_else(|| ClientError::fatal(format!("no such upload {upload_id}")))?;
        upload.parts.insert(part_number, body.to_vec());
        Ok(format!("part-etag-{part_number}"))
    }

    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ClientError> {
        let mut uploads = self.uploads.lock().await;
        let upload =
            uploads.remove(upload_id).ok_or_else(|| ClientError::fatal(format!("no such upload {upload_id}")))?;
        let mut body = Vec::new();
        let mut sorted = parts.to_vec();
        sorted.sort_by_key(|p| p.part_number);
        for part in &sorted {
            let chunk = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| ClientError::fatal(format!("missing part {}", part.part_number)))?;
            body.extend_from_slice(chunk);
        }
        drop(uploads);
        self.put_object(path, "application/octet-stream", &body, None).await?;
        let _ = upload.path;
        Ok(())
    }

    async fn abort_multipart_upload(&self, _path: &str, upload_id: &str) -> Result<(), ClientError> {
        self.uploads.lock().await.remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let client = InMemoryObjectClient::new();
        client.put_object("/a", "text/plain", b"hello", None).await.expect("put ok");
        let body = client.get_object("/a", None).await.expect("get ok");
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn head_missing_object_is_not_found() {
        let client = InMemoryObjectClient::new();
        assert!(client.head_object("/missing", None).await.is_err());
    }

    #[tokio::test]
    async fn list_directory_is_non_recursive() {
        let client = InMemoryObjectClient::new();
        client.put_object("/dir/a", "text/plain", b"x", None).await.expect("put ok");
        client.put_object("/dir/sub/b", "text/plain", b"y", None).await.expect("put ok");
        let listing = client.list_directory("/dir/").await.expect("list ok");
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, "/dir/a");
    }

    #[tokio::test]
    async fn multipart_upload_assembles_parts_in_order() {
        let client = InMemoryObjectClient::new();
        let upload_id = client.initiate_multipart_upload("/big", "application/octet-stream").await.expect("init ok");
        let e2 = client.upload_part("/big", &upload_id, 2, b"world").await.expect("part ok");
        let e1 = client.upload_part("/big", &upload_id, 1, b"hello").await.expect("part ok");
        client
            .complete_multipart_upload(
                "/big",
                &upload_id,
                &[CompletedPart { part_number: 1, etag: e1 }, CompletedPart { part_number: 2, etag: e2 }],
            )
            .await
            .expect("complete ok");
        let body = client.get_object("/big", None).await.expect("get ok");
        assert_eq!(body, b"helloworld");
    }

    #[tokio::test]
    async fn copy_source_put_duplicates_existing_object() {
        let client = InMemoryObjectClient::new();
        client.put_object("/src", "text/plain", b"abc", None).await.expect("put ok");
        client.put_object("/dst", "text/plain", b"", Some("/src")).await.expect("copy ok");
        let body = client.get_object("/dst", None).await.expect("get ok");
        assert_eq!(body, b"abc");
    }
}
