//! `TransferManager`: turns arbitrarily large reads/writes into bounded-size
//! parts against the [`ObjectClient`], coordinated through a fixed-capacity
//! buffer pool (§4.7).
//!
//! The buffer pool is a channel seeded with a fixed number of reusable
//! buffers, so acquiring one when the channel is empty blocks until a part
//! returns its buffer on drop. Buffers are plain pooled `Vec<u8>`s; parts
//! don't need to be chained into a linked list since each part is an
//! independent range of one object.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{bounded, Receiver, Sender};
use tokio::sync::Mutex;

use crate::cache::Cache;
use crate::client::{CompletedPart, ObjectClient};
use crate::error::ClientError;

/// Retries `op` against §4.7's policy: up to `retry_count` additional
/// attempts, only while [`ClientError::should_retry`] says so, waiting
/// `(1 << attempt) * backoff_scale` between attempts.
async fn retrying<F, Fut, T>(retry_count: u32, backoff_scale: Duration, mut op: F) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < retry_count && err.should_retry() => {
                tokio::time::sleep(backoff_scale * (1u32 << attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A buffer on loan from the pool. Returned automatically when dropped.
pub struct PooledBuffer {
    buf: Vec<u8>,
    returner: Sender<Vec<u8>>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        let _ = self.returner.try_send(buf);
    }
}

struct BufferPool {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    buffer_size: u64,
}

impl BufferPool {
    fn new(buffer_size: u64, count: usize) -> Self {
        let (sender, receiver) = bounded(count);
        for _ in 0..count {
            sender.try_send(Vec::new()).expect("capacity matches count");
        }
        BufferPool { sender, receiver, buffer_size }
    }

    async fn acquire(&self) -> PooledBuffer {
        let mut buf = self.receiver.recv().await.expect("pool channel never closes while manager is alive");
        buf.clear();
        buf.reserve(self.buffer_size as usize);
        PooledBuffer { buf, returner: self.sender.clone() }
    }
}

/// Outcome of one GET/PUT part dispatched to the executor.
#[derive(Debug)]
pub struct PartOutcome {
    pub part_number: u32,
    pub offset: u64,
    pub bytes: u64,
    pub result: Result<Option<String>, ClientError>,
}

/// Aggregates the outcomes of every part of one transfer (§4.7,
/// "a TransferHandle aggregates part outcomes").
pub struct TransferHandle {
    tasks: Mutex<Vec<tokio::task::JoinHandle<PartOutcome>>>,
}

impl TransferHandle {
    fn new(tasks: Vec<tokio::task::JoinHandle<PartOutcome>>) -> Self {
        TransferHandle { tasks: Mutex::new(tasks) }
    }

    /// Waits for every scheduled part and returns their outcomes.
    pub async fn wait_until_finished(&self) -> Vec<PartOutcome> {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(_) => outcomes.push(PartOutcome {
                    part_number: 0,
                    offset: 0,
                    bytes: 0,
                    result: Err(ClientError::fatal("transfer part task panicked")),
                }),
            }
        }
        outcomes
    }

    pub fn has_failed_parts(outcomes: &[PartOutcome]) -> bool {
        outcomes.iter().any(|p| p.result.is_err())
    }
}

pub struct TransferManagerConfig {
    pub buffer_size: u64,
    pub parallel_transfers: usize,
    pub multipart_threshold: u64,
    pub min_part_size: u64,
    /// Additional attempts per part/operation after the first (§4.7).
    pub retry_count: u32,
    /// Scale factor for the exponential backoff `(1 << attempt) * scale`.
    pub retry_backoff_scale: Duration,
}

impl Default for TransferManagerConfig {
    fn default() -> Self {
        TransferManagerConfig {
            buffer_size: 10 << 20,
            parallel_transfers: 5,
            multipart_threshold: 20 << 20,
            min_part_size: 4 << 20,
            retry_count: 3,
            retry_backoff_scale: Duration::from_millis(100),
        }
    }
}

impl From<&crate::config::MountConfig> for TransferManagerConfig {
    fn from(config: &crate::config::MountConfig) -> Self {
        TransferManagerConfig {
            buffer_size: config.transfer_buffer_size as u64,
            parallel_transfers: config.parallel_transfers,
            multipart_threshold: config.multipart_threshold,
            min_part_size: config.multipart_min_part_size as u64,
            retry_count: config.retry_count,
            retry_backoff_scale: config.retry_backoff_scale,
        }
    }
}

/// Splits large GET/PUT calls into bounded parts and drives them against an
/// [`ObjectClient`], writing completed downloads into the [`Cache`] (§4.7).
pub struct TransferManager<C: ObjectClient + 'static> {
    client: Arc<C>,
    cache: Arc<Cache>,
    pool: Arc<BufferPool>,
    config: TransferManagerConfig,
    /// path -> upload id, so `destroy` can abort anything still open.
    open_multipart: Mutex<HashMap<String, String>>,
}

impl<C: ObjectClient + 'static> TransferManager<C> {
    pub fn new(client: Arc<C>, cache: Arc<Cache>, config: TransferManagerConfig) -> Self {
        let pool = Arc::new(BufferPool::new(config.buffer_size, config.parallel_transfers));
        TransferManager { client, cache, pool, config, open_multipart: Mutex::new(HashMap::new()) }
    }

    /// Downloads `[offset, offset + size)` of `path`, splitting into
    /// buffer-sized parts and writing each into the Cache as it lands.
    pub async fn download(&self, path: &str, offset: u64, size: u64, mtime: std::time::SystemTime) -> TransferHandle {
        let mut tasks = Vec::new();
        let mut part_number = 0u32;
        let mut cursor = offset;
        let end = offset + size;
        while cursor < end {
            let part_len = (end - cursor).min(self.config.buffer_size);
            let client = self.client.clone();
            let cache = self.cache.clone();
            let pool = self.pool.clone();
            let path = path.to_string();
            part_number += 1;
            let this_part = part_number;
            let part_offset = cursor;
            let retry_count = self.config.retry_count;
            let backoff_scale = self.config.retry_backoff_scale;
            tasks.push(tokio::spawn(async move {
                let mut buffer = pool.acquire().await;
                let result =
                    retrying(retry_count, backoff_scale, || client.get_object(&path, Some((part_offset, part_offset + part_len))))
                        .await;
                match result {
                    Ok(body) => {
                        buffer.extend_from_slice(&body);
                        let write_result =
                            cache.write(&path, part_offset, buffer.len() as u64, &buffer, mtime, false).await;
                        match write_result {
                            Ok(_) => PartOutcome { part_number: this_part, offset: part_offset, bytes: part_len, result: Ok(None) },
                            Err(err) => PartOutcome {
                                part_number: this_part,
                                offset: part_offset,
                                bytes: 0,
                                result: Err(ClientError::fatal(err.to_string())),
                            },
                        }
                    }
                    Err(err) => {
                        PartOutcome { part_number: this_part, offset: part_offset, bytes: 0, result: Err(err) }
                    }
                }
            }));
            cursor += part_len;
        }
        TransferHandle::new(tasks)
    }

    /// Uploads `path`'s resident bytes, picking single-PUT or multipart
    /// based on `size` against the configured threshold.
    pub async fn upload(&self, path: &str, size: u64, content_type: &str) -> TransferHandle {
        if size < self.config.multipart_threshold {
            return self.upload_single(path, size, content_type).await;
        }
        self.upload_multipart(path, size, content_type).await
    }

    async fn upload_single(&self, path: &str, size: u64, content_type: &str) -> TransferHandle {
        let client = self.client.clone();
        let cache = self.cache.clone();
        let pool = self.pool.clone();
        let path = path.to_string();
        let content_type = content_type.to_string();
        let retry_count = self.config.retry_count;
        let backoff_scale = self.config.retry_backoff_scale;
        let task = tokio::spawn(async move {
            let mut buffer = pool.acquire().await;
            buffer.resize(size as usize, 0);
            let (_found, _unloaded) = cache.read(&path, 0, size, &mut buffer, None).await;
            let result = retrying(retry_count, backoff_scale, || client.put_object(&path, &content_type, &buffer, None)).await;
            match result {
                Ok(()) => PartOutcome { part_number: 1, offset: 0, bytes: size, result: Ok(None) },
                Err(err) => PartOutcome { part_number: 1, offset: 0, bytes: 0, result: Err(err) },
            }
        });
        TransferHandle::new(vec![task])
    }

    async fn upload_multipart(&self, path: &str, size: u64, content_type: &str) -> TransferHandle {
        let retry_count = self.config.retry_count;
        let backoff_scale = self.config.retry_backoff_scale;
        let upload_id =
            match retrying(retry_count, backoff_scale, || self.client.initiate_multipart_upload(path, content_type)).await {
                Ok(id) => id,
                Err(err) => {
                    let task = tokio::spawn(async move {
                        PartOutcome { part_number: 0, offset: 0, bytes: 0, result: Err(err) }
                    });
                    return TransferHandle::new(vec![task]);
                }
            };
        self.open_multipart.lock().await.insert(path.to_string(), upload_id.clone());

        let mut tasks = Vec::new();
        let mut part_number = 0u32;
        let mut cursor = 0u64;
        // §4.7: each part at least `min_part_size`, except the final one.
        let part_size = self.config.buffer_size.max(self.config.min_part_size);
        while cursor < size {
            let part_len = (size - cursor).min(part_size);
            let client = self.client.clone();
            let cache = self.cache.clone();
            let pool = self.pool.clone();
            let path_owned = path.to_string();
            let upload_id = upload_id.clone();
            part_number += 1;
            let this_part = part_number;
            let part_offset = cursor;
            tasks.push(tokio::spawn(async move {
                let mut buffer = pool.acquire().await;
                buffer.resize(part_len as usize, 0);
                let (_found, _unloaded) = cache.read(&path_owned, part_offset, part_len, &mut buffer, None).await;
                let result =
                    retrying(retry_count, backoff_scale, || client.upload_part(&path_owned, &upload_id, this_part, &buffer))
                        .await;
                match result {
                    Ok(etag) => {
                        PartOutcome { part_number: this_part, offset: part_offset, bytes: part_len, result: Ok(Some(etag)) }
                    }
                    Err(err) => PartOutcome { part_number: this_part, offset: part_offset, bytes: 0, result: Err(err) },
                }
            }));
            cursor += part_len;
        }

        let handle = TransferHandle::new(tasks);
        let outcomes = handle.wait_until_finished().await;
        let path = path.to_string();
        if TransferHandle::has_failed_parts(&outcomes) {
            let finished = tokio::spawn(async move { outcomes.into_iter().next().expect("at least one part") });
            return TransferHandle::new(vec![finished]);
        }

        let mut parts: Vec<CompletedPart> = outcomes
            .into_iter()
            .map(|o| CompletedPart { part_number: o.part_number, etag: o.result.ok().flatten().unwrap_or_default() })
            .collect();
        parts.sort_by_key(|p| p.part_number);

        let client = self.client.clone();
        let complete_result =
            retrying(retry_count, backoff_scale, || client.complete_multipart_upload(&path, &upload_id, &parts)).await;
        self.open_multipart.lock().await.remove(&path);
        let task = tokio::spawn(async move {
            match complete_result {
                Ok(()) => PartOutcome { part_number: 0, offset: 0, bytes: size, result: Ok(None) },
                Err(err) => PartOutcome { part_number: 0, offset: 0, bytes: 0, result: Err(err) },
            }
        });
        TransferHandle::new(vec![task])
    }

    /// Aborts a still-open multipart upload after repeated part failures.
    pub async fn retry_upload_or_abort(&self, path: &str) {
        if let Some(upload_id) = self.open_multipart.lock().await.remove(path) {
            let _ = self.client.abort_multipart_upload(path, &upload_id).await;
        }
    }

    /// Aborts every unfinished multipart upload (§5 "destroy aborts all
    /// unfinished multipart handles").
    pub async fn destroy(&self) {
        let uploads = std::mem::take(&mut *self.open_multipart.lock().await);
        for (path, upload_id) in uploads {
            let _ = self.client.abort_multipart_upload(&path, &upload_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::client::InMemoryObjectClient;
    use std::time::SystemTime;

    fn manager(buffer_size: u64, parallel: usize) -> TransferManager<InMemoryObjectClient> {
        let client = Arc::new(InMemoryObjectClient::new());
        let cache = Arc::new(Cache::new(u64::MAX, std::env::temp_dir()));
        let config = TransferManagerConfig { buffer_size, parallel_transfers: parallel, ..Default::default() };
        TransferManager::new(client, cache, config)
    }

    #[tokio::test]
    async fn single_part_download_lands_in_cache() {
        let mgr = manager(1024, 2);
        mgr.client.put_object("/a", "text/plain", b"hello world", None).await.expect("seed put");
        let handle = mgr.download("/a", 0, 11, SystemTime::now()).await;
        let outcomes = handle.wait_until_finished().await;
        assert!(!TransferHandle::has_failed_parts(&outcomes));
        assert!(mgr.cache.has_file_data("/a", 0, 11).await);
    }

    #[tokio::test]
    async fn multi_part_download_splits_across_buffer_size() {
        let mgr = manager(4, 2);
        let body = b"0123456789".to_vec();
        mgr.client.put_object("/a", "text/plain", &body, None).await.expect("seed put");
        let handle = mgr.download("/a", 0, body.len() as u64, SystemTime::now()).await;
        let outcomes = handle.wait_until_finished().await;
        assert_eq!(outcomes.len(), 3);
        assert!(!TransferHandle::has_failed_parts(&outcomes));
        assert!(mgr.cache.has_file_data("/a", 0, body.len() as u64).await);
    }

    #[tokio::test]
    async fn single_put_upload_round_trips_through_client() {
        let mgr = manager(1024, 2);
        mgr.cache.write("/a", 0, 5, b"hello", SystemTime::now(), false).await.expect("write ok");
        let handle = mgr.upload("/a", 5, "text/plain").await;
        let outcomes = handle.wait_until_finished().await;
        assert!(!TransferHandle::has_failed_parts(&outcomes));
        let body = mgr.client.get_object("/a", None).await.expect("get ok");
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn multipart_upload_assembles_full_object() {
        let mgr = manager(4, 2);
        let content = b"abcdefghijklmno".to_vec();
        mgr.cache.write("/big", 0, content.len() as u64, &content, SystemTime::now(), false).await.expect("write ok");
        let config = TransferManagerConfig {
            buffer_size: 4,
            parallel_transfers: 2,
            multipart_threshold: 1,
            min_part_size: 4,
            ..Default::default()
        };
        let client = mgr.client.clone();
        let cache = mgr.cache.clone();
        let mgr = TransferManager::new(client, cache, config);
        let handle = mgr.upload("/big", content.len() as u64, "application/octet-stream").await;
        let outcomes = handle.wait_until_finished().await;
        assert!(!TransferHandle::has_failed_parts(&outcomes));
        let body = mgr.client.get_object("/big", None).await.expect("get ok");
        assert_eq!(body, content);
    }
}
