//! `Page`: one contiguous byte range of one `File`, memory- or disk-backed
//! (§3, §4.1).
//!
//! ```text
//! offset  stop  next        <- 1st page
//!   v        v  v
//!   |________|__|________
//!   |<- len  ->|        |
//!   |___________|________|
//!   0  1  2  3  4  5  6  7
//!               ^     ^  ^
//!          offset  stop  next   <- 2nd page
//!
//! 1st page: offset = 0, len = 4, stop = 3, next = 4
//! 2nd page: offset = 4, len = 3, stop = 6, next = 7
//! ```

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::DataError;

/// Where a page's bytes live.
enum Body {
    Memory(Vec<u8>),
    /// `path` is the owning File's shared spill file; this page's bytes
    /// live at `[offset, offset+length)` within it.
    Disk { path: PathBuf },
}

struct Inner {
    /// Logical length; may be less than the physical storage reserved for
    /// it (resize-smaller is lazy, §4.1).
    length: u64,
    body: Body,
}

/// A contiguous byte range of one file. `offset` never changes after
/// construction; `length` can grow (via [`Page::refresh`]) or shrink (via
/// [`Page::resize_smaller`]).
pub struct Page {
    offset: u64,
    inner: Mutex<Inner>,
}

impl Page {
    /// Construct a page from an in-memory buffer.
    pub fn from_bytes(offset: u64, buf: &[u8]) -> Self {
        Page {
            offset,
            inner: Mutex::new(Inner { length: buf.len() as u64, body: Body::Memory(buf.to_vec()) }),
        }
    }

    /// Construct a page from an in-memory buffer, spilling it straight to
    /// `disk_path` (a region of the owning File's shared spill file).
    pub async fn from_bytes_on_disk(offset: u64, buf: &[u8], disk_path: PathBuf) -> Result<Self, DataError> {
        write_at(&disk_path, offset, buf).await?;
        Ok(Page { offset, inner: Mutex::new(Inner { length: buf.len() as u64, body: Body::Disk { path: disk_path } }) })
    }

    /// Construct a page by draining up to `len` bytes from an async
    /// reader into memory (the "lazy consumption" stream variant, §4.1).
    pub async fn from_reader<R>(offset: u64, len: u64, mut reader: R) -> Result<Self, DataError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await.map_err(|_| DataError::WriteFailed)?;
        Ok(Page { offset, inner: Mutex::new(Inner { length: len, body: Body::Memory(buf) }) })
    }

    /// Construct a page by draining up to `len` bytes from an async reader
    /// straight to the spill file.
    pub async fn from_reader_on_disk<R>(
        offset: u64,
        len: u64,
        mut reader: R,
        disk_path: PathBuf,
    ) -> Result<Self, DataError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await.map_err(|_| DataError::WriteFailed)?;
        write_at(&disk_path, offset, &buf).await?;
        Ok(Page { offset, inner: Mutex::new(Inner { length: len, body: Body::Disk { path: disk_path } }) })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub async fn len(&self) -> u64 {
        self.inner.lock().await.length
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Offset of the last byte in this page, or `offset` itself if empty.
    pub async fn stop(&self) -> u64 {
        let length = self.len().await;
        if length == 0 {
            self.offset
        } else {
            self.offset + length - 1
        }
    }

    /// Offset of the next page that would immediately follow this one.
    pub async fn next(&self) -> u64 {
        self.offset + self.len().await
    }

    pub async fn use_disk(&self) -> bool {
        matches!(self.inner.lock().await.body, Body::Disk { .. })
    }

    /// Read `len` bytes starting at `req_offset` into `buf` (`buf` must be
    /// at least `len` bytes). The requested span must lie within this
    /// page's current bounds.
    pub async fn read(&self, req_offset: u64, len: u64, buf: &mut [u8]) -> Result<(), DataError> {
        let guard = self.inner.lock().await;
        let next = self.offset + guard.length;
        if req_offset < self.offset || req_offset + len > next {
            return Err(DataError::InvalidArgument);
        }
        let start = (req_offset - self.offset) as usize;
        let len = len as usize;
        match &guard.body {
            Body::Memory(vec) => {
                buf[..len].copy_from_slice(&vec[start..start + len]);
                Ok(())
            }
            Body::Disk { path } => read_at(path, req_offset, &mut buf[..len]).await,
        }
    }

    /// Overwrite or extend (to the right only) this page's content.
    /// Growing the page when disk-backed flushes the whole page (old and
    /// new bytes) to the spill file so subsequent reads are correct
    /// regardless of backing (§4.1).
    pub async fn refresh(&self, req_offset: u64, len: u64, buf: &[u8]) -> Result<(), DataError> {
        if req_offset < self.offset {
            return Err(DataError::InvalidArgument);
        }
        let mut guard = self.inner.lock().await;
        let start = (req_offset - self.offset) as usize;
        let end = start + len as usize;
        let grows = end as u64 > guard.length;

        match &mut guard.body {
            Body::Memory(vec) => {
                if vec.len() < end {
                    vec.resize(end, 0);
                }
                vec[start..end].copy_from_slice(buf);
                if grows {
                    guard.length = end as u64;
                }
                Ok(())
            }
            Body::Disk { path } => {
                if grows {
                    // Flush the unaffected prefix bytes too, so the file
                    // reflects the whole page after the resize.
                    write_at(path, req_offset, buf).await?;
                    guard.length = end as u64;
                    Ok(())
                } else {
                    write_at(path, req_offset, buf).await
                }
            }
        }
    }

    /// Lazily shrink: only the logical length (and, for a stream body, the
    /// write cursor) is adjusted; backing storage is not freed (§4.1).
    pub async fn resize_smaller(&self, new_len: u64) {
        let mut guard = self.inner.lock().await;
        if new_len < guard.length {
            guard.length = new_len;
        }
    }
}

async fn write_at(path: &Path, offset: u64, buf: &[u8]) -> Result<(), DataError> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(path)
        .await
        .map_err(|_| DataError::WriteFailed)?;
    file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|_| DataError::WriteFailed)?;
    file.write_all(buf).await.map_err(|_| DataError::WriteFailed)?;
    file.flush().await.map_err(|_| DataError::WriteFailed)?;
    Ok(())
    // `file` drops here, closing the fd: the scoped open/seek/io/close
    // pattern called for in §4.1.
}

async fn read_at(path: &Path, offset: u64, buf: &mut [u8]) -> Result<(), DataError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|_| DataError::WriteFailed)?;
    file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|_| DataError::WriteFailed)?;
    file.read_exact(buf).await.map_err(|_| DataError::WriteFailed)?;
    Ok(())
}
