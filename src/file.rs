//! `File`: the ordered, non-overlapping set of [`Page`]s cached for one
//! object key (§3, §4.2).

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex;

use crate::error::DataError;
use crate::page::Page;

struct Entry {
    page: Arc<Page>,
    /// Mirrors `page.len()`, kept in sync by every mutation that goes
    /// through `File` so bookkeeping (`has_data`, `consecutive_prefix`,
    /// gap computation) never needs to lock the page itself.
    length: u64,
}

struct Inner {
    pages: BTreeMap<u64, Entry>,
    mtime: SystemTime,
    total_bytes: u64,
    in_memory_bytes: u64,
    use_disk: bool,
    open: bool,
}

/// The result of a [`File::write`]: whether it took effect, and how many
/// bytes were newly accounted for in memory vs. overall.
pub struct WriteOutcome {
    pub ok: bool,
    pub added_in_memory: u64,
    pub added_total: u64,
}

/// The result of a [`File::read`].
pub struct ReadOutcome {
    pub bytes_found: u64,
    pub pages: Vec<Arc<Page>>,
    pub unloaded_ranges: VecDeque<(u64, u64)>,
}

pub struct File {
    base_name: String,
    spill_path: PathBuf,
    inner: Mutex<Inner>,
}

impl File {
    pub fn new(base_name: impl Into<String>, spill_path: PathBuf) -> Self {
        File {
            base_name: base_name.into(),
            spill_path,
            inner: Mutex::new(Inner {
                pages: BTreeMap::new(),
                mtime: SystemTime::UNIX_EPOCH,
                total_bytes: 0,
                in_memory_bytes: 0,
                use_disk: false,
                open: false,
            }),
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub async fn size(&self) -> u64 {
        self.inner.lock().await.total_bytes
    }

    pub async fn in_memory_size(&self) -> u64 {
        self.inner.lock().await.in_memory_bytes
    }

    pub async fn mtime(&self) -> SystemTime {
        self.inner.lock().await.mtime
    }

    pub async fn set_mtime(&self, mtime: SystemTime) {
        self.inner.lock().await.mtime = mtime;
    }

    pub async fn use_disk(&self) -> bool {
        self.inner.lock().await.use_disk
    }

    /// Switch this file onto disk-backed pages for all future writes
    /// (§4.2 spill policy; the threshold decision itself lives in Cache).
    pub async fn set_use_disk(&self, use_disk: bool) {
        self.inner.lock().await.use_disk = use_disk;
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.open
    }

    pub async fn set_open(&self, open: bool) {
        self.inner.lock().await.open = open;
    }

    /// Flush every resident in-memory page to the shared spill file and
    /// replace it with a disk-backed page, latching `use_disk` so future
    /// writes spill too (§4.2 spill policy; called by Cache once a file
    /// crosses its per-file budget, or to reclaim an open file's memory
    /// under eviction pressure). Returns the in-memory bytes reclaimed.
    pub async fn spill_to_disk(&self) -> Result<u64, DataError> {
        let mut inner = self.inner.lock().await;
        inner.use_disk = true;
        let keys: Vec<u64> = inner.pages.keys().cloned().collect();
        let mut freed = 0u64;
        for key in keys {
            let (length, already_disk) = {
                let entry = &inner.pages[&key];
                (entry.length, entry.page.use_disk().await)
            };
            if already_disk || length == 0 {
                continue;
            }
            let mut buf = vec![0u8; length as usize];
            inner.pages[&key].page.read(key, length, &mut buf).await?;
            let disk_page = Page::from_bytes_on_disk(key, &buf, self.spill_path.clone()).await?;
            inner.pages.get_mut(&key).expect("entry present").page = Arc::new(disk_page);
            freed += length;
        }
        inner.in_memory_bytes = inner.in_memory_bytes.saturating_sub(freed);
        Ok(freed)
    }

    /// Keys of pages overlapping the half-open range `[o1, o2)`, in order.
    fn intersecting_keys(pages: &BTreeMap<u64, Entry>, o1: u64, o2: u64) -> Vec<u64> {
        pages.range(..o2).filter(|(&k, e)| k + e.length > o1).map(|(&k, _)| k).collect()
    }

    async fn make_page(&self, use_disk: bool, offset: u64, buf: &[u8]) -> Result<Arc<Page>, DataError> {
        if use_disk {
            Ok(Arc::new(Page::from_bytes_on_disk(offset, buf, self.spill_path.clone()).await?))
        } else {
            Ok(Arc::new(Page::from_bytes(offset, buf)))
        }
    }

    /// Write `buf` at `offset`. Creates pages to cover holes, refreshes
    /// (or partially refreshes) pages the write overlaps, and inserts a
    /// trailing page for any remainder past the last overlapping page.
    ///
    /// `mtime` is the modification time accompanying this write; when it
    /// is strictly newer than the file's current `mtime`, the new content
    /// replaces whatever already occupied the overlapped range. When it is
    /// equal (or older), existing bytes are preserved and only gaps are
    /// filled, per §4.2. `open` marks the file open if set; it never
    /// clears the open flag.
    pub async fn write(
        &self,
        offset: u64,
        len: u64,
        buf: &[u8],
        mtime: SystemTime,
        open: bool,
    ) -> Result<WriteOutcome, DataError> {
        if buf.len() as u64 != len {
            return Err(DataError::InvalidArgument);
        }
        let mut inner = self.inner.lock().await;
        if open {
            inner.open = true;
        }
        let use_disk = inner.use_disk;
        let write_end = offset + len;
        let overwrite = mtime > inner.mtime;
        if mtime >= inner.mtime {
            inner.mtime = mtime;
        }

        let keys = Self::intersecting_keys(&inner.pages, offset, write_end);
        let mut added_total = 0u64;
        let mut added_in_memory = 0u64;
        let mut cursor = offset;
        let mut new_pages: Vec<(u64, Entry)> = Vec::new();
        let mut growths: Vec<(u64, u64, u64, Vec<u8>)> = Vec::new(); // (key, req_offset, req_len, data)

        for key in keys {
            let page_len = inner.pages[&key].length;
            let page_start = key;
            let page_next = key + page_len;

            if page_start > cursor {
                let hole_len = page_start - cursor;
                let slice = &buf[(cursor - offset) as usize..(cursor - offset + hole_len) as usize];
                let page = self.make_page(use_disk, cursor, slice).await?;
                added_total += hole_len;
                if !use_disk {
                    added_in_memory += hole_len;
                }
                new_pages.push((cursor, Entry { page, length: hole_len }));
                cursor = page_start;
            }

            let seg_start = cursor.max(page_start);
            let seg_end = write_end.min(page_next);
            if seg_end > seg_start {
                if overwrite {
                    let slice = buf[(seg_start - offset) as usize..(seg_end - offset) as usize].to_vec();
                    if seg_end > page_next {
                        added_total += seg_end - page_next;
                        if !use_disk {
                            added_in_memory += seg_end - page_next;
                        }
                    }
                    growths.push((key, seg_start, seg_end - seg_start, slice));
                }
                cursor = seg_end;
            }
        }

        if cursor < write_end {
            let slice = &buf[(cursor - offset) as usize..];
            let hole_len = write_end - cursor;
            let page = self.make_page(use_disk, cursor, slice).await?;
            added_total += hole_len;
            if !use_disk {
                added_in_memory += hole_len;
            }
            new_pages.push((cursor, Entry { page, length: hole_len }));
        }

        for (key, req_offset, req_len, data) in growths {
            let entry = &inner.pages[&key];
            entry.page.refresh(req_offset, req_len, &data).await?;
            let new_len = entry.page.len().await;
            inner.pages.get_mut(&key).expect("entry present").length = new_len;
        }
        for (key, entry) in new_pages {
            inner.pages.insert(key, entry);
        }

        inner.total_bytes += added_total;
        inner.in_memory_bytes += added_in_memory;

        Ok(WriteOutcome { ok: true, added_in_memory, added_total })
    }

    /// Read `len` bytes at `offset`. If `mtime_since` is set and the file
    /// has been modified more recently, the whole requested span is
    /// reported unloaded rather than partially served from stale pages
    /// (§4.2).
    pub async fn read(&self, offset: u64, len: u64, mtime_since: Option<SystemTime>) -> ReadOutcome {
        let inner = self.inner.lock().await;
        let end = offset + len;

        if let Some(since) = mtime_since {
            if inner.mtime > since {
                let mut ranges = VecDeque::new();
                ranges.push_back((offset, len));
                return ReadOutcome { bytes_found: 0, pages: Vec::new(), unloaded_ranges: ranges };
            }
        }

        let keys = Self::intersecting_keys(&inner.pages, offset, end);
        let mut cursor = offset;
        let mut bytes_found = 0u64;
        let mut pages = Vec::new();
        let mut gaps = VecDeque::new();

        for key in keys {
            let entry = &inner.pages[&key];
            let page_start = key;
            let page_next = key + entry.length;
            if page_start > cursor {
                gaps.push_back((cursor, page_start - cursor));
                cursor = page_start;
            }
            let seg_end = end.min(page_next);
            bytes_found += seg_end.saturating_sub(cursor);
            pages.push(entry.page.clone());
            cursor = seg_end.max(cursor);
        }
        if cursor < end {
            gaps.push_back((cursor, end - cursor));
        }

        ReadOutcome { bytes_found, pages, unloaded_ranges: gaps }
    }

    pub async fn has_data(&self, offset: u64, len: u64) -> bool {
        self.unloaded_ranges(offset, len).await.is_empty()
    }

    pub async fn unloaded_ranges(&self, offset: u64, len: u64) -> VecDeque<(u64, u64)> {
        let inner = self.inner.lock().await;
        let end = offset + len;
        let keys = Self::intersecting_keys(&inner.pages, offset, end);
        let mut cursor = offset;
        let mut gaps = VecDeque::new();
        for key in keys {
            let entry = &inner.pages[&key];
            if key > cursor {
                gaps.push_back((cursor, key - cursor));
            }
            cursor = (key + entry.length).max(cursor);
        }
        if cursor < end {
            gaps.push_back((cursor, end - cursor));
        }
        gaps
    }

    /// The `[first-page-offset, first-gap-offset)` span of bytes resident
    /// from the start of the file, with no hole.
    pub async fn consecutive_prefix(&self) -> (u64, u64) {
        let inner = self.inner.lock().await;
        let mut iter = inner.pages.iter();
        match iter.next() {
            Some((&first_key, first_entry)) => {
                let mut end = first_key + first_entry.length;
                for (&key, entry) in iter {
                    if key == end {
                        end = key + entry.length;
                    } else {
                        break;
                    }
                }
                (first_key, end)
            }
            None => (0, 0),
        }
    }

    /// Pop pages from the back until the file is at most `new_size`
    /// bytes; the page straddling `new_size`, if any, is lazily shrunk in
    /// place rather than recreated.
    pub async fn resize_smaller(&self, new_size: u64) {
        let mut inner = self.inner.lock().await;
        let keys: Vec<u64> = inner.pages.keys().rev().cloned().collect();
        for key in keys {
            let entry_next = {
                let e = &inner.pages[&key];
                key + e.length
            };
            if key >= new_size {
                if let Some(removed) = inner.pages.remove(&key) {
                    inner.total_bytes -= removed.length;
                    if !inner.use_disk {
                        inner.in_memory_bytes = inner.in_memory_bytes.saturating_sub(removed.length);
                    }
                }
            } else if entry_next > new_size {
                let new_len = new_size - key;
                let shrink_by = entry_next - new_size;
                let entry = inner.pages.get_mut(&key).expect("entry present");
                entry.page.resize_smaller(new_len).await;
                entry.length = new_len;
                inner.total_bytes -= shrink_by;
                if !inner.use_disk {
                    inner.in_memory_bytes = inner.in_memory_bytes.saturating_sub(shrink_by);
                }
                break;
            } else {
                break;
            }
        }
    }

    /// Drop every page. Does not remove the spill file on disk; callers
    /// that are destroying the File entirely should follow with
    /// [`File::remove_spill_file`].
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.pages.clear();
        inner.total_bytes = 0;
        inner.in_memory_bytes = 0;
    }

    /// Best-effort removal of this file's spill file; called when the
    /// owning File is erased from the Cache entirely (§3: "removing a
    /// File deletes its spill file").
    pub async fn remove_spill_file(&self) {
        match tokio::fs::remove_file(&self.spill_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.spill_path.display(), error = %e, "failed to remove spill file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn spill_path() -> PathBuf {
        std::env::temp_dir().join(format!("objectfs-file-test-{:?}", std::thread::current().id()))
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let file = File::new("a", spill_path());
        file.write(0, 5, b"hello", t(1), false).await.expect("write ok");
        let out = file.read(0, 5, None).await;
        assert_eq!(out.bytes_found, 5);
        assert_eq!(out.unloaded_ranges.len(), 0);
        assert_eq!(out.pages.len(), 1);
    }

    #[tokio::test]
    async fn read_reports_gaps_around_written_pages() {
        let file = File::new("a", spill_path());
        file.write(10, 5, b"abcde", t(1), false).await.expect("write ok");
        let out = file.read(0, 20, None).await;
        assert_eq!(out.unloaded_ranges, VecDeque::from([(0, 10), (15, 5)]));
        assert_eq!(out.bytes_found, 5);
    }

    #[tokio::test]
    async fn newer_write_overwrites_older_overlap() {
        let file = File::new("a", spill_path());
        file.write(0, 5, b"aaaaa", t(1), false).await.expect("write ok");
        file.write(0, 5, b"bbbbb", t(2), false).await.expect("write ok");
        let out = file.read(0, 5, None).await;
        let mut buf = vec![0u8; 5];
        out.pages[0].read(0, 5, &mut buf).await.expect("read ok");
        assert_eq!(&buf, b"bbbbb");
    }

    #[tokio::test]
    async fn equal_mtime_write_preserves_existing_bytes_but_fills_gaps() {
        let file = File::new("a", spill_path());
        file.write(0, 5, b"aaaaa", t(5), false).await.expect("write ok");
        file.write(0, 10, b"zzzzzzzzzz", t(5), false).await.expect("write ok");
        let out = file.read(0, 10, None).await;
        assert_eq!(out.unloaded_ranges.len(), 0);
        let mut buf = vec![0u8; 5];
        out.pages[0].read(0, 5, &mut buf).await.expect("read ok");
        assert_eq!(&buf, b"aaaaa");
    }

    #[tokio::test]
    async fn mtime_since_newer_than_file_forces_full_redownload() {
        let file = File::new("a", spill_path());
        file.write(0, 5, b"aaaaa", t(1), false).await.expect("write ok");
        let out = file.read(0, 5, Some(t(0))).await;
        assert_eq!(out.bytes_found, 0);
        assert_eq!(out.unloaded_ranges, VecDeque::from([(0, 5)]));
    }

    #[tokio::test]
    async fn resize_smaller_drops_trailing_pages_and_shrinks_straddler() {
        let file = File::new("a", spill_path());
        file.write(0, 5, b"aaaaa", t(1), false).await.expect("write ok");
        file.write(5, 5, b"bbbbb", t(1), false).await.expect("write ok");
        file.resize_smaller(7).await;
        assert_eq!(file.size().await, 7);
        assert!(file.has_data(0, 7).await);
        assert!(!file.has_data(0, 8).await);
    }

    #[tokio::test]
    async fn consecutive_prefix_stops_at_first_gap() {
        let file = File::new("a", spill_path());
        file.write(0, 3, b"abc", t(1), false).await.expect("write ok");
        file.write(10, 3, b"xyz", t(1), false).await.expect("write ok");
        assert_eq!(file.consecutive_prefix().await, (0, 3));
    }

    #[tokio::test]
    async fn spill_to_disk_moves_resident_pages_and_latches_use_disk() {
        let file = File::new("a", spill_path());
        file.write(0, 5, b"hello", t(1), false).await.expect("write ok");
        assert!(!file.use_disk().await);

        let freed = file.spill_to_disk().await.expect("spill ok");
        assert_eq!(freed, 5);
        assert_eq!(file.in_memory_size().await, 0);
        assert!(file.use_disk().await);

        let out = file.read(0, 5, None).await;
        let mut buf = vec![0u8; 5];
        out.pages[0].read(0, 5, &mut buf).await.expect("read ok");
        assert_eq!(&buf, b"hello");

        file.write(5, 5, b"world", t(1), false).await.expect("write ok");
        assert_eq!(file.in_memory_size().await, 0, "pages written after spill stay disk-backed");
    }

    #[tokio::test]
    async fn clear_drops_all_pages() {
        let file = File::new("a", spill_path());
        file.write(0, 3, b"abc", t(1), false).await.expect("write ok");
        file.clear().await;
        assert_eq!(file.size().await, 0);
        assert!(!file.has_data(0, 3).await);
    }
}
