use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, MutexGuard};

use common::{DbError, DbResult, PAGE_SIZE, PageId};
use log::warn;

use crate::file::DbFile;

/// Page-granular I/O over one [`DbFile`], plus the page count persisted in
/// the reserved header page.
///
/// One mutex serializes every I/O path. `allocate_page` releases it before
/// zero-filling the new page so the nested `write_page` cannot self-deadlock.
#[derive(Debug)]
pub struct DiskManager {
    inner: Mutex<DiskInner>,
}

#[derive(Debug)]
struct DiskInner {
    file: DbFile,
    page_count: u32,
}

impl DiskManager {
    /// Take ownership of an open database file and load the page count from
    /// the header page.
    pub fn new(mut file: DbFile) -> DbResult<DiskManager> {
        let mut header = [0u8; PAGE_SIZE];
        let stream = file.stream()?;
        stream.seek(SeekFrom::Start(0))?;
        stream.read_exact(&mut header)?;

        let page_count = u32::from_le_bytes(
            header[..4]
                .try_into()
                .expect("header page shorter than four bytes"),
        );
        if page_count == 0 {
            return Err(DbError::Corrupted(
                "header page records zero pages".into(),
            ));
        }

        Ok(DiskManager {
            inner: Mutex::new(DiskInner { file, page_count }),
        })
    }

    /// Read page `page_id` into `buf` (`PAGE_SIZE` bytes).
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> DbResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut inner = self.lock();
        inner.check_range(page_id)?;
        let stream = inner.file.stream()?;
        stream.seek(SeekFrom::Start(page_id.file_offset()))?;
        stream.read_exact(&mut buf[..PAGE_SIZE])?;
        Ok(())
    }

    /// Write `buf` (`PAGE_SIZE` bytes) as page `page_id`.
    ///
    /// Bytes reach the OS immediately but are only forced to stable storage
    /// by [`DiskManager::flush`] or on close.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> DbResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut inner = self.lock();
        inner.check_range(page_id)?;
        let stream = inner.file.stream()?;
        stream.seek(SeekFrom::Start(page_id.file_offset()))?;
        stream.write_all(&buf[..PAGE_SIZE])?;
        Ok(())
    }

    /// Extend the file by one zero-filled page and return its id.
    pub fn allocate_page(&self) -> DbResult<PageId> {
        let new_id = {
            let mut inner = self.lock();
            let id = PageId(inner.page_count);
            inner.page_count += 1;
            id
        };

        // Zero-fill outside the lock; write_page re-acquires it.
        let zeros = [0u8; PAGE_SIZE];
        if let Err(e) = self.write_page(new_id, &zeros) {
            self.lock().page_count -= 1;
            return Err(e);
        }

        self.lock().write_header()?;
        Ok(new_id)
    }

    /// Shrink the page count.
    ///
    /// Freed pages are not recycled: deallocating anything but the most
    /// recently allocated page leaves a hole the allocator will hand out
    /// again, so it is logged and otherwise tolerated.
    pub fn deallocate_page(&self, page_id: PageId) -> DbResult<()> {
        let mut inner = self.lock();
        inner.check_range(page_id)?;
        if page_id.0 != inner.page_count - 1 {
            warn!("deallocating non-tail page {page_id}; free-list reuse is not implemented");
        }
        inner.page_count -= 1;
        inner.write_header()
    }

    /// Force OS-level write-back of the whole file.
    pub fn flush(&self) -> DbResult<()> {
        let mut inner = self.lock();
        inner.file.stream()?.sync_all()?;
        Ok(())
    }

    /// Number of pages in the file, header page included.
    pub fn page_count(&self) -> u32 {
        self.lock().page_count
    }

    fn lock(&self) -> MutexGuard<'_, DiskInner> {
        self.inner.lock().expect("disk state lock poisoned")
    }
}

impl DiskInner {
    fn check_range(&self, page_id: PageId) -> DbResult<()> {
        if !page_id.is_valid() || page_id.0 >= self.page_count {
            return Err(DbError::OutOfRange {
                what: "page",
                index: page_id.0 as u64,
                limit: self.page_count as u64,
            });
        }
        Ok(())
    }

    fn write_header(&mut self) -> DbResult<()> {
        let mut header = [0u8; PAGE_SIZE];
        header[..4].copy_from_slice(&self.page_count.to_le_bytes());
        let stream = self.file.stream()?;
        stream.seek(SeekFrom::Start(0))?;
        stream.write_all(&header)?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut()
            && inner.file.is_open()
        {
            if let Err(e) = inner.write_header() {
                warn!("failed to write header page on shutdown: {e}");
            }
            if let Err(e) = inner.file.close() {
                warn!("failed to close database file: {e}");
            }
        }
    }
}
