use std::sync::{Arc, Mutex, MutexGuard};

use common::{Config, DbError, DbResult, PageId};
use hashbrown::HashSet;
use log::debug;
use storage::{DbFile, DiskManager};

use crate::{BufferManager, PageRef};

/// Thin coordinator over [`DiskManager`] and [`BufferManager`]: allocates
/// pages, tracks which ids are live, and forwards fetch/pin/flush traffic.
///
/// A single mutex serializes mutation of the live-page set and its
/// ordering with the disk layer.
#[derive(Debug)]
pub struct Pager {
    disk: Arc<DiskManager>,
    buffer: Arc<BufferManager>,
    live: Mutex<HashSet<PageId>>,
}

impl Pager {
    /// Wire up an existing disk and buffer pair.
    ///
    /// Every non-header page already in the file is seeded as live, so a
    /// reopened database can serve the pages it persisted.
    pub fn new(disk: Arc<DiskManager>, buffer: Arc<BufferManager>) -> Pager {
        let live = (1..disk.page_count()).map(PageId).collect();
        Pager {
            disk,
            buffer,
            live: Mutex::new(live),
        }
    }

    /// Create a fresh database file and assemble the full storage stack.
    pub fn create(config: &Config) -> DbResult<Pager> {
        Self::assemble(DbFile::create(&config.db_path)?, config.pool_size)
    }

    /// Open an existing database file and assemble the full storage stack.
    pub fn open(config: &Config) -> DbResult<Pager> {
        Self::assemble(DbFile::open(&config.db_path)?, config.pool_size)
    }

    fn assemble(file: DbFile, pool_size: usize) -> DbResult<Pager> {
        let disk = Arc::new(DiskManager::new(file)?);
        let buffer = Arc::new(BufferManager::new(Arc::clone(&disk), pool_size));
        Ok(Pager::new(disk, buffer))
    }

    /// The underlying buffer pool, for statistics and direct cache control.
    pub fn buffer(&self) -> &BufferManager {
        &self.buffer
    }

    /// Allocate a new page on disk and record it as live.
    pub fn allocate(&self) -> DbResult<PageId> {
        let page_id = self.disk.allocate_page()?;
        self.live_set().insert(page_id);
        Ok(page_id)
    }

    /// Release a page: evict it from the pool if resident, then return it
    /// to the disk layer and drop it from the live set.
    ///
    /// Tolerates pages that were never brought into memory and ids that
    /// are not live (a no-op); refuses pages that are still pinned.
    pub fn deallocate(&self, page_id: PageId) -> DbResult<()> {
        if !self.is_valid(page_id) {
            return Ok(());
        }
        match self.buffer.remove(page_id) {
            Ok(()) => {}
            Err(DbError::NotInPool(_)) => {
                debug!("page {page_id} not resident during deallocation");
            }
            Err(e) => return Err(e),
        }
        self.disk.deallocate_page(page_id)?;
        self.live_set().remove(&page_id);
        Ok(())
    }

    /// Fetch a pinned lease on a live page.
    pub fn get(&self, page_id: PageId) -> DbResult<PageRef> {
        self.check_valid(page_id)?;
        self.buffer.fetch(page_id)
    }

    pub fn pin(&self, page_id: PageId) -> DbResult<()> {
        self.check_valid(page_id)?;
        self.buffer.pin(page_id)
    }

    /// End one lease, marking the page dirty if the holder mutated it.
    pub fn release(&self, page_id: PageId, dirty: bool) -> DbResult<()> {
        self.check_valid(page_id)?;
        self.buffer.unpin(page_id, dirty)
    }

    pub fn flush(&self, page_id: PageId) -> DbResult<()> {
        self.check_valid(page_id)?;
        self.buffer.flush(page_id)
    }

    /// Write every dirty frame back and force the file to stable storage.
    pub fn flush_all(&self) -> DbResult<()> {
        self.buffer.flush_all()?;
        self.disk.flush()
    }

    /// Number of pages in the file, header page included.
    pub fn page_count(&self) -> u32 {
        self.disk.page_count()
    }

    /// A page id is valid when it is not the sentinel, lies below the page
    /// count, and belongs to the live set.
    pub fn is_valid(&self, page_id: PageId) -> bool {
        page_id.is_valid()
            && page_id.0 < self.disk.page_count()
            && self.live_set().contains(&page_id)
    }

    /// Whether this pager has the page in its live set.
    pub fn is_in_use(&self, page_id: PageId) -> bool {
        self.live_set().contains(&page_id)
    }

    fn check_valid(&self, page_id: PageId) -> DbResult<()> {
        if !self.is_valid(page_id) {
            return Err(DbError::OutOfRange {
                what: "page",
                index: page_id.0 as u64,
                limit: self.disk.page_count() as u64,
            });
        }
        Ok(())
    }

    fn live_set(&self) -> MutexGuard<'_, HashSet<PageId>> {
        self.live.lock().expect("pager live-set lock poisoned")
    }
}
