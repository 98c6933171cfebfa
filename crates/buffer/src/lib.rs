//! Buffer pool: a bounded in-memory cache of pages with pin counts, dirty
//! tracking, and LRU replacement.
//!
//! Pages are leased, never owned. [`BufferManager::fetch`] pins a page and
//! hands back a [`PageRef`]; the caller must pair every fetch/pin with an
//! `unpin`, passing `dirty = true` if it mutated the page. A pinned frame
//! is never evicted; when the pool is full and every frame is pinned,
//! `fetch` fails with `PoolFull`.
//!
//! # Example
//!
//! ```no_run
//! use buffer::Pager;
//! use common::Config;
//!
//! let config = Config::builder().db_path("/tmp/example.db".into()).build();
//! let pager = Pager::create(&config).unwrap();
//!
//! let page_id = pager.allocate().unwrap();
//! let page_ref = pager.get(page_id).unwrap();
//! let rid = {
//!     let mut page = page_ref.write().unwrap();
//!     page.insert_record(b"hello").unwrap()
//! };
//! pager.release(page_id, true).unwrap();
//! pager.flush_all().unwrap();
//! ```

mod pager;


pub use pager::Pager;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use common::{DbError, DbResult, PAGE_SIZE, PageId};
use log::debug;
use lru::LruCache;
use storage::{DiskManager, Page, PageType};

/// A leased page. Clones share the same frame; the lease ends when the
/// caller unpins the page id, after dropping any outstanding lock guards.
pub type PageRef = Arc<RwLock<Page>>;

/// Which frame a miss evicts once the pool is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplacementPolicy {
    /// Least recently *used*: hits and re-pins refresh a frame.
    Lru,
    /// First in, first out: only (re)loading a page refreshes its frame.
    Fifo,
}

/// One pool frame: the page lease plus runtime bookkeeping.
///
/// The dirty flag lives here, not in the page, so `unpin` never has to
/// take the page lock. The page's own header bit is advisory.
#[derive(Debug)]
struct Frame {
    page: PageRef,
    pin_count: u32,
    dirty: bool,
}

#[derive(Debug)]
struct PoolInner {
    /// Unbounded on purpose: capacity is enforced by hand so that a pinned
    /// frame can never be auto-evicted by the cache itself.
    frames: LruCache<PageId, Frame>,
    policy: ReplacementPolicy,
    hits: u64,
    misses: u64,
}

/// Fixed-capacity page cache over a [`DiskManager`].
///
/// One pool-wide reader/writer lock guards the frame table; operations
/// that can evict or touch pin counts take it exclusively. Page bytes are
/// protected only by the caller's pin contract.
#[derive(Debug)]
pub struct BufferManager {
    disk: Arc<DiskManager>,
    pool_size: usize,
    inner: RwLock<PoolInner>,
}

impl BufferManager {
    /// An LRU pool; see [`BufferManager::with_policy`].
    pub fn new(disk: Arc<DiskManager>, pool_size: usize) -> BufferManager {
        Self::with_policy(disk, pool_size, ReplacementPolicy::Lru)
    }

    /// # Panics
    ///
    /// Panics if `pool_size` is 0.
    pub fn with_policy(
        disk: Arc<DiskManager>,
        pool_size: usize,
        policy: ReplacementPolicy,
    ) -> BufferManager {
        assert!(pool_size > 0, "pool_size must be > 0");
        BufferManager {
            disk,
            pool_size,
            inner: RwLock::new(PoolInner {
                frames: LruCache::unbounded(),
                policy,
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn policy(&self) -> ReplacementPolicy {
        self.read_lock().policy
    }

    /// Switch the replacement policy; takes effect on subsequent accesses.
    pub fn set_policy(&self, policy: ReplacementPolicy) {
        self.write_lock().policy = policy;
    }

    /// Return a pinned lease on `page_id`, loading from disk on a miss.
    ///
    /// A miss may evict the least recently used unpinned frame, writing it
    /// back first if dirty. If every frame is pinned, fails with
    /// `PoolFull`. Pages whose on-disk header is self-inconsistent (e.g. a
    /// freshly allocated zero-filled page) are reinitialized as empty data
    /// pages under the requested id and marked dirty so the repair
    /// propagates.
    pub fn fetch(&self, page_id: PageId) -> DbResult<PageRef> {
        let mut inner = self.write_lock();

        if inner.frames.contains(&page_id) {
            inner.hits += 1;
            let frame = touch(&mut inner, page_id).expect("resident frame vanished");
            frame.pin_count += 1;
            return Ok(Arc::clone(&frame.page));
        }

        inner.misses += 1;
        let mut image = vec![0u8; PAGE_SIZE];
        self.disk.read_page(page_id, &mut image)?;

        let mut page = Page::deserialize(&image);
        let mut repaired = false;
        if page.page_id() != page_id || !page.is_consistent() {
            debug!("page {page_id} failed header validation, reinitializing");
            page = Page::new(page_id, PageType::Data);
            repaired = true;
        }

        if inner.frames.len() >= self.pool_size {
            self.evict_one(&mut inner)?;
        }

        let frame = Frame {
            page: Arc::new(RwLock::new(page)),
            pin_count: 1,
            dirty: repaired,
        };
        let page_ref = Arc::clone(&frame.page);
        inner.frames.push(page_id, frame);
        Ok(page_ref)
    }

    /// Increment the pin count of a resident page; under LRU this also
    /// marks it recently used. `NotInPool` if the page is not resident.
    pub fn pin(&self, page_id: PageId) -> DbResult<()> {
        let mut inner = self.write_lock();
        let frame = touch(&mut inner, page_id).ok_or(DbError::NotInPool(page_id))?;
        frame.pin_count += 1;
        Ok(())
    }

    /// Decrement the pin count, folding `dirty` into the frame's flag.
    ///
    /// Requires an outstanding pin; callers must have dropped their lock
    /// guards on the page first.
    pub fn unpin(&self, page_id: PageId, dirty: bool) -> DbResult<()> {
        let mut inner = self.write_lock();
        let frame = inner
            .frames
            .peek_mut(&page_id)
            .ok_or(DbError::NotInPool(page_id))?;
        if frame.pin_count == 0 {
            return Err(DbError::NotPinned(page_id));
        }
        frame.pin_count -= 1;
        frame.dirty |= dirty;
        Ok(())
    }

    /// Write the page back if dirty and clear the flag.
    pub fn flush(&self, page_id: PageId) -> DbResult<()> {
        let mut inner = self.write_lock();
        let frame = inner
            .frames
            .peek_mut(&page_id)
            .ok_or(DbError::NotInPool(page_id))?;
        if frame.dirty {
            write_back(&self.disk, page_id, frame)?;
            frame.dirty = false;
        }
        Ok(())
    }

    /// Flush every dirty frame.
    pub fn flush_all(&self) -> DbResult<()> {
        let mut inner = self.write_lock();
        for (page_id, frame) in inner.frames.iter_mut() {
            if frame.dirty {
                write_back(&self.disk, *page_id, frame)?;
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// Evict a specific page, writing it back if dirty. Fails with
    /// `Pinned` while any lease is outstanding.
    pub fn remove(&self, page_id: PageId) -> DbResult<()> {
        let mut inner = self.write_lock();
        let frame = inner
            .frames
            .peek(&page_id)
            .ok_or(DbError::NotInPool(page_id))?;
        if frame.pin_count > 0 {
            return Err(DbError::Pinned(page_id));
        }
        if frame.dirty {
            write_back(&self.disk, page_id, frame)?;
        }
        inner.frames.pop(&page_id);
        Ok(())
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.read_lock().frames.contains(&page_id)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of resident frames.
    pub fn len(&self) -> usize {
        self.read_lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_count(&self) -> u64 {
        self.read_lock().hits
    }

    pub fn miss_count(&self) -> u64 {
        self.read_lock().misses
    }

    pub fn hit_rate(&self) -> f64 {
        let inner = self.read_lock();
        let total = inner.hits + inner.misses;
        if total == 0 {
            0.0
        } else {
            inner.hits as f64 / total as f64
        }
    }

    /// Drop the least recently used unpinned frame, writing it back first
    /// if dirty. `PoolFull` when every frame is pinned.
    fn evict_one(&self, inner: &mut PoolInner) -> DbResult<()> {
        let victim = inner
            .frames
            .iter()
            .rev()
            .find(|(_, frame)| frame.pin_count == 0)
            .map(|(page_id, _)| *page_id)
            .ok_or(DbError::PoolFull)?;

        let frame = inner
            .frames
            .peek(&victim)
            .expect("victim frame vanished");
        if frame.dirty {
            write_back(&self.disk, victim, frame)?;
        }
        inner.frames.pop(&victim);
        debug!("evicted page {victim}");
        Ok(())
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, PoolInner> {
        self.inner.write().expect("buffer pool lock poisoned")
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, PoolInner> {
        self.inner.read().expect("buffer pool lock poisoned")
    }
}

/// Look up a resident frame, refreshing its position in the replacement
/// order only when the policy says an access counts (LRU, not FIFO).
fn touch(inner: &mut PoolInner, page_id: PageId) -> Option<&mut Frame> {
    match inner.policy {
        ReplacementPolicy::Lru => inner.frames.get_mut(&page_id),
        ReplacementPolicy::Fifo => inner.frames.peek_mut(&page_id),
    }
}

fn write_back(disk: &DiskManager, page_id: PageId, frame: &Frame) -> DbResult<()> {
    let page = frame.page.read().expect("page latch poisoned");
    let mut image = vec![0u8; PAGE_SIZE];
    page.serialize(&mut image);
    disk.write_page(page_id, &image)
}
