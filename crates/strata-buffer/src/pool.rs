//! Buffer pool manager.
//!
//! The pool mediates every page access: pages are fetched (pinned) into
//! fixed frames, mutated in memory, and unpinned with a dirty flag. Dirty
//! frames reach the data file only through [`BufferPool::write_back`], which
//! appends the page's after-image to the write-ahead log first when one is
//! attached. Replacement is LRU over unpinned frames.

use crate::frame::Frame;
use crate::lru::LruList;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strata_common::page::{PageBuf, PageId};
use strata_common::{Result, StrataError};
use strata_wal::WriteAheadLog;

/// Backing store interface the pool reads and writes pages through.
///
/// Implemented by the paged store; kept as a trait so the pool does not
/// depend on the storage crate.
pub trait PageIo {
    /// Copies the page at `page_id` into `buf`.
    fn read_page(&mut self, page_id: PageId, buf: &mut PageBuf) -> Result<()>;

    /// Copies `data` into the page at `page_id`.
    fn write_page(&mut self, page_id: PageId, data: &PageBuf) -> Result<()>;

    /// Allocates a fresh zeroed page and returns its id.
    fn allocate(&mut self) -> Result<PageId>;

    /// Flushes the store to stable storage.
    fn sync(&mut self) -> Result<()>;
}

/// An LRU buffer pool between the B+ tree and the paged store.
///
/// Pin semantics:
/// - `fetch` increments the pin count and returns the frame buffer.
/// - `unpin` decrements it; only frames with pin count 0 are eviction
///   candidates.
/// - Callers must unpin every page they fetch, on every exit path.
pub struct BufferPool<S> {
    store: S,
    frames: Vec<Frame>,
    /// Maps page id -> frame index.
    page_table: HashMap<PageId, usize>,
    /// Unpinned frames in recency order (front = victim).
    lru: LruList,
    /// Frames not currently holding any page.
    free_frames: Vec<usize>,
    /// Optional WAL; when attached, dirty write-backs log an after-image
    /// first.
    wal: Option<Arc<Mutex<WriteAheadLog>>>,
    hits: u64,
    misses: u64,
}

impl<S: PageIo> BufferPool<S> {
    /// Creates a pool with `pool_size` frames over `store`.
    pub fn new(store: S, pool_size: usize) -> Self {
        assert!(pool_size > 0, "buffer pool needs at least one frame");

        let frames: Vec<Frame> = (0..pool_size).map(|_| Frame::new()).collect();
        // Reverse order so frame 0 is handed out first.
        let free_frames: Vec<usize> = (0..pool_size).rev().collect();

        Self {
            store,
            frames,
            page_table: HashMap::with_capacity(pool_size),
            lru: LruList::new(pool_size),
            free_frames,
            wal: None,
            hits: 0,
            misses: 0,
        }
    }

    /// Attaches a WAL; subsequent dirty write-backs are logged first.
    pub fn attach_wal(&mut self, wal: Arc<Mutex<WriteAheadLog>>) {
        self.wal = Some(wal);
    }

    /// Returns the backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the backing store mutably.
    ///
    /// Intended for metadata-page access and page freeing; cached tree pages
    /// must keep going through the pool.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Fetches the page at `page_id` into the pool and pins it.
    ///
    /// On a miss the page is read from the store, evicting the LRU unpinned
    /// frame if no free frame remains (its content is logged and written back
    /// first when dirty). Fails with `PoolExhausted` when every frame is
    /// pinned.
    pub fn fetch(&mut self, page_id: PageId) -> Result<&mut PageBuf> {
        if let Some(&idx) = self.page_table.get(&page_id) {
            self.hits += 1;
            // Pinned frames are not eviction candidates.
            self.lru.remove(idx);
            let frame = &mut self.frames[idx];
            frame.pin();
            return Ok(frame.data_mut());
        }

        self.misses += 1;
        let idx = self.take_frame()?;

        if let Err(e) = self.store.read_page(page_id, self.frames[idx].data_mut()) {
            self.free_frames.push(idx);
            return Err(e);
        }

        {
            let frame = &mut self.frames[idx];
            frame.set_page_id(page_id);
            frame.pin();
            frame.set_dirty(false);
        }
        self.page_table.insert(page_id, idx);
        Ok(self.frames[idx].data_mut())
    }

    /// Decrements the pin count for `page_id`, OR-ing in the dirty flag.
    ///
    /// When the pin count reaches zero the frame rejoins the LRU list at the
    /// MRU end. Fails with `PageNotCached` if the page is not resident or is
    /// not pinned.
    pub fn unpin(&mut self, page_id: PageId, dirty: bool) -> Result<()> {
        let Some(&idx) = self.page_table.get(&page_id) else {
            return Err(StrataError::PageNotCached { page_id });
        };

        let frame = &mut self.frames[idx];
        if frame.pin_count() == 0 {
            return Err(StrataError::PageNotCached { page_id });
        }

        if dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.lru.push_back(idx);
        }
        Ok(())
    }

    /// Writes a dirty page back to the store without evicting it.
    ///
    /// Returns true if the page was written, false if it was clean or not
    /// resident.
    pub fn flush_page(&mut self, page_id: PageId) -> Result<bool> {
        let Some(&idx) = self.page_table.get(&page_id) else {
            return Ok(false);
        };
        if !self.frames[idx].is_dirty() {
            return Ok(false);
        }
        self.write_back(idx)?;
        Ok(true)
    }

    /// Writes every dirty resident page back, then syncs the store.
    pub fn flush_all(&mut self) -> Result<()> {
        let indices: Vec<usize> = self.page_table.values().copied().collect();
        for idx in indices {
            self.write_back(idx)?;
        }
        self.store.sync()
    }

    /// Allocates a new page via the store and installs it pinned and dirty.
    ///
    /// The returned buffer is zeroed.
    pub fn new_page(&mut self) -> Result<(PageId, &mut PageBuf)> {
        let page_id = self.store.allocate()?;
        let idx = self.take_frame()?;
        debug_assert!(
            !self.page_table.contains_key(&page_id),
            "allocated page {page_id} already resident"
        );

        {
            let frame = &mut self.frames[idx];
            frame.set_page_id(page_id);
            frame.pin();
            frame.set_dirty(true);
        }
        self.page_table.insert(page_id, idx);
        Ok((page_id, self.frames[idx].data_mut()))
    }

    /// Removes a page from the pool without flushing it (for pages being
    /// freed). Fails if the page is still pinned; absent pages are a no-op.
    pub fn drop_page(&mut self, page_id: PageId) -> Result<()> {
        let Some(&idx) = self.page_table.get(&page_id) else {
            return Ok(());
        };
        if self.frames[idx].is_pinned() {
            return Err(StrataError::PagePinned { page_id });
        }

        self.page_table.remove(&page_id);
        self.lru.remove(idx);
        self.frames[idx].reset();
        self.free_frames.push(idx);
        Ok(())
    }

    // -- Statistics ----------------------------------------------------------

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn pages_in_use(&self) -> usize {
        self.page_table.len()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    // -- Internals -----------------------------------------------------------

    /// Obtains an empty frame: from the free stack, or by evicting the LRU
    /// unpinned frame.
    fn take_frame(&mut self) -> Result<usize> {
        if let Some(idx) = self.free_frames.pop() {
            return Ok(idx);
        }

        let victim = self.lru.pop_front().ok_or(StrataError::PoolExhausted)?;
        debug_assert!(!self.frames[victim].is_pinned());

        self.write_back(victim)?;
        let old_id = self.frames[victim].page_id();
        if old_id.is_valid() {
            self.page_table.remove(&old_id);
        }
        self.frames[victim].reset();
        Ok(victim)
    }

    /// Copies a dirty frame to the store and marks it clean, appending the
    /// page's after-image to the WAL first when one is attached.
    fn write_back(&mut self, idx: usize) -> Result<()> {
        if !self.frames[idx].is_dirty() {
            return Ok(());
        }
        let page_id = self.frames[idx].page_id();
        if !page_id.is_valid() {
            return Ok(());
        }

        if let Some(wal) = &self.wal {
            wal.lock().log_page_write(page_id, self.frames[idx].data())?;
        }
        self.store.write_page(page_id, self.frames[idx].data())?;
        self.frames[idx].set_dirty(false);
        Ok(())
    }
}
