//! Paged store: a memory-mapped data file of fixed-size pages.
//!
//! Responsibilities:
//! - Open / create the backing file
//! - Grow (set_len + remap) as needed
//! - Allocate new zeroed pages, recycling freed pages first
//! - Expose bounds-checked views into the mapped region
//! - Persist the metadata page and sync the whole region
//!
//! Growing the file replaces the mapping, so any view into it is invalidated;
//! views are handed out as short-lived borrows of the store, which makes
//! holding one across an allocation impossible. Cached tree pages go through
//! the buffer pool, whose frame buffers are unaffected by remapping.

use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use strata_buffer::PageIo;
use strata_common::page::{
    read_meta_field, write_meta_field, PageBuf, PageId, FREE_PAGE_NEXT, META_FREE_LIST_HEAD,
    META_NEXT_PAGE, META_ROOT_OFFSET, PAGE_SIZE,
};
use strata_common::{Result, StrataError};
use strata_wal::RedoTarget;
use tracing::debug;

/// Minimum growth increment (1 MiB) to avoid frequent truncate/remap cycles
/// during bulk inserts.
const MIN_GROW_BYTES: u64 = 1 << 20;

/// A single data file managed as a sequence of 4096-byte pages.
///
/// Page 0 is the metadata page: root offset, next-unallocated offset, and
/// free-list head. Freed pages form a singly-linked stack threaded through
/// their first 8 bytes.
pub struct PagedStore {
    path: PathBuf,
    file: File,
    map: MmapMut,
    file_size: u64,
}

impl PagedStore {
    /// Opens (or creates) the data file at `path`.
    ///
    /// A fresh file is truncated to one page and given default metadata:
    /// no root, next-unallocated = 4096, empty free list.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut file_size = file.metadata()?.len();
        let fresh = file_size == 0;
        if fresh {
            file.set_len(PAGE_SIZE as u64)?;
            file_size = PAGE_SIZE as u64;
        }

        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        let mut store = Self {
            path,
            file,
            map,
            file_size,
        };

        if fresh {
            store.set_root_offset(PageId::INVALID);
            store.set_next_page_offset(PAGE_SIZE as i64);
            store.set_free_list_head(PageId::INVALID);
            store.flush_metadata()?;
        }

        debug!(path = %store.path.display(), size = store.file_size, "store opened");
        Ok(store)
    }

    /// Returns the path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current size of the backing file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Returns a mutable view of the page at byte `offset`.
    pub fn page(&mut self, offset: i64) -> Result<&mut [u8]> {
        self.check_range(offset)?;
        let off = offset as usize;
        Ok(&mut self.map[off..off + PAGE_SIZE])
    }

    /// Returns a read-only view of the page at byte `offset`.
    pub fn page_ref(&self, offset: i64) -> Result<&[u8]> {
        self.check_range(offset)?;
        let off = offset as usize;
        Ok(&self.map[off..off + PAGE_SIZE])
    }

    fn check_range(&self, offset: i64) -> Result<()> {
        if offset < 0 || offset as u64 + PAGE_SIZE as u64 > self.file_size {
            return Err(StrataError::PageOutOfRange {
                offset,
                file_size: self.file_size,
            });
        }
        Ok(())
    }

    /// Allocates a fresh zeroed page and returns its id.
    ///
    /// Recycles the head of the free list when one exists; otherwise takes
    /// the next-unallocated offset, growing the file if needed.
    pub fn allocate(&mut self) -> Result<PageId> {
        let free_head = self.free_list_head();
        if free_head.is_valid() {
            let next_free = {
                let page = self.page(free_head.0)?;
                PageId(read_meta_field(page, FREE_PAGE_NEXT))
            };
            self.page(free_head.0)?.fill(0);
            self.set_free_list_head(next_free);
            return Ok(free_head);
        }

        let next = self.next_page_offset();
        let new_next = next + PAGE_SIZE as i64;
        self.ensure_capacity(new_next as u64)?;
        self.page(next)?.fill(0);
        self.set_next_page_offset(new_next);
        Ok(PageId(next))
    }

    /// Pushes `page_id` onto the free-list stack.
    ///
    /// The prior head is written into the page's first 8 bytes. The metadata
    /// page can never be freed.
    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        if page_id.0 < PAGE_SIZE as i64 {
            return Err(StrataError::InvalidArgument(format!(
                "cannot free page {page_id}"
            )));
        }
        self.check_range(page_id.0)?;

        let head = self.free_list_head();
        {
            let page = self.page(page_id.0)?;
            write_meta_field(page, FREE_PAGE_NEXT, head.0);
        }
        self.set_free_list_head(page_id);
        Ok(())
    }

    // -- Metadata helpers (page 0) -------------------------------------------

    pub fn root_offset(&self) -> PageId {
        PageId(read_meta_field(&self.map, META_ROOT_OFFSET))
    }

    pub fn set_root_offset(&mut self, root: PageId) {
        write_meta_field(&mut self.map, META_ROOT_OFFSET, root.0);
    }

    pub fn next_page_offset(&self) -> i64 {
        read_meta_field(&self.map, META_NEXT_PAGE)
    }

    pub fn set_next_page_offset(&mut self, offset: i64) {
        write_meta_field(&mut self.map, META_NEXT_PAGE, offset);
    }

    pub fn free_list_head(&self) -> PageId {
        PageId(read_meta_field(&self.map, META_FREE_LIST_HEAD))
    }

    pub fn set_free_list_head(&mut self, head: PageId) {
        write_meta_field(&mut self.map, META_FREE_LIST_HEAD, head.0);
    }

    /// Synchronously persists the metadata page only.
    pub fn flush_metadata(&self) -> Result<()> {
        self.map.flush_range(0, PAGE_SIZE)?;
        Ok(())
    }

    // -- Synchronisation -----------------------------------------------------

    /// Synchronously flushes the entire mapped region.
    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Schedules a best-effort flush of the mapped region.
    pub fn sync_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }

    // -- Internal ------------------------------------------------------------

    /// Ensures the mapped region covers at least `required` bytes.
    ///
    /// Grows to `max(required, 2 * current, 1 MiB)` rounded up to page size
    /// and remaps.
    fn ensure_capacity(&mut self, required: u64) -> Result<()> {
        if required <= self.file_size {
            return Ok(());
        }

        let page = PAGE_SIZE as u64;
        let min_size = required.div_ceil(page) * page;
        let new_size = min_size.max((self.file_size * 2).max(MIN_GROW_BYTES));
        let new_size = new_size.div_ceil(page) * page;

        self.map.flush_async()?;
        self.file.set_len(new_size)?;
        self.map = unsafe { MmapOptions::new().map_mut(&self.file)? };
        self.file_size = new_size;

        debug!(path = %self.path.display(), new_size, "store grown");
        Ok(())
    }
}

impl PageIo for PagedStore {
    fn read_page(&mut self, page_id: PageId, buf: &mut PageBuf) -> Result<()> {
        let page = self.page_ref(page_id.0)?;
        buf.copy_from_slice(page);
        Ok(())
    }

    fn write_page(&mut self, page_id: PageId, data: &PageBuf) -> Result<()> {
        let page = self.page(page_id.0)?;
        page.copy_from_slice(data);
        Ok(())
    }

    fn allocate(&mut self) -> Result<PageId> {
        PagedStore::allocate(self)
    }

    fn sync(&mut self) -> Result<()> {
        PagedStore::sync(self)
    }
}

impl RedoTarget for PagedStore {
    fn apply_page_image(&mut self, page_id: PageId, image: &[u8]) -> Result<()> {
        if image.len() != PAGE_SIZE {
            return Err(StrataError::InvalidArgument(format!(
                "page image has {} bytes",
                image.len()
            )));
        }

        // The data file may not have grown before the crash; the log has the
        // truth, so extend allocation to cover the replayed page.
        let end = page_id.0 + PAGE_SIZE as i64;
        self.ensure_capacity(end as u64)?;
        if self.next_page_offset() < end {
            self.set_next_page_offset(end);
        }

        let page = self.page(page_id.0)?;
        page.copy_from_slice(image);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        PagedStore::sync(self)
    }
}

impl std::fmt::Debug for PagedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedStore")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("root", &self.root_offset())
            .field("next_page", &self.next_page_offset())
            .field("free_head", &self.free_list_head())
            .finish()
    }
}
