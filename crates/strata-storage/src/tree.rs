//! Persistent B+ tree over the buffer pool.
//!
//! Keys are i32, payloads are fixed 100-byte records. Every page access goes
//! through the buffer pool with a pin/unpin pair on each exit path; the pool
//! writes after-images to the WAL before any dirty page reaches the data
//! file, which makes recovery a pure redo pass.
//!
//! Deletes rebalance: an underful node first tries to borrow a record from a
//! sibling (left first), and merges with one otherwise (always into the left
//! of the pair). The root shrinks when it empties.

use crate::store::PagedStore;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use strata_buffer::BufferPool;
use strata_common::config::EngineConfig;
use strata_common::page::{
    page_is_leaf, read_meta_field, InternalPage, LeafPage, PageId, FREE_PAGE_NEXT,
    INTERNAL_MAX_KEYS, INTERNAL_MIN_KEYS, LEAF_MAX_KEYS, LEAF_MIN_KEYS, PAGE_SIZE,
};
use strata_common::{Key, Payload, Result, StrataError};
use strata_wal::WriteAheadLog;
use tracing::{debug, warn};

/// A persistent, disk-backed B+ tree index.
///
/// Supports integer keys and fixed-size 100-byte payloads. Data survives
/// restarts; with the WAL enabled it also survives crashes.
///
/// Not thread-safe: a single logical writer at a time, with external
/// serialization for anything more.
///
/// # Example
/// ```no_run
/// use strata_storage::{BPlusTree, EngineConfig};
///
/// let mut tree = BPlusTree::open("my_index.idx", EngineConfig::default()).unwrap();
/// tree.insert(42, b"hello world").unwrap();
/// let value = tree.search(42).unwrap();
/// assert_eq!(value.as_trimmed(), b"hello world");
/// ```
pub struct BPlusTree {
    pool: BufferPool<PagedStore>,
    wal: Option<Arc<Mutex<WriteAheadLog>>>,
    root: PageId,
}

impl BPlusTree {
    /// Opens (or creates) a B+ tree backed by the file at `path`.
    ///
    /// When the WAL is enabled, pending page writes are replayed into the
    /// store before the tree is loaded; the log lives next to the data file
    /// at `path` + ".wal". Metadata failing sanity checks refuses to open
    /// with `Corrupted`.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        let mut store = PagedStore::open(path)?;

        let wal = if config.enable_wal {
            let mut wal_path = path.as_os_str().to_os_string();
            wal_path.push(".wal");
            let mut wal = WriteAheadLog::open(wal_path)?;
            wal.recover(&mut store)?;
            Some(Arc::new(Mutex::new(wal)))
        } else {
            None
        };

        let root = Self::load_metadata(&store)?;

        let mut pool = BufferPool::new(store, config.pool_size);
        if let Some(wal) = &wal {
            pool.attach_wal(Arc::clone(wal));
        }

        debug!(path = %path.display(), root = %root, "tree opened");
        Ok(Self { pool, wal, root })
    }

    fn load_metadata(store: &PagedStore) -> Result<PageId> {
        let root = store.root_offset();
        let next = store.next_page_offset();
        let free = store.free_list_head();
        let page = PAGE_SIZE as i64;
        let file_size = store.file_size() as i64;

        if next < page || next % page != 0 {
            warn!(next, "rejecting index with invalid next-page offset");
            return Err(StrataError::Corrupted(format!(
                "next-page offset {next} is invalid"
            )));
        }
        if root.is_valid() && (!root.is_aligned() || root.0 + page > file_size) {
            warn!(root = %root, "rejecting index with invalid root offset");
            return Err(StrataError::Corrupted(format!(
                "root offset {root} outside the allocated file"
            )));
        }
        if free.is_valid() && (!free.is_aligned() || free.0 + page > file_size) {
            warn!(free = %free, "rejecting index with invalid free-list head");
            return Err(StrataError::Corrupted(format!(
                "free-list head {free} outside the allocated file"
            )));
        }

        Ok(root)
    }

    // -- Utilities -----------------------------------------------------------

    /// Returns true if the tree holds no records.
    pub fn is_empty(&self) -> bool {
        !self.root.is_valid()
    }

    /// Returns the path of the backing data file.
    pub fn file_path(&self) -> &Path {
        self.pool.store().path()
    }

    /// Flushes all dirty pages to the data file.
    pub fn sync(&mut self) -> Result<()> {
        self.pool.flush_all()
    }

    /// Forces a WAL checkpoint: flush all dirty pages, then truncate the log.
    ///
    /// A no-op when the WAL is disabled.
    pub fn checkpoint(&mut self) -> Result<()> {
        let Some(wal) = self.wal.clone() else {
            return Ok(());
        };
        wal.lock().begin_checkpoint()?;
        self.pool.flush_all()?;
        wal.lock().end_checkpoint()?;
        Ok(())
    }

    // -- Statistics ----------------------------------------------------------

    pub fn pool_hits(&self) -> u64 {
        self.pool.hits()
    }

    pub fn pool_misses(&self) -> u64 {
        self.pool.misses()
    }

    pub fn pool_hit_rate(&self) -> f64 {
        self.pool.hit_rate()
    }

    pub fn wal_enabled(&self) -> bool {
        self.wal.is_some()
    }

    pub fn wal_bytes_written(&self) -> u64 {
        self.wal.as_ref().map_or(0, |w| w.lock().bytes_written())
    }

    pub fn wal_records_written(&self) -> u64 {
        self.wal.as_ref().map_or(0, |w| w.lock().records_written())
    }

    // -- Search --------------------------------------------------------------

    /// Point lookup. Returns the stored 100-byte payload.
    pub fn search(&mut self, key: Key) -> Result<Payload> {
        if !self.root.is_valid() {
            return Err(StrataError::KeyNotFound);
        }

        let leaf_off = self.search_leaf(key)?;
        let page = self.pool.fetch(leaf_off)?;
        let found = {
            let leaf = LeafPage::new(page);
            let n = leaf.num_keys();
            let mut found = None;
            for i in 0..n {
                if leaf.key_at(i) == key {
                    found = Some(leaf.payload_at(i));
                    break;
                }
            }
            found
        };
        self.pool.unpin(leaf_off, false)?;

        found.ok_or(StrataError::KeyNotFound)
    }

    /// Descends from the root to the leaf that would contain `key`.
    fn search_leaf(&mut self, key: Key) -> Result<PageId> {
        let mut current = self.root;
        loop {
            let page = self.pool.fetch(current)?;
            if page_is_leaf(page) {
                self.pool.unpin(current, false)?;
                return Ok(current);
            }

            let child = {
                let node = InternalPage::new(page);
                let n = node.num_keys();
                let mut i = 0;
                while i < n && key >= node.key_at(i) {
                    i += 1;
                }
                node.child_at(i)
            };
            self.pool.unpin(current, false)?;

            if !child.is_aligned() {
                return Err(StrataError::Corrupted(format!(
                    "child pointer {child} is not a page"
                )));
            }
            current = child;
        }
    }

    // -- Range query ---------------------------------------------------------

    /// Returns all records with keys in `[lower, upper]` in ascending order.
    pub fn range_query(&mut self, lower: Key, upper: Key) -> Result<Vec<(Key, Payload)>> {
        if lower > upper {
            return Err(StrataError::InvalidArgument(format!(
                "range lower {lower} > upper {upper}"
            )));
        }

        let mut results = Vec::new();
        if !self.root.is_valid() {
            return Ok(results);
        }

        let mut leaf_off = self.search_leaf(lower)?;
        while leaf_off.is_valid() {
            let page = self.pool.fetch(leaf_off)?;
            let (done, next) = {
                let leaf = LeafPage::new(page);
                let n = leaf.num_keys();
                let mut done = false;
                for i in 0..n {
                    let k = leaf.key_at(i);
                    if k > upper {
                        done = true;
                        break;
                    }
                    if k >= lower {
                        results.push((k, leaf.payload_at(i)));
                    }
                }
                (done, leaf.next_leaf())
            };
            self.pool.unpin(leaf_off, false)?;

            if done {
                break;
            }
            leaf_off = next;
        }

        Ok(results)
    }

    // -- Insert --------------------------------------------------------------

    /// Inserts a key-value pair (upsert semantics).
    ///
    /// `data` shorter than 100 bytes is zero-padded; longer input is
    /// truncated.
    pub fn insert(&mut self, key: Key, data: &[u8]) -> Result<()> {
        let payload = Payload::from_bytes(data);

        // Empty tree: create the root leaf.
        if !self.root.is_valid() {
            let (off, page) = self.pool.new_page()?;
            LeafPage::init(page);
            let mut leaf = LeafPage::new(page);
            leaf.set_num_keys(1);
            leaf.set_record(0, key, &payload);
            self.pool.unpin(off, true)?;

            self.root = off;
            self.write_metadata()?;
            return Ok(());
        }

        if let Some((split_key, new_off)) = self.insert_recursive(self.root, key, &payload)? {
            // The root split: a new internal root holds the two halves.
            let old_root = self.root;
            let (new_root, page) = self.pool.new_page()?;
            InternalPage::init(page);
            let mut node = InternalPage::new(page);
            node.set_num_keys(1);
            node.set_key_at(0, split_key);
            node.set_child_at(0, old_root);
            node.set_child_at(1, new_off);
            self.pool.unpin(new_root, true)?;

            self.root = new_root;
            self.write_metadata()?;
        }

        Ok(())
    }

    /// Returns `Some((split_key, new_page))` when the node split.
    fn insert_recursive(
        &mut self,
        node_off: PageId,
        key: Key,
        payload: &Payload,
    ) -> Result<Option<(Key, PageId)>> {
        let page = self.pool.fetch(node_off)?;
        if page_is_leaf(page) {
            self.pool.unpin(node_off, false)?;
            return self.insert_into_leaf(node_off, key, payload);
        }

        let child = {
            let node = InternalPage::new(page);
            let n = node.num_keys();
            let mut i = 0;
            while i < n && key >= node.key_at(i) {
                i += 1;
            }
            node.child_at(i)
        };
        self.pool.unpin(node_off, false)?;

        match self.insert_recursive(child, key, payload)? {
            None => Ok(None),
            Some((child_split, child_new)) => {
                self.insert_into_internal(node_off, child_split, child_new)
            }
        }
    }

    fn insert_into_leaf(
        &mut self,
        leaf_off: PageId,
        key: Key,
        payload: &Payload,
    ) -> Result<Option<(Key, PageId)>> {
        let page = self.pool.fetch(leaf_off)?;
        let mut leaf = LeafPage::new(page);
        let n = leaf.num_keys();

        // Existing key: overwrite in place.
        for i in 0..n {
            if leaf.key_at(i) == key {
                leaf.set_payload_at(i, payload);
                self.pool.unpin(leaf_off, true)?;
                return Ok(None);
            }
        }

        // Room available: shift the tail right, place in sorted position.
        if n < LEAF_MAX_KEYS {
            let mut i = n;
            while i > 0 && leaf.key_at(i - 1) > key {
                let (k, p) = leaf.record_at(i - 1);
                leaf.set_record(i, k, &p);
                i -= 1;
            }
            leaf.set_record(i, key, payload);
            leaf.set_num_keys(n + 1);
            self.pool.unpin(leaf_off, true)?;
            return Ok(None);
        }

        // Full: gather all records plus the new one in sorted order.
        let mut records: Vec<(Key, Payload)> = (0..n).map(|i| leaf.record_at(i)).collect();
        let old_next = leaf.next_leaf();
        self.pool.unpin(leaf_off, false)?;

        let pos = records.partition_point(|(k, _)| *k < key);
        records.insert(pos, (key, *payload));

        let mid = records.len().div_ceil(2);

        // The new leaf takes the upper half and slots into the chain.
        let (new_leaf_off, new_page) = self.pool.new_page()?;
        LeafPage::init(new_page);
        {
            let mut new_leaf = LeafPage::new(new_page);
            new_leaf.set_num_keys(records.len() - mid);
            for (j, (k, p)) in records[mid..].iter().enumerate() {
                new_leaf.set_record(j, *k, p);
            }
            new_leaf.set_next_leaf(old_next);
        }
        self.pool.unpin(new_leaf_off, true)?;

        let page = self.pool.fetch(leaf_off)?;
        {
            let mut leaf = LeafPage::new(page);
            leaf.set_num_keys(mid);
            for (j, (k, p)) in records[..mid].iter().enumerate() {
                leaf.set_record(j, *k, p);
            }
            leaf.set_next_leaf(new_leaf_off);
        }
        self.pool.unpin(leaf_off, true)?;

        Ok(Some((records[mid].0, new_leaf_off)))
    }

    fn insert_into_internal(
        &mut self,
        node_off: PageId,
        key: Key,
        child_off: PageId,
    ) -> Result<Option<(Key, PageId)>> {
        let page = self.pool.fetch(node_off)?;
        let mut node = InternalPage::new(page);
        let n = node.num_keys();

        // Room available: insert (key, child) at the sorted position.
        if n < INTERNAL_MAX_KEYS {
            let mut i = n;
            while i > 0 && node.key_at(i - 1) > key {
                node.set_key_at(i, node.key_at(i - 1));
                node.set_child_at(i + 1, node.child_at(i));
                i -= 1;
            }
            node.set_key_at(i, key);
            node.set_child_at(i + 1, child_off);
            node.set_num_keys(n + 1);
            self.pool.unpin(node_off, true)?;
            return Ok(None);
        }

        // Full: gather keys and children with the new pair inserted.
        let mut keys: Vec<Key> = (0..n).map(|i| node.key_at(i)).collect();
        let mut children: Vec<PageId> = (0..=n).map(|i| node.child_at(i)).collect();
        self.pool.unpin(node_off, false)?;

        let pos = keys.partition_point(|k| *k < key);
        keys.insert(pos, key);
        children.insert(pos + 1, child_off);

        // The middle key is promoted, not kept in either half.
        let mid = keys.len() / 2;
        let split_key = keys[mid];

        let (new_off, new_page) = self.pool.new_page()?;
        InternalPage::init(new_page);
        {
            let mut new_node = InternalPage::new(new_page);
            new_node.set_num_keys(keys.len() - mid - 1);
            for j in (mid + 1)..keys.len() {
                new_node.set_key_at(j - mid - 1, keys[j]);
            }
            for j in (mid + 1)..children.len() {
                new_node.set_child_at(j - mid - 1, children[j]);
            }
        }
        self.pool.unpin(new_off, true)?;

        let page = self.pool.fetch(node_off)?;
        {
            let mut node = InternalPage::new(page);
            node.set_num_keys(mid);
            for j in 0..mid {
                node.set_key_at(j, keys[j]);
                node.set_child_at(j, children[j]);
            }
            node.set_child_at(mid, children[mid]);
        }
        self.pool.unpin(node_off, true)?;

        Ok(Some((split_key, new_off)))
    }

    // -- Delete --------------------------------------------------------------

    /// Deletes a key, rebalancing underful nodes by redistribute or merge.
    pub fn delete(&mut self, key: Key) -> Result<()> {
        if !self.root.is_valid() {
            return Err(StrataError::KeyNotFound);
        }

        // Existence check first, so a miss reports NotFound without touching
        // any page.
        self.search(key)?;

        let underful = self.delete_recursive(self.root, key)?;
        if underful {
            self.shrink_root()?;
        }
        Ok(())
    }

    /// Returns true if the node became underful and its parent must fix it.
    fn delete_recursive(&mut self, node_off: PageId, key: Key) -> Result<bool> {
        let page = self.pool.fetch(node_off)?;
        if page_is_leaf(page) {
            self.pool.unpin(node_off, false)?;
            return self.delete_from_leaf(node_off, key);
        }

        let (child, child_idx) = {
            let node = InternalPage::new(page);
            let n = node.num_keys();
            let mut i = 0;
            while i < n && key >= node.key_at(i) {
                i += 1;
            }
            (node.child_at(i), i)
        };
        self.pool.unpin(node_off, false)?;

        if !self.delete_recursive(child, key)? {
            return Ok(false);
        }

        self.fix_child(node_off, child_idx)?;

        let page = self.pool.fetch(node_off)?;
        let nk = InternalPage::new(page).num_keys();
        self.pool.unpin(node_off, false)?;

        // The root is allowed to run below the minimum.
        if node_off == self.root {
            Ok(nk == 0)
        } else {
            Ok(nk < INTERNAL_MIN_KEYS)
        }
    }

    fn delete_from_leaf(&mut self, leaf_off: PageId, key: Key) -> Result<bool> {
        let page = self.pool.fetch(leaf_off)?;
        let mut leaf = LeafPage::new(page);
        let n = leaf.num_keys();

        let mut found = None;
        for i in 0..n {
            if leaf.key_at(i) == key {
                found = Some(i);
                break;
            }
        }
        let Some(found) = found else {
            self.pool.unpin(leaf_off, false)?;
            return Ok(false);
        };

        // Shift the remaining records left.
        for j in found..n - 1 {
            let (k, p) = leaf.record_at(j + 1);
            leaf.set_record(j, k, &p);
        }
        leaf.set_num_keys(n - 1);
        self.pool.unpin(leaf_off, true)?;

        if leaf_off == self.root {
            Ok(n - 1 == 0)
        } else {
            Ok(n - 1 < LEAF_MIN_KEYS)
        }
    }

    /// Shrinks the root after a delete left it empty: an empty root leaf
    /// empties the tree, an empty root internal promotes its sole child.
    fn shrink_root(&mut self) -> Result<()> {
        let root_off = self.root;
        let page = self.pool.fetch(root_off)?;
        let new_root = if page_is_leaf(page) {
            let leaf = LeafPage::new(page);
            (leaf.num_keys() == 0).then_some(PageId::INVALID)
        } else {
            let node = InternalPage::new(page);
            (node.num_keys() == 0).then(|| node.child_at(0))
        };
        self.pool.unpin(root_off, false)?;

        if let Some(new_root) = new_root {
            self.root = new_root;
            self.dealloc_page(root_off)?;
            self.write_metadata()?;
        }
        Ok(())
    }

    // -- Rebalancing ---------------------------------------------------------

    fn fix_child(&mut self, parent_off: PageId, child_idx: usize) -> Result<()> {
        let page = self.pool.fetch(parent_off)?;
        let child_off = InternalPage::new(page).child_at(child_idx);
        self.pool.unpin(parent_off, false)?;

        let page = self.pool.fetch(child_off)?;
        let child_is_leaf = page_is_leaf(page);
        self.pool.unpin(child_off, false)?;

        if child_is_leaf {
            self.fix_leaf_child(parent_off, child_idx)
        } else {
            self.fix_internal_child(parent_off, child_idx)
        }
    }

    fn fix_leaf_child(&mut self, parent_off: PageId, child_idx: usize) -> Result<()> {
        let page = self.pool.fetch(parent_off)?;
        let (child_off, left_off, right_off) = {
            let parent = InternalPage::new(page);
            let pk = parent.num_keys();
            let child = parent.child_at(child_idx);
            let left = if child_idx > 0 {
                parent.child_at(child_idx - 1)
            } else {
                PageId::INVALID
            };
            let right = if child_idx < pk {
                parent.child_at(child_idx + 1)
            } else {
                PageId::INVALID
            };
            (child, left, right)
        };
        self.pool.unpin(parent_off, false)?;

        // Redistribute from the left sibling when it can spare a record.
        if left_off.is_valid() {
            let page = self.pool.fetch(left_off)?;
            let borrowed = {
                let mut left = LeafPage::new(page);
                let left_n = left.num_keys();
                if left_n > LEAF_MIN_KEYS {
                    let rec = left.record_at(left_n - 1);
                    left.set_num_keys(left_n - 1);
                    Some(rec)
                } else {
                    None
                }
            };
            self.pool.unpin(left_off, borrowed.is_some())?;

            if let Some((k, p)) = borrowed {
                // The moved record goes to the front of the child.
                let page = self.pool.fetch(child_off)?;
                {
                    let mut child = LeafPage::new(page);
                    let cn = child.num_keys();
                    let mut j = cn;
                    while j > 0 {
                        let (k2, p2) = child.record_at(j - 1);
                        child.set_record(j, k2, &p2);
                        j -= 1;
                    }
                    child.set_record(0, k, &p);
                    child.set_num_keys(cn + 1);
                }
                self.pool.unpin(child_off, true)?;

                // The separator becomes the moved record's key.
                let page = self.pool.fetch(parent_off)?;
                InternalPage::new(page).set_key_at(child_idx - 1, k);
                self.pool.unpin(parent_off, true)?;
                return Ok(());
            }
        }

        // Redistribute from the right sibling.
        if right_off.is_valid() {
            let page = self.pool.fetch(right_off)?;
            let borrowed = {
                let mut right = LeafPage::new(page);
                let right_n = right.num_keys();
                if right_n > LEAF_MIN_KEYS {
                    let rec = right.record_at(0);
                    for j in 0..right_n - 1 {
                        let (k2, p2) = right.record_at(j + 1);
                        right.set_record(j, k2, &p2);
                    }
                    right.set_num_keys(right_n - 1);
                    Some((rec, right.key_at(0)))
                } else {
                    None
                }
            };
            self.pool.unpin(right_off, borrowed.is_some())?;

            if let Some(((k, p), new_right_first)) = borrowed {
                let page = self.pool.fetch(child_off)?;
                {
                    let mut child = LeafPage::new(page);
                    let cn = child.num_keys();
                    child.set_record(cn, k, &p);
                    child.set_num_keys(cn + 1);
                }
                self.pool.unpin(child_off, true)?;

                let page = self.pool.fetch(parent_off)?;
                InternalPage::new(page).set_key_at(child_idx, new_right_first);
                self.pool.unpin(parent_off, true)?;
                return Ok(());
            }
        }

        // No sibling can donate: merge, always into the left of the pair.
        let (left_off, right_off, merge_key_idx) = if child_idx > 0 {
            (left_off, child_off, child_idx - 1)
        } else {
            (child_off, right_off, child_idx)
        };

        let page = self.pool.fetch(right_off)?;
        let (right_records, right_next) = {
            let right = LeafPage::new(page);
            let rn = right.num_keys();
            let records: Vec<(Key, Payload)> = (0..rn).map(|j| right.record_at(j)).collect();
            (records, right.next_leaf())
        };
        self.pool.unpin(right_off, false)?;

        let page = self.pool.fetch(left_off)?;
        {
            let mut left = LeafPage::new(page);
            let ln = left.num_keys();
            for (j, (k, p)) in right_records.iter().enumerate() {
                left.set_record(ln + j, *k, p);
            }
            left.set_num_keys(ln + right_records.len());
            left.set_next_leaf(right_next);
        }
        self.pool.unpin(left_off, true)?;

        self.dealloc_page(right_off)?;
        self.remove_parent_entry(parent_off, merge_key_idx)
    }

    fn fix_internal_child(&mut self, parent_off: PageId, child_idx: usize) -> Result<()> {
        let page = self.pool.fetch(parent_off)?;
        let (child_off, left_off, right_off, left_sep, right_sep) = {
            let parent = InternalPage::new(page);
            let pk = parent.num_keys();
            let child = parent.child_at(child_idx);
            let (left, left_sep) = if child_idx > 0 {
                (parent.child_at(child_idx - 1), parent.key_at(child_idx - 1))
            } else {
                (PageId::INVALID, 0)
            };
            let (right, right_sep) = if child_idx < pk {
                (parent.child_at(child_idx + 1), parent.key_at(child_idx))
            } else {
                (PageId::INVALID, 0)
            };
            (child, left, right, left_sep, right_sep)
        };
        self.pool.unpin(parent_off, false)?;

        // Borrow from the left sibling: the separator moves down as the
        // child's first key, the left's last key moves up to replace it, and
        // the left's last child pointer is transplanted.
        if left_off.is_valid() {
            let page = self.pool.fetch(left_off)?;
            let borrowed = {
                let mut left = InternalPage::new(page);
                let left_n = left.num_keys();
                if left_n > INTERNAL_MIN_KEYS {
                    let borrowed_key = left.key_at(left_n - 1);
                    let borrowed_child = left.child_at(left_n);
                    left.set_num_keys(left_n - 1);
                    Some((borrowed_key, borrowed_child))
                } else {
                    None
                }
            };
            self.pool.unpin(left_off, borrowed.is_some())?;

            if let Some((borrowed_key, borrowed_child)) = borrowed {
                let page = self.pool.fetch(child_off)?;
                {
                    let mut child = InternalPage::new(page);
                    let cn = child.num_keys();
                    let mut j = cn;
                    while j > 0 {
                        child.set_key_at(j, child.key_at(j - 1));
                        child.set_child_at(j + 1, child.child_at(j));
                        j -= 1;
                    }
                    child.set_child_at(1, child.child_at(0));
                    child.set_key_at(0, left_sep);
                    child.set_child_at(0, borrowed_child);
                    child.set_num_keys(cn + 1);
                }
                self.pool.unpin(child_off, true)?;

                let page = self.pool.fetch(parent_off)?;
                InternalPage::new(page).set_key_at(child_idx - 1, borrowed_key);
                self.pool.unpin(parent_off, true)?;
                return Ok(());
            }
        }

        // Borrow from the right sibling: symmetric.
        if right_off.is_valid() {
            let page = self.pool.fetch(right_off)?;
            let borrowed = {
                let mut right = InternalPage::new(page);
                let right_n = right.num_keys();
                if right_n > INTERNAL_MIN_KEYS {
                    let borrowed_key = right.key_at(0);
                    let borrowed_child = right.child_at(0);
                    for j in 0..right_n - 1 {
                        right.set_key_at(j, right.key_at(j + 1));
                        right.set_child_at(j, right.child_at(j + 1));
                    }
                    right.set_child_at(right_n - 1, right.child_at(right_n));
                    right.set_num_keys(right_n - 1);
                    Some((borrowed_key, borrowed_child))
                } else {
                    None
                }
            };
            self.pool.unpin(right_off, borrowed.is_some())?;

            if let Some((borrowed_key, borrowed_child)) = borrowed {
                let page = self.pool.fetch(child_off)?;
                {
                    let mut child = InternalPage::new(page);
                    let cn = child.num_keys();
                    child.set_key_at(cn, right_sep);
                    child.set_child_at(cn + 1, borrowed_child);
                    child.set_num_keys(cn + 1);
                }
                self.pool.unpin(child_off, true)?;

                let page = self.pool.fetch(parent_off)?;
                InternalPage::new(page).set_key_at(child_idx, borrowed_key);
                self.pool.unpin(parent_off, true)?;
                return Ok(());
            }
        }

        // Merge as left | separator | right, into the left of the pair.
        let (left_off, right_off, merge_key_idx, merge_key) = if child_idx > 0 {
            (left_off, child_off, child_idx - 1, left_sep)
        } else {
            (child_off, right_off, child_idx, right_sep)
        };

        let page = self.pool.fetch(right_off)?;
        let (right_keys, right_children) = {
            let right = InternalPage::new(page);
            let rn = right.num_keys();
            let keys: Vec<Key> = (0..rn).map(|j| right.key_at(j)).collect();
            let children: Vec<PageId> = (0..=rn).map(|j| right.child_at(j)).collect();
            (keys, children)
        };
        self.pool.unpin(right_off, false)?;

        let page = self.pool.fetch(left_off)?;
        {
            let mut left = InternalPage::new(page);
            let ln = left.num_keys();
            left.set_key_at(ln, merge_key);
            left.set_child_at(ln + 1, right_children[0]);
            for (j, k) in right_keys.iter().enumerate() {
                left.set_key_at(ln + 1 + j, *k);
                left.set_child_at(ln + 2 + j, right_children[j + 1]);
            }
            left.set_num_keys(ln + 1 + right_keys.len());
        }
        self.pool.unpin(left_off, true)?;

        self.dealloc_page(right_off)?;
        self.remove_parent_entry(parent_off, merge_key_idx)
    }

    /// Removes key `merge_key_idx` and the child to its right from a parent
    /// after a merge.
    fn remove_parent_entry(&mut self, parent_off: PageId, merge_key_idx: usize) -> Result<()> {
        let page = self.pool.fetch(parent_off)?;
        {
            let mut parent = InternalPage::new(page);
            let pn = parent.num_keys();
            for j in merge_key_idx..pn - 1 {
                parent.set_key_at(j, parent.key_at(j + 1));
                parent.set_child_at(j + 1, parent.child_at(j + 2));
            }
            parent.set_num_keys(pn - 1);
        }
        self.pool.unpin(parent_off, true)?;
        Ok(())
    }

    // -- Page lifecycle ------------------------------------------------------

    /// Drops a page from the pool (unflushed) and pushes it onto the store's
    /// free list.
    fn dealloc_page(&mut self, page_id: PageId) -> Result<()> {
        self.pool.drop_page(page_id)?;
        self.pool.store_mut().free_page(page_id)
    }

    fn write_metadata(&mut self) -> Result<()> {
        let root = self.root;
        let store = self.pool.store_mut();
        store.set_root_offset(root);
        store.flush_metadata()
    }

    // -- Structural verification ---------------------------------------------

    /// Walks the whole tree and checks its structural invariants:
    /// occupancy bounds, strictly increasing keys, separator bounds, the
    /// leaf chain matching in-order traversal, page alignment, and the free
    /// list being disjoint from reachable pages.
    pub fn verify_integrity(&mut self) -> Result<()> {
        let free = self.collect_free_list()?;

        if !self.root.is_valid() {
            return Ok(());
        }

        let mut leaves = Vec::new();
        let mut reachable = HashSet::new();
        self.verify_node(self.root, None, None, true, &mut leaves, &mut reachable)?;

        // The leaf chain must visit exactly the in-order leaves.
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cur = leaves[0];
        while cur.is_valid() {
            if !seen.insert(cur) {
                return Err(StrataError::Corrupted(format!(
                    "leaf chain cycle at {cur}"
                )));
            }
            chain.push(cur);
            let page = self.pool.fetch(cur)?;
            let next = LeafPage::new(page).next_leaf();
            self.pool.unpin(cur, false)?;
            cur = next;
        }
        if chain != leaves {
            return Err(StrataError::Corrupted(
                "leaf chain does not match tree order".to_string(),
            ));
        }

        for page_id in &free {
            if reachable.contains(page_id) {
                return Err(StrataError::Corrupted(format!(
                    "free page {page_id} is reachable from the root"
                )));
            }
        }

        Ok(())
    }

    fn verify_node(
        &mut self,
        off: PageId,
        lower: Option<Key>,
        upper: Option<Key>,
        is_root: bool,
        leaves: &mut Vec<PageId>,
        reachable: &mut HashSet<PageId>,
    ) -> Result<()> {
        let file_size = self.pool.store().file_size() as i64;
        if !off.is_aligned() || off.0 + PAGE_SIZE as i64 > file_size {
            return Err(StrataError::Corrupted(format!(
                "node offset {off} outside the file"
            )));
        }
        if !reachable.insert(off) {
            return Err(StrataError::Corrupted(format!(
                "page {off} referenced more than once"
            )));
        }

        let in_bounds =
            |k: Key| lower.map_or(true, |lo| k >= lo) && upper.map_or(true, |up| k < up);

        let page = self.pool.fetch(off)?;
        if page_is_leaf(page) {
            let (n, keys) = {
                let leaf = LeafPage::new(page);
                let n = leaf.num_keys();
                let keys: Vec<Key> = (0..n).map(|i| leaf.key_at(i)).collect();
                (n, keys)
            };
            self.pool.unpin(off, false)?;

            if n > LEAF_MAX_KEYS || (!is_root && n < LEAF_MIN_KEYS) {
                return Err(StrataError::Corrupted(format!(
                    "leaf {off} holds {n} records"
                )));
            }
            for w in keys.windows(2) {
                if w[0] >= w[1] {
                    return Err(StrataError::Corrupted(format!(
                        "leaf {off} keys not strictly increasing"
                    )));
                }
            }
            for &k in &keys {
                if !in_bounds(k) {
                    return Err(StrataError::Corrupted(format!(
                        "leaf {off} key {k} violates separator bounds"
                    )));
                }
            }

            leaves.push(off);
            return Ok(());
        }

        let (n, keys, children) = {
            let node = InternalPage::new(page);
            let n = node.num_keys();
            let keys: Vec<Key> = (0..n).map(|i| node.key_at(i)).collect();
            let children: Vec<PageId> = (0..=n).map(|i| node.child_at(i)).collect();
            (n, keys, children)
        };
        self.pool.unpin(off, false)?;

        if n > INTERNAL_MAX_KEYS || (!is_root && n < INTERNAL_MIN_KEYS) || (is_root && n == 0) {
            return Err(StrataError::Corrupted(format!(
                "internal {off} holds {n} keys"
            )));
        }
        for w in keys.windows(2) {
            if w[0] >= w[1] {
                return Err(StrataError::Corrupted(format!(
                    "internal {off} keys not strictly increasing"
                )));
            }
        }
        for &k in &keys {
            if !in_bounds(k) {
                return Err(StrataError::Corrupted(format!(
                    "internal {off} key {k} violates separator bounds"
                )));
            }
        }

        for (i, &child) in children.iter().enumerate() {
            let child_lower = if i == 0 { lower } else { Some(keys[i - 1]) };
            let child_upper = if i == n { upper } else { Some(keys[i]) };
            self.verify_node(child, child_lower, child_upper, false, leaves, reachable)?;
        }
        Ok(())
    }

    /// Walks the free-list stack, validating each link.
    fn collect_free_list(&mut self) -> Result<Vec<PageId>> {
        let mut free = Vec::new();
        let mut seen = HashSet::new();
        let mut cur = self.pool.store().free_list_head();

        while cur.is_valid() {
            let file_size = self.pool.store().file_size() as i64;
            if !cur.is_aligned() || cur.0 + PAGE_SIZE as i64 > file_size {
                return Err(StrataError::Corrupted(format!(
                    "free-list entry {cur} outside the file"
                )));
            }
            if !seen.insert(cur) {
                return Err(StrataError::Corrupted(format!("free-list cycle at {cur}")));
            }
            free.push(cur);

            let page = self.pool.store_mut().page(cur.0)?;
            cur = PageId(read_meta_field(page, FREE_PAGE_NEXT));
        }
        Ok(free)
    }
}

impl Drop for BPlusTree {
    fn drop(&mut self) {
        if let Err(e) = self.write_metadata() {
            warn!(error = %e, "metadata write failed on shutdown");
            return;
        }
        if let Err(e) = self.pool.flush_all() {
            warn!(error = %e, "flush failed on shutdown");
            return;
        }
        // Checkpoint on clean shutdown to truncate the WAL.
        if let Some(wal) = self.wal.clone() {
            if let Err(e) = wal.lock().end_checkpoint() {
                warn!(error = %e, "checkpoint failed on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_tree(dir: &tempfile::TempDir, pool_size: usize) -> BPlusTree {
        let config = EngineConfig {
            pool_size,
            enable_wal: true,
        };
        BPlusTree::open(dir.path().join("test.idx"), config).unwrap()
    }

    fn value(i: i32) -> String {
        format!("v{i}")
    }

    #[test]
    fn test_basic_upsert() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        tree.insert(42, b"the answer").unwrap();
        assert_eq!(tree.search(42).unwrap().as_trimmed(), b"the answer");

        tree.insert(42, b"changed").unwrap();
        assert_eq!(tree.search(42).unwrap().as_trimmed(), b"changed");
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_search_missing_key() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        assert!(matches!(tree.search(1), Err(StrataError::KeyNotFound)));

        tree.insert(1, b"x").unwrap();
        assert!(matches!(tree.search(2), Err(StrataError::KeyNotFound)));
    }

    #[test]
    fn test_delete_on_empty_tree() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);
        assert!(matches!(tree.delete(7), Err(StrataError::KeyNotFound)));
    }

    #[test]
    fn test_delete_missing_key_leaves_tree_intact() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        tree.insert(1, b"one").unwrap();
        assert!(matches!(tree.delete(2), Err(StrataError::KeyNotFound)));
        assert_eq!(tree.search(1).unwrap().as_trimmed(), b"one");
    }

    #[test]
    fn test_leaf_split() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        for i in 1..=50 {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }
        for i in 1..=50 {
            assert_eq!(tree.search(i).unwrap().as_trimmed(), value(i).as_bytes());
        }
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_exactly_one_leaf_split_at_36_keys() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        for i in 0..36 {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }
        tree.verify_integrity().unwrap();

        let all = tree.range_query(i32::MIN, i32::MAX).unwrap();
        assert_eq!(all.len(), 36);
    }

    #[test]
    fn test_insert_descending_order() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        for i in (0..300).rev() {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }
        tree.verify_integrity().unwrap();

        let all = tree.range_query(i32::MIN, i32::MAX).unwrap();
        let keys: Vec<i32> = all.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (0..300).collect::<Vec<_>>());
    }

    #[test]
    fn test_range_after_splits() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        for i in 0..1000 {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }

        let results = tree.range_query(400, 600).unwrap();
        assert_eq!(results.len(), 201);
        for (j, (k, p)) in results.iter().enumerate() {
            assert_eq!(*k, 400 + j as i32);
            assert_eq!(p.as_trimmed(), value(*k).as_bytes());
        }
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_range_query_bounds() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        for i in 0..100 {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }

        // lower == upper returns at most the exact match.
        let exact = tree.range_query(50, 50).unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].0, 50);

        let missing = tree.range_query(-10, -5).unwrap();
        assert!(missing.is_empty());

        assert!(matches!(
            tree.range_query(10, 9),
            Err(StrataError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_range_query_empty_tree() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);
        assert!(tree.range_query(0, 100).unwrap().is_empty());
    }

    #[test]
    fn test_delete_with_rebalance() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        for i in 0..100 {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }
        for i in 0..30 {
            tree.delete(i).unwrap();
        }

        for i in 0..30 {
            assert!(matches!(tree.search(i), Err(StrataError::KeyNotFound)));
        }
        for i in 30..100 {
            assert_eq!(tree.search(i).unwrap().as_trimmed(), value(i).as_bytes());
        }
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_delete_all_leaves_empty_tree() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        for i in 0..500 {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }
        for i in (0..500).rev() {
            tree.delete(i).unwrap();
        }

        assert!(tree.is_empty());
        assert!(matches!(tree.search(0), Err(StrataError::KeyNotFound)));
        assert!(tree.range_query(i32::MIN, i32::MAX).unwrap().is_empty());
        tree.verify_integrity().unwrap();

        // Deleted pages are recycled through the free list.
        tree.insert(7, b"again").unwrap();
        assert_eq!(tree.search(7).unwrap().as_trimmed(), b"again");
    }

    #[test]
    fn test_delete_ascending_interleaved() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        for i in 0..400 {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }
        // Delete every other key, forcing plenty of redistribution.
        for i in (0..400).step_by(2) {
            tree.delete(i).unwrap();
        }
        tree.verify_integrity().unwrap();

        let all = tree.range_query(i32::MIN, i32::MAX).unwrap();
        let keys: Vec<i32> = all.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (1..400).step_by(2).collect::<Vec<_>>());
    }

    #[test]
    fn test_internal_split() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 256);

        // 35 * 36 distinct keys forces at least one internal split.
        let n = 35 * 36;
        for i in 0..n {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }
        tree.verify_integrity().unwrap();

        for i in (0..n).step_by(97) {
            assert_eq!(tree.search(i).unwrap().as_trimmed(), value(i).as_bytes());
        }
        assert_eq!(tree.range_query(0, n - 1).unwrap().len(), n as usize);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");
        let config = EngineConfig {
            pool_size: 64,
            enable_wal: true,
        };

        {
            let mut tree = BPlusTree::open(&path, config.clone()).unwrap();
            for i in 0..300 {
                tree.insert(i, value(i).as_bytes()).unwrap();
            }
        }

        let mut tree = BPlusTree::open(&path, config).unwrap();
        let all = tree.range_query(i32::MIN, i32::MAX).unwrap();
        assert_eq!(all.len(), 300);
        for (i, (k, p)) in all.iter().enumerate() {
            assert_eq!(*k, i as i32);
            assert_eq!(p.as_trimmed(), value(*k).as_bytes());
        }
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_empty_tree_persists_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");
        let config = EngineConfig::without_wal();

        {
            let mut tree = BPlusTree::open(&path, config.clone()).unwrap();
            for i in 0..50 {
                tree.insert(i, value(i).as_bytes()).unwrap();
            }
            for i in 0..50 {
                tree.delete(i).unwrap();
            }
            assert!(tree.is_empty());
        }

        let mut tree = BPlusTree::open(&path, config).unwrap();
        assert!(tree.is_empty());
        assert!(matches!(tree.search(0), Err(StrataError::KeyNotFound)));
    }

    #[test]
    fn test_small_pool_forces_evictions() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 8);

        for i in 0..1000 {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }
        // Evictions logged after-images along the way.
        assert!(tree.wal_records_written() > 0);
        assert!(tree.pool_misses() > 0);

        for i in (0..1000).step_by(83) {
            assert_eq!(tree.search(i).unwrap().as_trimmed(), value(i).as_bytes());
        }
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_payload_padding_and_truncation() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        tree.insert(1, b"").unwrap();
        assert_eq!(tree.search(1).unwrap().as_trimmed(), b"");

        let long = vec![b'x'; 200];
        tree.insert(2, &long).unwrap();
        assert_eq!(tree.search(2).unwrap().as_trimmed(), &long[..100]);
    }

    #[test]
    fn test_checkpoint_truncates_wal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");
        let wal_path = dir.path().join("test.idx.wal");
        let config = EngineConfig {
            pool_size: 8,
            enable_wal: true,
        };

        let mut tree = BPlusTree::open(&path, config).unwrap();
        for i in 0..500 {
            tree.insert(i, value(i).as_bytes()).unwrap();
        }
        assert!(tree.wal_bytes_written() > 0);

        tree.checkpoint().unwrap();
        assert_eq!(
            std::fs::metadata(&wal_path).unwrap().len(),
            strata_wal::WAL_FILE_HEADER_SIZE as u64
        );

        for i in (0..500).step_by(61) {
            assert_eq!(tree.search(i).unwrap().as_trimmed(), value(i).as_bytes());
        }
    }

    #[test]
    fn test_wal_disabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");

        let mut tree = BPlusTree::open(&path, EngineConfig::without_wal()).unwrap();
        assert!(!tree.wal_enabled());
        assert_eq!(tree.wal_bytes_written(), 0);
        assert_eq!(tree.wal_records_written(), 0);

        tree.insert(1, b"x").unwrap();
        tree.checkpoint().unwrap();
        assert!(!dir.path().join("test.idx.wal").exists());
    }

    #[test]
    fn test_corrupt_metadata_refuses_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");

        {
            let mut store = PagedStore::open(&path).unwrap();
            store.set_root_offset(PageId(12345));
            store.flush_metadata().unwrap();
        }

        assert!(matches!(
            BPlusTree::open(&path, EngineConfig::without_wal()),
            Err(StrataError::Corrupted(_))
        ));
    }

    #[test]
    fn test_corrupt_next_pointer_refuses_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");

        {
            let mut store = PagedStore::open(&path).unwrap();
            store.set_next_page_offset(100);
            store.flush_metadata().unwrap();
        }

        assert!(matches!(
            BPlusTree::open(&path, EngineConfig::without_wal()),
            Err(StrataError::Corrupted(_))
        ));
    }

    #[test]
    fn test_stats_accessors() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir, 64);

        tree.insert(1, b"x").unwrap();
        tree.search(1).unwrap();

        assert!(tree.wal_enabled());
        assert!(tree.pool_hits() + tree.pool_misses() > 0);
        assert!(tree.pool_hit_rate() >= 0.0 && tree.pool_hit_rate() <= 1.0);
        assert!(tree.file_path().ends_with("test.idx"));
    }
}
