//! Per-extent page map and free-range indices.
//!
//! Ported from `boilerplate/heapmem.h` / `lib/copperplate/heapobj-pshared.c`:
//! each extent owns a page map (one entry per `PAGE`-sized page), a
//! per-extent array of bucket list heads, and two ordered indices over
//! the free page ranges (by starting page and by run length) used to
//! satisfy page-range requests with a best-fit search.
//!
//! The original indexes free ranges with intrusive AVL trees embedded
//! at the start of the free range itself, addressed by shared-memory
//! offset. We keep the same two-index shape but back it with
//! `BTreeMap`s keyed by plain page numbers — an ordered index without
//! resorting to raw cross-process pointers, per the intrusive-graph
//! redesign note.

use crate::error::{CopperplateError, Result};

pub const PAGE_SHIFT: u32 = 9;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const MIN_LOG2: u32 = 4;
pub const MIN_ALIGN: usize = 1 << MIN_LOG2;
/// Number of distinct bucket size classes: 2^MIN_LOG2 .. 2^(PAGE_SHIFT-1).
pub const NUM_BUCKETS: usize = (PAGE_SHIFT - MIN_LOG2) as usize;

/// Per-page bookkeeping. `Free` pages are not linked into a bucket
/// list; they are represented solely by the extent's range indices.
#[derive(Debug, Clone, Copy)]
pub enum PageKind {
    Free,
    /// Head of (or sole page in) a bucketed size class. `map` is a
    /// 32-bit per-slot occupancy bitmap; bit `i` set means slot `i`
    /// is busy.
    Bucket { log2size: u32, map: u32 },
    /// Heading page of a multi-page block.
    ListHead { bsize: usize },
    /// Continuation page of a multi-page block (debug bookkeeping
    /// only, never consulted on the alloc/free fast path).
    Cont,
}

#[derive(Debug, Clone, Copy)]
pub struct PageEntry {
    pub prev: u32,
    pub next: u32,
    pub kind: PageKind,
}

impl PageEntry {
    fn free() -> Self {
        PageEntry {
            prev: 0,
            next: 0,
            kind: PageKind::Free,
        }
    }
}

/// Returns the bitmask covering every slot of a bucket with the given
/// `log2size`, i.e. `PAGE_SIZE / 2^log2size` set bits.
pub fn gen_block_mask(log2size: u32) -> u32 {
    let nslots = PAGE_SIZE >> log2size;
    if nslots >= 32 {
        u32::MAX
    } else {
        (1u32 << nslots) - 1
    }
}

pub struct Extent {
    pub data: Vec<u8>,
    pub nrpages: u32,
    pub pagemap: Vec<PageEntry>,
    /// Per-bucket free-page list heads (sentinel `u32::MAX` = empty).
    pub buckets: [u32; NUM_BUCKETS],
    /// Free ranges keyed by starting page number.
    addr_tree: std::collections::BTreeMap<u32, u32>,
    /// Free ranges keyed by (run length in pages, starting page), so a
    /// range-size lookup finds the smallest range `>=` the request.
    size_tree: std::collections::BTreeMap<(u32, u32), ()>,
}

pub const EMPTY: u32 = u32::MAX;

impl Extent {
    pub fn new(size: usize) -> Self {
        let nrpages = (size >> PAGE_SHIFT) as u32;
        let mut pagemap = vec![PageEntry::free(); nrpages as usize];
        for (i, p) in pagemap.iter_mut().enumerate() {
            p.prev = i as u32;
            p.next = i as u32;
        }
        let mut addr_tree = std::collections::BTreeMap::new();
        let mut size_tree = std::collections::BTreeMap::new();
        if nrpages > 0 {
            addr_tree.insert(0u32, nrpages);
            size_tree.insert((nrpages, 0u32), ());
        }
        Extent {
            data: vec![0u8; nrpages as usize * PAGE_SIZE],
            nrpages,
            pagemap,
            buckets: [EMPTY; NUM_BUCKETS],
            addr_tree,
            size_tree,
        }
    }

    pub fn usable_size(&self) -> usize {
        self.nrpages as usize * PAGE_SIZE
    }

    fn remove_range_index(&mut self, start: u32, len: u32) {
        self.addr_tree.remove(&start);
        self.size_tree.remove(&(len, start));
    }

    fn insert_range_index(&mut self, start: u32, len: u32) {
        self.addr_tree.insert(start, len);
        self.size_tree.insert((len, start), ());
    }

    /// Best-fit search: the smallest free range with `len >= npages`,
    /// splitting off the excess and keeping the lower part free
    /// (mirrors `reserve_page_range`/`find_suitable_range`).
    pub fn reserve_page_range(&mut self, npages: u32) -> Option<u32> {
        let found = self
            .size_tree
            .range((npages, 0)..)
            .next()
            .map(|(&(len, start), _)| (len, start));
        let (len, start) = found?;
        self.remove_range_index(start, len);
        if len == npages {
            return Some(start);
        }
        // Keep the lower part as the new free range, hand out the
        // upper part so the freed-range code never has to re-key by
        // address on the common split path.
        let remaining = len - npages;
        self.insert_range_index(start, remaining);
        Some(start + remaining)
    }

    /// Returns a free range to the pool, merging with address
    /// neighbours on both sides.
    pub fn release_page_range(&mut self, start: u32, npages: u32) {
        let mut new_start = start;
        let mut new_len = npages;

        // Left neighbour: largest range whose end equals our start.
        if let Some((&lstart, &llen)) = self.addr_tree.range(..start).next_back() {
            if lstart + llen == start {
                self.remove_range_index(lstart, llen);
                new_start = lstart;
                new_len += llen;
            }
        }
        // Right neighbour: a range starting exactly where we end.
        let right_key = new_start + new_len;
        if let Some(&rlen) = self.addr_tree.get(&right_key) {
            self.remove_range_index(right_key, rlen);
            new_len += rlen;
        }

        self.insert_range_index(new_start, new_len);

        for pg in start..start + npages {
            self.pagemap[pg as usize].kind = PageKind::Free;
        }
    }

    /// Inserts `pg` at the front of bucket `ilog`'s page list.
    pub fn add_page_front(&mut self, pg: u32, ilog: usize) {
        if self.buckets[ilog] == EMPTY {
            self.buckets[ilog] = pg;
            self.pagemap[pg as usize].prev = pg;
            self.pagemap[pg as usize].next = pg;
        } else {
            let head = self.buckets[ilog];
            let head_next = self.pagemap[head as usize].next;
            self.pagemap[pg as usize].prev = head;
            self.pagemap[pg as usize].next = head_next;
            self.pagemap[head_next as usize].prev = pg;
            self.pagemap[head as usize].next = pg;
            self.buckets[ilog] = pg;
        }
    }

    /// Unlinks `pg` from bucket `ilog`'s page list.
    pub fn remove_page(&mut self, pg: u32, ilog: usize) {
        let (prev, next) = {
            let e = &self.pagemap[pg as usize];
            (e.prev, e.next)
        };
        if pg == next {
            self.buckets[ilog] = EMPTY;
        } else {
            if pg == self.buckets[ilog] {
                self.buckets[ilog] = next;
            }
            self.pagemap[prev as usize].next = next;
            self.pagemap[next as usize].prev = prev;
        }
    }

    pub fn move_page_front(&mut self, pg: u32, ilog: usize) {
        if self.buckets[ilog] == pg {
            return;
        }
        self.remove_page(pg, ilog);
        self.add_page_front(pg, ilog);
    }

    pub fn move_page_back(&mut self, pg: u32, ilog: usize) {
        let next = self.pagemap[pg as usize].next;
        if pg == next {
            return; // singleton, already both head and tail
        }
        self.remove_page(pg, ilog);
        let head = self.buckets[ilog];
        let last = self.pagemap[head as usize].prev;
        self.pagemap[pg as usize].prev = last;
        self.pagemap[pg as usize].next = head;
        self.pagemap[last as usize].next = pg;
        self.pagemap[head as usize].prev = pg;
    }

    pub fn addr_to_page(&self, offset: usize) -> Result<u32> {
        if offset >= self.data.len() {
            return Err(CopperplateError::InvalidArgument(
                "offset outside extent".into(),
            ));
        }
        Ok((offset >> PAGE_SHIFT) as u32)
    }

    pub(super) fn addr_tree_len_impl(&self) -> usize {
        self.addr_tree.len()
    }
}
