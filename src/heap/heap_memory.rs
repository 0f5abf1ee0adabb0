//! The shared arena allocator: bucket allocation for sub-page blocks,
//! page-range reservation for larger ones, backed by one or more
//! extents. Ported from `lib/copperplate/heapobj-pshared.c`'s
//! `sheapmem_alloc`/`sheapmem_free`/`sheapmem_check`, generalized to a
//! multi-extent, per-extent-bucket-head model.
//!
//! All operations serialize on a single mutex: the source notes "no
//! concurrent allocators", which we keep (a `parking_lot::Mutex`
//! rather than a lock-free structure, matching this crate's other
//! locks).

use parking_lot::Mutex;

use super::extent::{gen_block_mask, Extent, PageKind, EMPTY, MIN_ALIGN, MIN_LOG2, PAGE_SIZE};
use crate::error::{CopperplateError, Result};

/// Handle to a live allocation. Carries enough to locate the owning
/// extent and page without ever exposing a raw pointer into the
/// arena — the redesign note calls for tagged-index handles over
/// cross-process pointers, and this is the user-space analogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    extent_idx: u32,
    page: u32,
    /// Bit index within the page's occupancy bitmap for bucketed
    /// blocks; always 0 for page-range (`ListHead`) blocks, which
    /// occupy the whole run.
    slot: u32,
}

fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

fn align_up_page(v: usize) -> usize {
    align_up(v, PAGE_SIZE)
}

struct HeapInner {
    extents: Vec<Extent>,
    arena_size: usize,
    usable_size: usize,
    used_size: usize,
}

pub struct HeapMemory {
    inner: Mutex<HeapInner>,
}

impl HeapMemory {
    /// `init(heap, mem, size)`: creates a heap with one initial
    /// extent sized to hold `size` usable bytes.
    pub fn init(size: usize) -> Result<Self> {
        if size < PAGE_SIZE {
            return Err(CopperplateError::InvalidArgument(
                "heap size must be at least one page".into(),
            ));
        }
        let aligned = align_up_page(size);
        let ext = Extent::new(aligned);
        let usable = ext.usable_size();
        Ok(HeapMemory {
            inner: Mutex::new(HeapInner {
                extents: vec![ext],
                arena_size: aligned,
                usable_size: usable,
                used_size: 0,
            }),
        })
    }

    /// `extend(heap, mem, size)`: adds another extent, growing total
    /// capacity without disturbing existing allocations.
    pub fn extend(&self, size: usize) -> Result<()> {
        if size < PAGE_SIZE {
            return Err(CopperplateError::InvalidArgument(
                "extent size must be at least one page".into(),
            ));
        }
        let aligned = align_up_page(size);
        let ext = Extent::new(aligned);
        let mut inner = self.inner.lock();
        inner.usable_size += ext.usable_size();
        inner.arena_size += aligned;
        inner.extents.push(ext);
        tracing::info!(
            added_bytes = aligned,
            extent_count = inner.extents.len(),
            arena_size = inner.arena_size,
            "heap extent added"
        );
        Ok(())
    }

    fn size_class(size: usize) -> (usize, u32) {
        let size = size.max(MIN_ALIGN);
        if size >= PAGE_SIZE {
            (align_up_page(size), 0)
        } else {
            let log2size = (usize::BITS - 1 - size.next_power_of_two().leading_zeros()).max(MIN_LOG2);
            (1usize << log2size, log2size)
        }
    }

    pub fn alloc(&self, size: usize) -> Result<BlockHandle> {
        if size == 0 {
            return Err(CopperplateError::InvalidArgument("zero-sized allocation".into()));
        }
        let (bsize, log2size) = Self::size_class(size);
        let mut inner = self.inner.lock();

        if bsize < PAGE_SIZE {
            let ilog = (log2size - MIN_LOG2) as usize;
            for (idx, ext) in inner.extents.iter_mut().enumerate() {
                let pg = ext.buckets[ilog];
                if pg == EMPTY {
                    continue;
                }
                let map = match ext.pagemap[pg as usize].kind {
                    PageKind::Bucket { map, .. } => map,
                    _ => unreachable!("bucket head must be a Bucket page"),
                };
                if map == u32::MAX {
                    // Head is full; per the invariant, so is every
                    // page in this bucket. Fall through to add a page.
                    continue;
                }
                let b = (!map).trailing_zeros();
                let new_map = map | (1 << b);
                ext.pagemap[pg as usize].kind = PageKind::Bucket {
                    log2size,
                    map: new_map,
                };
                inner.used_size += bsize;
                if new_map == u32::MAX {
                    ext.move_page_back(pg, ilog);
                }
                return Ok(BlockHandle {
                    extent_idx: idx as u32,
                    page: pg,
                    slot: b,
                });
            }
            // No extent has a usable bucket page: carve a fresh one.
            return Self::add_free_range(&mut inner, bsize, log2size);
        }

        Self::add_free_range(&mut inner, bsize, 0)
    }

    fn add_free_range(inner: &mut HeapInner, bsize: usize, log2size: u32) -> Result<BlockHandle> {
        let npages = (bsize >> super::extent::PAGE_SHIFT) as u32;
        for (idx, ext) in inner.extents.iter_mut().enumerate() {
            if let Some(pg) = ext.reserve_page_range(npages.max(1)) {
                if log2size != 0 {
                    let map = (!gen_block_mask(log2size)) | 1;
                    ext.pagemap[pg as usize].kind = PageKind::Bucket { log2size, map };
                    ext.add_page_front(pg, (log2size - MIN_LOG2) as usize);
                } else {
                    ext.pagemap[pg as usize].kind = PageKind::ListHead { bsize };
                    for cont in pg + 1..pg + npages {
                        ext.pagemap[cont as usize].kind = PageKind::Cont;
                    }
                }
                inner.used_size += bsize;
                return Ok(BlockHandle {
                    extent_idx: idx as u32,
                    page: pg,
                    slot: 0,
                });
            }
        }
        tracing::warn!(bsize, extent_count = inner.extents.len(), "heap exhausted");
        Err(CopperplateError::OutOfMemory(format!(
            "no extent can satisfy a {}-byte request",
            bsize
        )))
    }

    pub fn free(&self, block: BlockHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = block.extent_idx as usize;
        if idx >= inner.extents.len() {
            return Err(CopperplateError::InvalidArgument("stale extent index".into()));
        }
        let bsize = {
            let ext = &inner.extents[idx];
            if block.page as usize >= ext.pagemap.len() {
                return Err(CopperplateError::InvalidArgument("page out of range".into()));
            }
            match ext.pagemap[block.page as usize].kind {
                PageKind::ListHead { bsize } => bsize,
                PageKind::Bucket { log2size, .. } => 1usize << log2size,
                PageKind::Cont | PageKind::Free => {
                    return Err(CopperplateError::InvalidArgument(
                        "not the head of a live block".into(),
                    ))
                }
            }
        };

        let ext = &mut inner.extents[idx];
        match ext.pagemap[block.page as usize].kind {
            PageKind::ListHead { bsize } => {
                let npages = (bsize >> super::extent::PAGE_SHIFT) as u32;
                ext.release_page_range(block.page, npages);
            }
            PageKind::Bucket { log2size, map } => {
                let ilog = (log2size - MIN_LOG2) as usize;
                if map & (1 << block.slot) == 0 {
                    return Err(CopperplateError::InvalidArgument(
                        "double free or stale handle".into(),
                    ));
                }
                let new_map = map & !(1 << block.slot);
                if new_map == !gen_block_mask(log2size) {
                    ext.remove_page(block.page, ilog);
                    ext.release_page_range(block.page, 1);
                } else {
                    let was_full = map == u32::MAX;
                    ext.pagemap[block.page as usize].kind = PageKind::Bucket {
                        log2size,
                        map: new_map,
                    };
                    if was_full {
                        ext.move_page_front(block.page, ilog);
                    }
                }
            }
            PageKind::Cont | PageKind::Free => unreachable!(),
        }

        inner.used_size -= bsize;
        Ok(())
    }

    /// `check(heap, ptr) -> bsize|-1`: returns the size class or run
    /// length of the live block at `block`, or an error if stale.
    pub fn check(&self, block: BlockHandle) -> Result<usize> {
        let inner = self.inner.lock();
        let idx = block.extent_idx as usize;
        let ext = inner
            .extents
            .get(idx)
            .ok_or(CopperplateError::InvalidArgument("stale extent index".into()))?;
        let entry = ext
            .pagemap
            .get(block.page as usize)
            .ok_or(CopperplateError::InvalidArgument("page out of range".into()))?;
        match entry.kind {
            PageKind::ListHead { bsize } => Ok(bsize),
            PageKind::Bucket { log2size, .. } => Ok(1usize << log2size),
            PageKind::Cont | PageKind::Free => Err(CopperplateError::InvalidArgument(
                "not the head of a live block".into(),
            )),
        }
    }

    pub fn arena_size(&self) -> usize {
        self.inner.lock().arena_size
    }

    pub fn usable_size(&self) -> usize {
        self.inner.lock().usable_size
    }

    pub fn used_size(&self) -> usize {
        self.inner.lock().used_size
    }

    /// Number of distinct free ranges across all extents (used by the
    /// allocator-closure property test to assert full coalescing).
    pub fn free_range_count(&self) -> usize {
        self.inner
            .lock()
            .extents
            .iter()
            .map(|e| e.addr_tree_len())
            .sum()
    }
}

impl Extent {
    /// Number of entries currently tracked in the address tree.
    pub fn addr_tree_len(&self) -> usize {
        // Exposed for tests via the heap's free_range_count helper.
        self.addr_tree_len_impl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_extent_roundtrip() {
        let heap = HeapMemory::init(64 * 1024).unwrap();
        let h = heap.alloc(100).unwrap();
        assert_eq!(heap.check(h).unwrap(), 128);
        assert_eq!(heap.used_size(), 128);
        heap.free(h).unwrap();
        assert_eq!(heap.used_size(), 0);
    }

    #[test]
    fn bucket_slots_are_independent() {
        let heap = HeapMemory::init(64 * 1024).unwrap();
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(16).unwrap();
        assert_ne!(a, b);
        heap.free(a).unwrap();
        // b is still live and distinguishable.
        assert_eq!(heap.check(b).unwrap(), 16);
        heap.free(b).unwrap();
    }

    #[test]
    fn double_free_is_rejected() {
        let heap = HeapMemory::init(64 * 1024).unwrap();
        let h = heap.alloc(32).unwrap();
        heap.free(h).unwrap();
        assert!(heap.free(h).is_err());
    }

    #[test]
    fn full_free_coalesces_back_to_one_range() {
        let heap = HeapMemory::init(64 * 1024).unwrap();
        let mut handles = Vec::new();
        for _ in 0..40 {
            handles.push(heap.alloc(16).unwrap());
        }
        for h in handles {
            heap.free(h).unwrap();
        }
        assert_eq!(heap.used_size(), 0);
        assert_eq!(heap.free_range_count(), 1);
    }

    #[test]
    fn page_sized_allocation_uses_list_head_path() {
        let heap = HeapMemory::init(64 * 1024).unwrap();
        let h = heap.alloc(PAGE_SIZE * 3).unwrap();
        assert_eq!(heap.check(h).unwrap(), PAGE_SIZE * 3);
        heap.free(h).unwrap();
        assert_eq!(heap.free_range_count(), 1);
    }

    #[test]
    fn extend_grows_capacity_and_serves_new_allocations() {
        let heap = HeapMemory::init(8 * 1024).unwrap();
        let before = heap.usable_size();
        heap.extend(16 * 1024).unwrap();
        assert!(heap.usable_size() > before);
        let h = heap.alloc(4096).unwrap();
        heap.free(h).unwrap();
    }

    #[test]
    fn out_of_memory_is_reported_not_panicked() {
        let heap = HeapMemory::init(PAGE_SIZE).unwrap();
        let err = heap.alloc(1024 * 1024).unwrap_err();
        assert!(matches!(err, CopperplateError::OutOfMemory(_)));
    }
}
