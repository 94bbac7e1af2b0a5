//! L3: the Memory Space. A growable collection of [`MemoryBlock`]s sharing
//! one [`AddressBook`], presenting a single flat object space to the layer
//! above. Placement is randomized rather than first-fit/best-fit across
//! blocks, trading a little packing efficiency for an allocator that never
//! has to scan the whole block list under lock.
//!
//! Every allocation this layer hands out carries a small header
//! ([`MS_HEADER_BYTES`]) recording which block it lives in, so `free`
//! never has to search: it reads the header, then goes straight to that
//! block. The header is hidden from callers: [`Self::get_read`] and
//! [`Self::get_write`] both return a pointer already advanced past it.

use std::ptr::NonNull;
use std::sync::{Arc, RwLock};

use crate::util::address_book::AddressBook;
use crate::util::address_table::{CellReadGuard, CellWriteGuard};
use crate::util::constants::MS_HEADER_BYTES;
use crate::util::memory_block::MemoryBlock;
use crate::util::prng::Prng;
use crate::util::vaddr::VAddr;

/// How many of the existing blocks to probe at random before giving up
/// and allocating a fresh one, expressed as a fraction of the current
/// block count.
fn probe_budget(block_count: usize) -> usize {
    block_count.div_ceil(3)
}

/// A read-locked view of one object's bytes, with the Memory Space header
/// already hidden.
pub struct ObjectReadGuard<'a> {
    inner: CellReadGuard<'a>,
}

impl<'a> ObjectReadGuard<'a> {
    pub fn paddr(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.inner.paddr().as_ptr().add(MS_HEADER_BYTES)) }
    }
}

/// A write-locked view of one object's bytes, with the Memory Space header
/// already hidden.
pub struct ObjectWriteGuard<'a> {
    inner: CellWriteGuard<'a>,
}

impl<'a> ObjectWriteGuard<'a> {
    pub fn paddr(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.inner.paddr().as_ptr().add(MS_HEADER_BYTES)) }
    }
}

struct Blocks {
    /// Append-only; each block's index here is exactly the back-pointer
    /// stamped into its objects' headers.
    blocks: Vec<Arc<MemoryBlock>>,
    /// Reserved capacity, doubled whenever `blocks` would grow past it.
    cap: usize,
}

/// The flat object space, backed by a growable set of memory blocks.
pub struct MemorySpace {
    adb: Arc<AddressBook>,
    default_block_bytes: usize,
    blocks: RwLock<Blocks>,
    rng: Prng,
}

unsafe fn read_block_index(paddr: NonNull<u8>) -> usize {
    (paddr.as_ptr() as *const u64).read_unaligned() as usize
}

unsafe fn write_block_index(paddr: NonNull<u8>, index: usize) {
    (paddr.as_ptr() as *mut u64).write_unaligned(index as u64);
}

impl MemorySpace {
    pub fn new(table_cap: usize, default_block_bytes: usize, seed: u64) -> Self {
        MemorySpace {
            adb: Arc::new(AddressBook::new(table_cap)),
            default_block_bytes,
            blocks: RwLock::new(Blocks { blocks: Vec::new(), cap: 0 }),
            rng: Prng::new(seed),
        }
    }

    fn block_count(&self) -> usize {
        self.blocks.read().unwrap().blocks.len()
    }

    fn block(&self, index: usize) -> Arc<MemoryBlock> {
        self.blocks.read().unwrap().blocks[index].clone()
    }

    /// Append a freshly created block and return its index.
    fn push_block(&self, min_bytes: usize) -> usize {
        let mb = Arc::new(MemoryBlock::new(self.adb.clone(), min_bytes));
        let mut guard = self.blocks.write().unwrap();
        if guard.blocks.len() == guard.cap {
            let new_cap = if guard.cap == 0 { 1 } else { guard.cap * 2 };
            guard.blocks.reserve(new_cap - guard.blocks.len());
            guard.cap = new_cap;
        }
        let index = guard.blocks.len();
        guard.blocks.push(mb);
        log::debug!("memory space grew to {} blocks", index + 1);
        index
    }

    /// Allocate `n_bytes` of user-visible space somewhere in the space.
    pub fn malloc(&self, n_bytes: usize) -> VAddr {
        assert!(n_bytes > 0, "memory space malloc of zero bytes");
        let with_header = n_bytes + MS_HEADER_BYTES;

        let block_count = self.block_count();
        let budget = probe_budget(block_count);
        for _ in 0..budget {
            let index = self.rng.gen_range(block_count);
            let mb = self.block(index);
            if let Some(result) = mb.malloc(with_header, true) {
                let mut guard = result.held.expect("malloc(hold=true) always returns a guard");
                unsafe {
                    write_block_index(guard.paddr(), index);
                }
                drop(guard);
                log::trace!("ms: malloc {} in block {index}", result.vaddr);
                return result.vaddr;
            }
        }

        let min_bytes = with_header.max(self.default_block_bytes);
        let index = self.push_block(min_bytes);
        let mb = self.block(index);
        let result = mb.malloc(with_header, true).expect("freshly created block must fit its own request");
        let mut guard = result.held.expect("malloc(hold=true) always returns a guard");
        unsafe {
            write_block_index(guard.paddr(), index);
        }
        drop(guard);
        log::trace!("ms: malloc {} in new block {index}", result.vaddr);
        result.vaddr
    }

    /// Free a previously `malloc`'d object.
    ///
    /// # Panics
    /// If `v` is not currently allocated, a fatal programming error.
    pub fn free(&self, v: VAddr) {
        let index = unsafe { read_block_index(self.adb.get_read(v).paddr()) };
        self.block(index).free(v);
        log::trace!("ms: free {v}");
    }

    pub fn get_read(&self, v: VAddr) -> ObjectReadGuard<'_> {
        ObjectReadGuard { inner: self.adb.get_read(v) }
    }

    pub fn get_write(&self, v: VAddr) -> ObjectWriteGuard<'_> {
        ObjectWriteGuard { inner: self.adb.get_write(v) }
    }

    pub fn try_get_read(&self, v: VAddr) -> Option<ObjectReadGuard<'_>> {
        self.adb.try_get_read(v).map(|inner| ObjectReadGuard { inner })
    }

    pub fn try_get_write(&self, v: VAddr) -> Option<ObjectWriteGuard<'_>> {
        self.adb.try_get_write(v).map(|inner| ObjectWriteGuard { inner })
    }

    /// Run compaction across every block until none has anything left to
    /// shift. Takes a snapshot of the block list so the (possibly slow)
    /// per-block work never holds the block-vector lock.
    pub fn try_full_shift(&self) {
        let snapshot: Vec<Arc<MemoryBlock>> = self.blocks.read().unwrap().blocks.clone();
        for mb in snapshot {
            mb.try_full_shift();
        }
    }

    /// Whether `v` currently names a live object anywhere in this space.
    pub fn allocated(&self, v: VAddr) -> bool {
        self.adb.is_bound(v)
    }

    /// Every currently-allocated VAddr across every block. Used by the
    /// collector's sweep phase.
    pub fn all_vaddrs(&self) -> Vec<VAddr> {
        let snapshot: Vec<Arc<MemoryBlock>> = self.blocks.read().unwrap().blocks.clone();
        snapshot.iter().flat_map(|mb| mb.allocated_vaddrs()).collect()
    }

    /// Total number of objects currently live across every block.
    pub fn count(&self) -> usize {
        let snapshot: Vec<Arc<MemoryBlock>> = self.blocks.read().unwrap().blocks.clone();
        snapshot.iter().map(|mb| mb.count()).sum()
    }

    pub fn block_count_for_test(&self) -> usize {
        self.block_count()
    }
}
