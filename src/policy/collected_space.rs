//! L4: the Collected Space. Layers object semantics (a header, a
//! reference table, and a raw data array) over [`MemorySpace`]
//! allocations, owns the root set, and runs a tracing mark-sweep
//! collector over the reference graph those objects form.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::policy::gc_worker::GcWorker;
use crate::util::constants::{BYTES_IN_VADDR, BYTES_IN_WORD, LIST_NULL, OBJ_HEADER_BYTES};
use crate::util::logger;
use crate::util::memory_space::{MemorySpace, ObjectReadGuard, ObjectWriteGuard};
use crate::util::options::{CollectedSpaceConfig, GcWorkerSpec};
use crate::util::vaddr::{VAddr, NULL_VADDR};

/// An object's standing with respect to the current (or most recent)
/// tracing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::FromRepr)]
#[repr(u64)]
pub enum GcStatus {
    /// Allocated during the collection cycle currently in progress; exempt
    /// from that cycle's sweep regardless of reachability, since the root
    /// snapshot it's checked against was taken before the object existed.
    NewlyAdded = 0,
    /// Not reached by the last mark phase; swept on the next cycle unless
    /// a fresh mark reaches it first.
    Unvisited = 1,
    /// Reached by the current mark phase; downgraded to `Unvisited` at
    /// the end of sweep so the next cycle can re-establish reachability.
    Visited = 2,
    /// Permanently live root object; never swept.
    Root = 3,
}

/// Programming-error channel at the CS boundary. Mirrors the source's
/// `cs_status_code`; everything below AT/AB/MB (the allocator's own
/// invariants) still panics, since those really are unrecoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CsStatus {
    Success,
    /// A root with a zero-length reference table was requested.
    EmptyRootCreation,
    /// An object with both a zero-length reference table and a
    /// zero-size data array was requested.
    EmptyObjectCreation,
    /// A root id was out of range for the root set.
    RootIndexOutOfBounds,
    /// A root id named a currently-unbound (free) root entry.
    RootIndexInvalid,
    /// A reference-table offset was out of range for the object's
    /// `rt_len`.
    RootOffsetOutOfBounds,
}

// ---- raw object-header/reference-table accessors ---------------------------
//
// Layout of an object's bytes, as handed back by `MemorySpace::get_read`/
// `get_write` (which has already hidden the MS's own back-pointer header):
//   { gc_status: u64, rt_len: u64, da_size: u64, rt[rt_len]: VAddr, data[da_size] }

unsafe fn header_status(paddr: NonNull<u8>) -> GcStatus {
    let raw = (paddr.as_ptr() as *const u64).read_unaligned();
    GcStatus::from_repr(raw).expect("corrupt gc_status word")
}

unsafe fn set_header_status(paddr: NonNull<u8>, status: GcStatus) {
    (paddr.as_ptr() as *mut u64).write_unaligned(status as u64);
}

unsafe fn header_rt_len(paddr: NonNull<u8>) -> usize {
    (paddr.as_ptr().add(BYTES_IN_WORD) as *const u64).read_unaligned() as usize
}

unsafe fn header_da_size(paddr: NonNull<u8>) -> usize {
    (paddr.as_ptr().add(2 * BYTES_IN_WORD) as *const u64).read_unaligned() as usize
}

unsafe fn write_header(paddr: NonNull<u8>, status: GcStatus, rt_len: usize, da_size: usize) {
    let base = paddr.as_ptr() as *mut u64;
    base.write_unaligned(status as u64);
    base.add(1).write_unaligned(rt_len as u64);
    base.add(2).write_unaligned(da_size as u64);
}

unsafe fn rt_slot_ptr(paddr: NonNull<u8>, i: usize) -> *mut u8 {
    paddr.as_ptr().add(OBJ_HEADER_BYTES + i * BYTES_IN_VADDR)
}

unsafe fn read_rt_slot(paddr: NonNull<u8>, i: usize) -> VAddr {
    let p = rt_slot_ptr(paddr, i) as *const u64;
    VAddr { table_index: p.read_unaligned() as usize, cell_index: p.add(1).read_unaligned() as usize }
}

unsafe fn write_rt_slot(paddr: NonNull<u8>, i: usize, v: VAddr) {
    let p = rt_slot_ptr(paddr, i) as *mut u64;
    p.write_unaligned(v.table_index as u64);
    p.add(1).write_unaligned(v.cell_index as u64);
}

unsafe fn data_ptr(paddr: NonNull<u8>, rt_len: usize) -> *mut u8 {
    paddr.as_ptr().add(OBJ_HEADER_BYTES + rt_len * BYTES_IN_VADDR)
}

/// A read-locked, typed view of one object's header, reference table, and
/// data array.
pub struct ObjectReadView<'a> {
    guard: ObjectReadGuard<'a>,
}

impl<'a> ObjectReadView<'a> {
    pub fn gc_status(&self) -> GcStatus {
        unsafe { header_status(self.guard.paddr()) }
    }

    pub fn rt_len(&self) -> usize {
        unsafe { header_rt_len(self.guard.paddr()) }
    }

    pub fn da_size(&self) -> usize {
        unsafe { header_da_size(self.guard.paddr()) }
    }

    pub fn rt(&self, i: usize) -> VAddr {
        assert!(i < self.rt_len(), "reference table index {i} out of bounds");
        unsafe { read_rt_slot(self.guard.paddr(), i) }
    }

    pub fn data(&self) -> &[u8] {
        let (rt_len, da_size) = (self.rt_len(), self.da_size());
        unsafe { std::slice::from_raw_parts(data_ptr(self.guard.paddr(), rt_len), da_size) }
    }
}

/// A write-locked, typed view of one object's header, reference table,
/// and data array.
pub struct ObjectWriteView<'a> {
    guard: ObjectWriteGuard<'a>,
}

impl<'a> ObjectWriteView<'a> {
    pub fn gc_status(&self) -> GcStatus {
        unsafe { header_status(self.guard.paddr()) }
    }

    pub fn rt_len(&self) -> usize {
        unsafe { header_rt_len(self.guard.paddr()) }
    }

    pub fn da_size(&self) -> usize {
        unsafe { header_da_size(self.guard.paddr()) }
    }

    pub fn rt(&self, i: usize) -> VAddr {
        assert!(i < self.rt_len(), "reference table index {i} out of bounds");
        unsafe { read_rt_slot(self.guard.paddr(), i) }
    }

    pub fn set_rt(&mut self, i: usize, v: VAddr) {
        assert!(i < self.rt_len(), "reference table index {i} out of bounds");
        unsafe { write_rt_slot(self.guard.paddr(), i, v) }
    }

    pub fn data(&self) -> &[u8] {
        let (rt_len, da_size) = (self.rt_len(), self.da_size());
        unsafe { std::slice::from_raw_parts(data_ptr(self.guard.paddr(), rt_len), da_size) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let (rt_len, da_size) = (self.rt_len(), self.da_size());
        unsafe { std::slice::from_raw_parts_mut(data_ptr(self.guard.paddr(), rt_len), da_size) }
    }
}

/// One entry in the root set: either bound to a permanently-live object,
/// or threaded onto the free stack via `next`.
enum RootEntry {
    Free { next: usize },
    Bound { vaddr: VAddr },
}

struct RootSet {
    entries: Vec<RootEntry>,
    free_head: usize,
    /// Reserved capacity, doubled whenever `entries` would grow past it.
    cap: usize,
}

/// The object layer, root set, and mark-sweep collector.
pub struct CollectedSpace {
    ms: MemorySpace,
    roots: RwLock<RootSet>,
    /// Serializes collection cycles; held only for the duration of
    /// `collect_garbage` so two threads can never sweep the same
    /// snapshot concurrently.
    collecting: Mutex<()>,
    /// Allocations observed since the last collection cycle completed;
    /// reset by `collect_garbage`, consulted by the background worker's
    /// `shift_trigger`.
    allocations_since_last_gc: AtomicU64,
    gc_worker: Mutex<Option<GcWorker>>,
    /// Set for the duration of a `collect_garbage` call (mark start to
    /// sweep end). Lets `malloc_object` distinguish two cases that would
    /// otherwise collapse into a single `NEWLY_ADDED` status: an object
    /// created while no cycle is running is given to the *next* cycle as
    /// a plain `UNVISITED` object, so an unreachable object is reclaimed
    /// the first time a cycle ever sees it; an object created by another
    /// thread while a cycle is actively marking/sweeping is `NEWLY_ADDED`
    /// and exempted from *that* cycle's sweep, since it may not be
    /// reachable from the root snapshot already taken. See `DESIGN.md`.
    collecting_active: AtomicBool,
}

impl CollectedSpace {
    pub fn new(config: CollectedSpaceConfig) -> Self {
        logger::try_init();
        CollectedSpace {
            ms: MemorySpace::new(config.table_cap, config.default_block_bytes, config.seed),
            roots: RwLock::new(RootSet { entries: Vec::new(), free_head: LIST_NULL, cap: 0 }),
            collecting: Mutex::new(()),
            allocations_since_last_gc: AtomicU64::new(0),
            gc_worker: Mutex::new(None),
            collecting_active: AtomicBool::new(false),
        }
    }

    fn alloc_object_bytes(&self, rt_len: usize, da_size: usize, status: GcStatus) -> VAddr {
        let total = OBJ_HEADER_BYTES + rt_len * BYTES_IN_VADDR + da_size;
        let v = self.ms.malloc(total);
        let mut guard = self.ms.get_write(v);
        unsafe {
            write_header(guard.paddr(), status, rt_len, da_size);
            for i in 0..rt_len {
                write_rt_slot(guard.paddr(), i, NULL_VADDR);
            }
        }
        self.allocations_since_last_gc.fetch_add(1, Ordering::Relaxed);
        log::trace!("cs: allocated {v} (rt_len={rt_len}, da_size={da_size}, status={status:?})");
        v
    }

    /// The status a freshly `malloc_object`'d (non-root) object should
    /// start with: see `collecting_active`'s doc comment.
    fn initial_object_status(&self) -> GcStatus {
        if self.collecting_active.load(Ordering::Acquire) {
            GcStatus::NewlyAdded
        } else {
            GcStatus::Unvisited
        }
    }

    /// Allocations observed since the last completed collection cycle.
    pub fn allocations_since_last_gc(&self) -> u64 {
        self.allocations_since_last_gc.load(Ordering::Relaxed)
    }

    /// Start a background thread that periodically runs `collect_garbage`
    /// (and, if configured, `try_full_shift`) on `self`. Requires `self` to
    /// be held through an `Arc` since the worker thread outlives this call.
    ///
    /// # Panics
    /// If a worker is already running; call `stop_gc` first.
    pub fn start_gc(self: &Arc<Self>, spec: GcWorkerSpec) {
        let mut slot = self.gc_worker.lock().unwrap();
        assert!(slot.is_none(), "gc worker already running");
        *slot = Some(GcWorker::spawn(self.clone(), spec));
    }

    /// Stop the background GC worker started by `start_gc`, joining its
    /// thread. A no-op if no worker is running.
    pub fn stop_gc(&self) {
        if let Some(worker) = self.gc_worker.lock().unwrap().take() {
            worker.stop();
        }
    }

    // ---- object layer ---------------------------------------------------

    /// Allocate a new object with `rt_len` reference slots (all
    /// initialized to `NULL_V`) and `da_size` bytes of uninitialized data.
    pub fn malloc_object(&self, rt_len: usize, da_size: usize) -> Result<VAddr, CsStatus> {
        if rt_len == 0 && da_size == 0 {
            return Err(CsStatus::EmptyObjectCreation);
        }
        Ok(self.alloc_object_bytes(rt_len, da_size, self.initial_object_status()))
    }

    pub fn get_read_ind(&self, v: VAddr) -> ObjectReadView<'_> {
        ObjectReadView { guard: self.ms.get_read(v) }
    }

    pub fn get_write_ind(&self, v: VAddr) -> ObjectWriteView<'_> {
        ObjectWriteView { guard: self.ms.get_write(v) }
    }

    pub fn try_get_read_ind(&self, v: VAddr) -> Option<ObjectReadView<'_>> {
        self.ms.try_get_read(v).map(|guard| ObjectReadView { guard })
    }

    pub fn try_get_write_ind(&self, v: VAddr) -> Option<ObjectWriteView<'_>> {
        self.ms.try_get_write(v).map(|guard| ObjectWriteView { guard })
    }

    pub fn allocated(&self, v: VAddr) -> bool {
        self.ms.allocated(v)
    }

    // ---- root set ---------------------------------------------------------

    /// Allocate a new permanently-live root object with `rt_len`
    /// reference slots and `da_size` bytes of data.
    pub fn malloc_root(&self, rt_len: usize, da_size: usize) -> Result<usize, CsStatus> {
        if rt_len == 0 {
            return Err(CsStatus::EmptyRootCreation);
        }
        let v = self.alloc_object_bytes(rt_len, da_size, GcStatus::Root);
        let mut roots = self.roots.write().unwrap();
        let id = if roots.free_head == LIST_NULL {
            if roots.entries.len() == roots.cap {
                let new_cap = if roots.cap == 0 { 1 } else { roots.cap * 2 };
                roots.entries.reserve(new_cap - roots.entries.len());
                roots.cap = new_cap;
            }
            let id = roots.entries.len();
            roots.entries.push(RootEntry::Bound { vaddr: v });
            id
        } else {
            let id = roots.free_head;
            let next = match roots.entries[id] {
                RootEntry::Free { next } => next,
                RootEntry::Bound { .. } => unreachable!("free_head names a bound root entry"),
            };
            roots.entries[id] = RootEntry::Bound { vaddr: v };
            roots.free_head = next;
            id
        };
        Ok(id)
    }

    pub fn get_root_vaddr(&self, root_id: usize) -> Result<VAddr, CsStatus> {
        let roots = self.roots.read().unwrap();
        match roots.entries.get(root_id) {
            None => Err(CsStatus::RootIndexOutOfBounds),
            Some(RootEntry::Free { .. }) => Err(CsStatus::RootIndexInvalid),
            Some(RootEntry::Bound { vaddr }) => Ok(*vaddr),
        }
    }

    /// Demote the object's status to `Unvisited` and return its id to the
    /// free stack. The object itself is only reclaimed by a subsequent
    /// collection that finds no path to it.
    pub fn deroot(&self, root_id: usize) -> Result<(), CsStatus> {
        let v = {
            let mut roots = self.roots.write().unwrap();
            match roots.entries.get(root_id) {
                None => return Err(CsStatus::RootIndexOutOfBounds),
                Some(RootEntry::Free { .. }) => return Err(CsStatus::RootIndexInvalid),
                Some(RootEntry::Bound { vaddr }) => {
                    let v = *vaddr;
                    roots.entries[root_id] = RootEntry::Free { next: roots.free_head };
                    roots.free_head = root_id;
                    v
                }
            }
        };
        let mut guard = self.ms.get_write(v);
        unsafe { set_header_status(guard.paddr(), GcStatus::Unvisited) };
        Ok(())
    }

    /// Create a new root whose reference table is a truncated or
    /// zero-extended copy of an existing root's.
    pub fn copy_root(&self, root_id: usize, rt_len: usize) -> Result<usize, CsStatus> {
        let src_v = self.get_root_vaddr(root_id)?;
        if rt_len == 0 {
            return Err(CsStatus::EmptyRootCreation);
        }
        let src_values: Vec<VAddr> = {
            let guard = self.ms.get_read(src_v);
            let copy_len = rt_len.min(unsafe { header_rt_len(guard.paddr()) });
            (0..copy_len).map(|i| unsafe { read_rt_slot(guard.paddr(), i) }).collect()
        };
        let new_id = self.malloc_root(rt_len, 0)?;
        let new_v = self.get_root_vaddr(new_id)?;
        let mut guard = self.ms.get_write(new_v);
        for (i, val) in src_values.into_iter().enumerate() {
            unsafe { write_rt_slot(guard.paddr(), i, val) };
        }
        Ok(new_id)
    }

    // ---- reference-graph convenience ops (supplemented from gc_src/cs.c) --

    /// `rt[offset] = NULL_V`.
    pub fn null_reference(&self, v: VAddr, offset: usize) -> Result<(), CsStatus> {
        let mut guard = self.ms.get_write(v);
        if offset >= unsafe { header_rt_len(guard.paddr()) } {
            return Err(CsStatus::RootOffsetOutOfBounds);
        }
        unsafe { write_rt_slot(guard.paddr(), offset, NULL_VADDR) };
        Ok(())
    }

    /// `rt[dest_offset] = rt[src_offset]`, within one object.
    pub fn move_reference(&self, v: VAddr, dest_offset: usize, src_offset: usize) -> Result<(), CsStatus> {
        let mut guard = self.ms.get_write(v);
        let rt_len = unsafe { header_rt_len(guard.paddr()) };
        if dest_offset >= rt_len || src_offset >= rt_len {
            return Err(CsStatus::RootOffsetOutOfBounds);
        }
        let src_val = unsafe { read_rt_slot(guard.paddr(), src_offset) };
        unsafe { write_rt_slot(guard.paddr(), dest_offset, src_val) };
        Ok(())
    }

    /// `rt[dest_offset] = rt[src_offset]->rt[src_rt_offset]`: a one-hop
    /// indirect load across the reference graph. Never holds two
    /// objects' cell locks at once: there is no defined lock order
    /// between arbitrary objects, so each hop is read, released, then
    /// the next is taken.
    pub fn load_reference(&self, v: VAddr, dest_offset: usize, src_offset: usize, src_rt_offset: usize) -> Result<(), CsStatus> {
        let mid = {
            let guard = self.ms.get_read(v);
            if src_offset >= unsafe { header_rt_len(guard.paddr()) } {
                return Err(CsStatus::RootOffsetOutOfBounds);
            }
            unsafe { read_rt_slot(guard.paddr(), src_offset) }
        };
        let loaded = {
            let guard = self.ms.get_read(mid);
            if src_rt_offset >= unsafe { header_rt_len(guard.paddr()) } {
                return Err(CsStatus::RootOffsetOutOfBounds);
            }
            unsafe { read_rt_slot(guard.paddr(), src_rt_offset) }
        };
        let mut guard = self.ms.get_write(v);
        if dest_offset >= unsafe { header_rt_len(guard.paddr()) } {
            return Err(CsStatus::RootOffsetOutOfBounds);
        }
        unsafe { write_rt_slot(guard.paddr(), dest_offset, loaded) };
        Ok(())
    }

    /// `rt[dest_offset]->rt[dest_rt_offset] = rt[src_offset]`.
    pub fn store_reference(&self, v: VAddr, dest_offset: usize, dest_rt_offset: usize, src_offset: usize) -> Result<(), CsStatus> {
        let (dest_obj, src_val) = {
            let guard = self.ms.get_read(v);
            let rt_len = unsafe { header_rt_len(guard.paddr()) };
            if dest_offset >= rt_len || src_offset >= rt_len {
                return Err(CsStatus::RootOffsetOutOfBounds);
            }
            (unsafe { read_rt_slot(guard.paddr(), dest_offset) }, unsafe { read_rt_slot(guard.paddr(), src_offset) })
        };
        let mut guard = self.ms.get_write(dest_obj);
        if dest_rt_offset >= unsafe { header_rt_len(guard.paddr()) } {
            return Err(CsStatus::RootOffsetOutOfBounds);
        }
        unsafe { write_rt_slot(guard.paddr(), dest_rt_offset, src_val) };
        Ok(())
    }

    // ---- collector ----------------------------------------------------------

    /// Run one full tracing mark-sweep cycle.
    pub fn collect_garbage(&self) {
        let _collecting = self.collecting.lock().unwrap();
        self.collecting_active.store(true, Ordering::Release);

        // Snapshot the root set under its write-lock to avoid a torn
        // view, then release it before touching any object.
        let mut stack: Vec<VAddr> = {
            let roots = self.roots.write().unwrap();
            roots
                .entries
                .iter()
                .filter_map(|e| match e {
                    RootEntry::Bound { vaddr } => Some(*vaddr),
                    RootEntry::Free { .. } => None,
                })
                .collect()
        };

        let mut seen: HashSet<VAddr> = HashSet::new();
        while let Some(v) = stack.pop() {
            if !seen.insert(v) {
                continue;
            }
            let mut guard = self.ms.get_write(v);
            unsafe {
                if header_status(guard.paddr()) != GcStatus::Root {
                    set_header_status(guard.paddr(), GcStatus::Visited);
                }
                let rt_len = header_rt_len(guard.paddr());
                for i in 0..rt_len {
                    let child = read_rt_slot(guard.paddr(), i);
                    if !child.is_null() {
                        stack.push(child);
                    }
                }
            }
        }

        let live = seen.len();
        let freed = self.sweep();
        self.allocations_since_last_gc.store(0, Ordering::Relaxed);
        self.collecting_active.store(false, Ordering::Release);
        log::info!("cs: collection cycle complete ({live} live, {freed} freed)");
    }

    fn sweep(&self) -> usize {
        let mut freed = 0;
        for v in self.ms.all_vaddrs() {
            let mut guard = self.ms.get_write(v);
            let status = unsafe { header_status(guard.paddr()) };
            match status {
                // A NEWLY_ADDED object survives this cycle regardless of
                // reachability; the next cycle sees it as plain
                // UNVISITED and reclaims it if still unreached.
                GcStatus::Visited | GcStatus::NewlyAdded => unsafe { set_header_status(guard.paddr(), GcStatus::Unvisited) },
                GcStatus::Root => {}
                GcStatus::Unvisited => {
                    drop(guard);
                    self.ms.free(v);
                    freed += 1;
                }
            }
        }
        freed
    }

    pub fn try_full_shift(&self) {
        self.ms.try_full_shift();
    }

    pub fn ms_count(&self) -> usize {
        self.ms.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs() -> CollectedSpace {
        CollectedSpace::new(CollectedSpaceConfig { table_cap: 16, default_block_bytes: 1000, seed: 7 })
    }

    #[test]
    fn rejects_empty_object() {
        let cs = cs();
        assert_eq!(cs.malloc_object(0, 0), Err(CsStatus::EmptyObjectCreation));
    }

    #[test]
    fn rejects_empty_root() {
        let cs = cs();
        assert_eq!(cs.malloc_root(0, 8), Err(CsStatus::EmptyRootCreation));
    }

    #[test]
    fn s1_basic_lifecycle() {
        let cs = cs();
        let r = cs.malloc_root(1, 0).unwrap();
        let v = cs.malloc_object(0, 8).unwrap();
        {
            let mut view = cs.get_write_ind(v);
            view.data_mut()[0] = 0x42;
        }
        let root_v = cs.get_root_vaddr(r).unwrap();
        cs.get_write_ind(root_v).set_rt(0, v);

        cs.collect_garbage();
        assert!(cs.allocated(v));

        cs.get_write_ind(root_v).set_rt(0, NULL_VADDR);
        cs.collect_garbage();
        assert!(!cs.allocated(v));
    }

    #[test]
    fn s2_cycle_reclamation() {
        let cs = cs();
        let a = cs.malloc_object(1, 0).unwrap();
        let b = cs.malloc_object(1, 0).unwrap();
        cs.get_write_ind(a).set_rt(0, b);
        cs.get_write_ind(b).set_rt(0, a);
        cs.collect_garbage();
        assert!(!cs.allocated(a));
        assert!(!cs.allocated(b));
    }

    #[test]
    fn s4_root_free_list_reuse() {
        let cs = cs();
        let ids: Vec<usize> = (0..8).map(|_| cs.malloc_root(1, 0).unwrap()).collect();
        for &i in &[0, 2, 4, 6] {
            cs.deroot(ids[i]).unwrap();
        }
        cs.collect_garbage();
        let mut reused: Vec<usize> = (0..4).map(|_| cs.malloc_root(1, 0).unwrap()).collect();
        reused.sort_unstable();
        let mut expected = vec![ids[0], ids[2], ids[4], ids[6]];
        expected.sort_unstable();
        assert_eq!(reused, expected);
    }

    #[test]
    fn double_collect_is_idempotent() {
        let cs = cs();
        let a = cs.malloc_object(0, 8).unwrap();
        let _ = a;
        cs.collect_garbage();
        let before = cs.ms_count();
        cs.collect_garbage();
        assert_eq!(cs.ms_count(), before);
    }

    #[test]
    fn reference_convenience_ops() {
        let cs = cs();
        let r = cs.malloc_root(2, 0).unwrap();
        let root_v = cs.get_root_vaddr(r).unwrap();
        let a = cs.malloc_object(1, 0).unwrap();
        let b = cs.malloc_object(1, 0).unwrap();
        cs.get_write_ind(root_v).set_rt(0, a);
        cs.get_write_ind(a).set_rt(0, b);

        cs.move_reference(root_v, 1, 0).unwrap();
        assert_eq!(cs.get_read_ind(root_v).rt(1), a);

        cs.store_reference(root_v, 0, 0, 1).unwrap();
        assert_eq!(cs.get_read_ind(a).rt(0), a);

        cs.null_reference(root_v, 1).unwrap();
        assert!(cs.get_read_ind(root_v).rt(1).is_null());

        assert_eq!(cs.null_reference(root_v, 99), Err(CsStatus::RootOffsetOutOfBounds));
    }

    #[test]
    fn copy_root_truncates_and_extends() {
        let cs = cs();
        let r = cs.malloc_root(3, 0).unwrap();
        let root_v = cs.get_root_vaddr(r).unwrap();
        let a = cs.malloc_object(1, 0).unwrap();
        cs.get_write_ind(root_v).set_rt(0, a);

        let shorter = cs.copy_root(r, 1).unwrap();
        let shorter_v = cs.get_root_vaddr(shorter).unwrap();
        assert_eq!(cs.get_read_ind(shorter_v).rt(0), a);

        let longer = cs.copy_root(r, 5).unwrap();
        let longer_v = cs.get_root_vaddr(longer).unwrap();
        assert_eq!(cs.get_read_ind(longer_v).rt(0), a);
        assert!(cs.get_read_ind(longer_v).rt(4).is_null());
    }

    #[test]
    fn gc_worker_reclaims_unrooted_garbage_in_background() {
        use crate::util::options::GcWorkerSpec;
        use std::time::Duration;

        let cs = std::sync::Arc::new(cs());
        let r = cs.malloc_root(1, 0).unwrap();
        let root_v = cs.get_root_vaddr(r).unwrap();
        let v = cs.malloc_object(0, 8).unwrap();
        cs.get_write_ind(root_v).set_rt(0, v);
        cs.get_write_ind(root_v).set_rt(0, NULL_VADDR);

        cs.start_gc(GcWorkerSpec { delay: Duration::from_millis(5), shift: false, shift_trigger: 0 });
        let mut waited = Duration::ZERO;
        while cs.allocated(v) && waited < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        cs.stop_gc();
        assert!(!cs.allocated(v));
    }
}
