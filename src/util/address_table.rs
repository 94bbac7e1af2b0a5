//! L1: the Address Table. A fixed-capacity array of `(lock, physical
//! pointer)` cells with a free-list of unused cells threaded through a
//! stack. Never resized once created; see [`crate::util::address_book`]
//! for the growable layer built on top of it.

use std::ptr::NonNull;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::util::vaddr::VAddr;

type Cell = RwLock<Option<NonNull<u8>>>;

/// Outcome of [`AddressTable::put`] / [`AddressTable::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Cell `index` was claimed; the table still has free cells left.
    Success { index: usize },
    /// Cell `index` was claimed; that was the table's last free cell.
    NewlyFull { index: usize },
    /// The table has no free cells.
    NoSpace,
}

impl PutOutcome {
    pub fn index(&self) -> Option<usize> {
        match *self {
            PutOutcome::Success { index } | PutOutcome::NewlyFull { index } => Some(index),
            PutOutcome::NoSpace => None,
        }
    }
}

/// Outcome of [`AddressTable::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// The table had other free cells already.
    Success,
    /// The table was full before this free; it now has exactly one.
    NewlyFree,
}

/// A read-locked view of one cell. The physical pointer is valid only
/// while this guard is alive.
pub struct CellReadGuard<'a> {
    guard: RwLockReadGuard<'a, Option<NonNull<u8>>>,
    index: usize,
}

impl<'a> CellReadGuard<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn paddr(&self) -> NonNull<u8> {
        self.guard.expect("read-locked address table cell has no physical address")
    }
}

/// A write-locked view of one cell.
pub struct CellWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, Option<NonNull<u8>>>,
    index: usize,
}

impl<'a> CellWriteGuard<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn paddr(&self) -> NonNull<u8> {
        self.guard.expect("write-locked address table cell has no physical address")
    }

    /// Relocate the bound object: `memcpy` `n_bytes` from the current
    /// physical address to `new_paddr`, then rebind the cell.  If
    /// `update_vaddr`, also rewrite the VAddr word pair immediately
    /// before `new_paddr` (the piece header the MB layer relies on).
    ///
    /// `table_index` is the index of this cell's owning table in the
    /// Address Book; the AT itself does not retain it (mirroring the
    /// source, where only the `install` call threads a table index
    /// through; `move` needs one too to re-stamp the VAddr, supplied here
    /// by the caller, which is always the Address Book or Memory Block
    /// that already knows it).
    ///
    /// # Safety
    /// `new_paddr` must point to at least `n_bytes` of writable memory,
    /// with `2 * BYTES_IN_WORD` additional writable bytes before it if
    /// `update_vaddr` is set, not concurrently accessed by any other
    /// thread.
    pub unsafe fn relocate(&mut self, new_paddr: NonNull<u8>, n_bytes: usize, update_vaddr: bool, table_index: usize) {
        let old = self.paddr();
        std::ptr::copy(old.as_ptr(), new_paddr.as_ptr(), n_bytes);
        if update_vaddr {
            let v = VAddr { table_index, cell_index: self.index };
            v.write_before(new_paddr);
        }
        *self.guard = Some(new_paddr);
    }
}

/// One fixed-capacity table of `(lock, paddr)` cells.
pub struct AddressTable {
    cap: usize,
    cells: Vec<Cell>,
    free_stack: Mutex<Vec<usize>>,
}

// `NonNull<u8>` is not `Send`/`Sync` by default, but every pointer we
// store is either behind its own `RwLock` (so access is synchronized) or
// transiently handed to a caller who holds that lock.
unsafe impl Send for AddressTable {}
unsafe impl Sync for AddressTable {}

impl AddressTable {
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0, "address table capacity must be positive");
        let cells = (0..cap).map(|_| RwLock::new(None)).collect();
        let free_stack = Mutex::new((0..cap).collect());
        AddressTable { cap, cells, free_stack }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Number of cells currently bound to an address.
    pub fn fill(&self) -> usize {
        self.cap - self.free_stack_len()
    }

    fn free_stack_len(&self) -> usize {
        self.free_stack.lock().unwrap().len()
    }

    pub fn is_full(&self) -> bool {
        self.free_stack_len() == 0
    }

    /// Whether `index` currently names a bound cell. Unlike
    /// [`Self::get_read`]/[`Self::get_write`], out-of-bounds indices are
    /// reported as unbound rather than panicking; this is a query meant
    /// to be safe to call with any previously-issued index.
    pub fn is_bound(&self, index: usize) -> bool {
        index < self.cap && self.cells[index].read().unwrap().is_some()
    }

    fn do_put(&self, paddr: NonNull<u8>, install_table_index: Option<usize>) -> PutOutcome {
        let mut stack = self.free_stack.lock().unwrap();
        let Some(index) = stack.pop() else {
            return PutOutcome::NoSpace;
        };
        let newly_full = stack.is_empty();
        drop(stack);

        {
            let mut cell = self.cells[index].write().unwrap();
            if let Some(table_index) = install_table_index {
                let v = VAddr { table_index, cell_index: index };
                // SAFETY: caller guarantees `paddr` has room before it;
                // nobody else can see `index` until this function returns.
                unsafe { v.write_before(paddr) };
            }
            *cell = Some(paddr);
        }

        if newly_full {
            PutOutcome::NewlyFull { index }
        } else {
            PutOutcome::Success { index }
        }
    }

    /// Bind `paddr` to a fresh cell. Does not touch the bytes at `paddr`.
    pub fn put(&self, paddr: NonNull<u8>) -> PutOutcome {
        self.do_put(paddr, None)
    }

    /// Like [`Self::put`], but also writes the freshly minted VAddr
    /// `(table_index, cell_index)` into the `2 * BYTES_IN_WORD` bytes
    /// immediately before `paddr`; the Memory Block layer relies on
    /// this to recover a piece's own VAddr from its body.
    pub fn install(&self, paddr: NonNull<u8>, table_index: usize) -> PutOutcome {
        self.do_put(paddr, Some(table_index))
    }

    fn check_index(&self, index: usize) {
        assert!(index < self.cap, "address table cell index {index} out of bounds (cap {})", self.cap);
    }

    pub fn get_read(&self, index: usize) -> CellReadGuard<'_> {
        self.check_index(index);
        CellReadGuard { guard: self.cells[index].read().unwrap(), index }
    }

    pub fn get_write(&self, index: usize) -> CellWriteGuard<'_> {
        self.check_index(index);
        CellWriteGuard { guard: self.cells[index].write().unwrap(), index }
    }

    pub fn try_get_read(&self, index: usize) -> Option<CellReadGuard<'_>> {
        self.check_index(index);
        self.cells[index].try_read().ok().map(|guard| CellReadGuard { guard, index })
    }

    pub fn try_get_write(&self, index: usize) -> Option<CellWriteGuard<'_>> {
        self.check_index(index);
        self.cells[index].try_write().ok().map(|guard| CellWriteGuard { guard, index })
    }

    /// Return a bound cell to the free stack.
    ///
    /// # Panics
    /// If `index` is out of bounds or the cell is already free, both are
    /// fatal programming errors per the storage contract, not recoverable
    /// conditions.
    pub fn free(&self, index: usize) -> FreeOutcome {
        self.check_index(index);
        {
            // Clear under the cell's own write lock so a get_write racing
            // with this free can't observe a stale paddr after the index
            // is back on the free stack.
            let mut cell = self.cells[index].write().unwrap();
            assert!(cell.is_some(), "double free of address table cell {index}");
            *cell = None;
        }
        let mut stack = self.free_stack.lock().unwrap();
        let was_full = stack.is_empty();
        stack.push(index);
        if was_full {
            FreeOutcome::NewlyFree
        } else {
            FreeOutcome::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_paddr(n: usize) -> NonNull<u8> {
        NonNull::new(n as *mut u8).unwrap()
    }

    #[test]
    fn put_fills_table_and_reports_newly_full() {
        let at = AddressTable::new(2);
        let r1 = at.put(fake_paddr(0x1000));
        assert!(matches!(r1, PutOutcome::Success { .. }));
        let r2 = at.put(fake_paddr(0x2000));
        assert!(matches!(r2, PutOutcome::NewlyFull { .. }));
        assert!(at.is_full());
        let r3 = at.put(fake_paddr(0x3000));
        assert_eq!(r3, PutOutcome::NoSpace);
    }

    #[test]
    fn free_reports_newly_free_then_success() {
        let at = AddressTable::new(2);
        let i0 = at.put(fake_paddr(0x1000)).index().unwrap();
        let i1 = at.put(fake_paddr(0x2000)).index().unwrap();
        assert_eq!(at.free(i0), FreeOutcome::NewlyFree);
        assert_eq!(at.fill(), 1);
        let i0b = at.put(fake_paddr(0x1500)).index().unwrap();
        assert_eq!(i0b, i0);
        assert_eq!(at.free(i1), FreeOutcome::Success);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let at = AddressTable::new(1);
        let i = at.put(fake_paddr(0x1000)).index().unwrap();
        at.free(i);
        at.free(i);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_get_panics() {
        let at = AddressTable::new(1);
        let _ = at.get_read(5);
    }

    #[test]
    fn get_read_reflects_current_paddr() {
        let at = AddressTable::new(1);
        let i = at.put(fake_paddr(0x4000)).index().unwrap();
        assert_eq!(at.get_read(i).paddr(), fake_paddr(0x4000));
    }
}
