//! L1: the Address Book. A growable sequence of [`AddressTable`]s sharing
//! one free-list of non-full tables, handing out stable
//! [`VAddr`](crate::util::vaddr::VAddr)s that the storage layers above
//! never see invalidated by relocation; only the address *book* grows,
//! individual tables never do.

use std::ptr::NonNull;
use std::sync::RwLock;

use crate::util::address_table::{AddressTable, CellReadGuard, CellWriteGuard, FreeOutcome, PutOutcome};
use crate::util::vaddr::VAddr;

/// A table's position in the free-list doubly-linked through indices,
/// alongside the table itself.
struct TableLink {
    prev: Option<usize>,
    next: Option<usize>,
    in_free_list: bool,
}

struct Inner {
    /// Append-only: tables are never removed, only added.
    tables: Vec<Box<AddressTable>>,
    links: Vec<TableLink>,
    free_head: Option<usize>,
    /// Reserved capacity, doubled whenever `tables` would grow past it.
    book_cap: usize,
}

/// The growable book of address tables.
pub struct AddressBook {
    inner: RwLock<Inner>,
    table_cap: usize,
}

impl AddressBook {
    /// `table_cap` is the fixed capacity every table in this book is
    /// created with.
    pub fn new(table_cap: usize) -> Self {
        AddressBook {
            inner: RwLock::new(Inner { tables: Vec::new(), links: Vec::new(), free_head: None, book_cap: 0 }),
            table_cap,
        }
    }

    /// Append a new, empty table and splice it onto the head of the
    /// free-list. Always takes the book write-lock.
    fn expand(&self) -> usize {
        let mut inner = self.inner.write().unwrap();
        if inner.tables.len() == inner.book_cap {
            let new_cap = if inner.book_cap == 0 { 1 } else { inner.book_cap * 2 };
            inner.tables.reserve(new_cap - inner.tables.len());
            inner.links.reserve(new_cap - inner.links.len());
            inner.book_cap = new_cap;
        }
        let index = inner.tables.len();
        inner.tables.push(Box::new(AddressTable::new(self.table_cap)));
        let old_head = inner.free_head;
        inner.links.push(TableLink { prev: None, next: old_head, in_free_list: true });
        if let Some(h) = old_head {
            inner.links[h].prev = Some(index);
        }
        inner.free_head = Some(index);
        log::debug!("address book expanded to {} tables", inner.tables.len());
        index
    }

    /// Splice `t` out of the free-list if it's still on it and has
    /// actually become full (another thread may have freed a cell in
    /// `t` in the meantime, in which case this is a no-op).
    fn try_removal(&self, t: usize) {
        let mut inner = self.inner.write().unwrap();
        if !inner.links[t].in_free_list || !inner.tables[t].is_full() {
            return;
        }
        let (prev, next) = (inner.links[t].prev, inner.links[t].next);
        match prev {
            Some(p) => inner.links[p].next = next,
            None => inner.free_head = next,
        }
        if let Some(n) = next {
            inner.links[n].prev = prev;
        }
        inner.links[t].in_free_list = false;
    }

    /// Splice `t` back onto the head of the free-list if it isn't
    /// already on it and genuinely has a free cell (symmetric race
    /// check to [`Self::try_removal`]).
    fn try_addition(&self, t: usize) {
        let mut inner = self.inner.write().unwrap();
        if inner.links[t].in_free_list || inner.tables[t].is_full() {
            return;
        }
        let old_head = inner.free_head;
        inner.links[t].prev = None;
        inner.links[t].next = old_head;
        inner.links[t].in_free_list = true;
        if let Some(h) = old_head {
            inner.links[h].prev = Some(t);
        }
        inner.free_head = Some(t);
    }

    /// A snapshot of the current free-list head and a clone-free
    /// reference to that table, taken under the book's read-lock.
    fn table_ref(&self, t: usize) -> &AddressTable {
        let inner = self.inner.read().unwrap();
        let at: &AddressTable = &inner.tables[t];
        // SAFETY: tables are append-only and boxed, so the `AddressTable`
        // they point to outlives the read-lock guard and lives as long as
        // `self` does. Extending the borrow here is sound.
        unsafe { &*(at as *const AddressTable) }
    }

    fn do_put(&self, paddr: NonNull<u8>, install: bool) -> VAddr {
        loop {
            let head = self.inner.read().unwrap().free_head;
            let Some(t) = head else {
                self.expand();
                continue;
            };
            let at = self.table_ref(t);
            let outcome = if install { at.install(paddr, t) } else { at.put(paddr) };
            match outcome {
                PutOutcome::NoSpace => continue,
                PutOutcome::Success { index } => return VAddr { table_index: t, cell_index: index },
                PutOutcome::NewlyFull { index } => {
                    self.try_removal(t);
                    return VAddr { table_index: t, cell_index: index };
                }
            }
        }
    }

    /// Bind `paddr` to a freshly minted VAddr. Does not touch the bytes
    /// at `paddr`.
    pub fn put(&self, paddr: NonNull<u8>) -> VAddr {
        self.do_put(paddr, false)
    }

    /// Like [`Self::put`], additionally stamping the new VAddr into the
    /// bytes immediately before `paddr`.
    pub fn install(&self, paddr: NonNull<u8>) -> VAddr {
        self.do_put(paddr, true)
    }

    pub fn get_read(&self, v: VAddr) -> CellReadGuard<'_> {
        self.table_ref(v.table_index).get_read(v.cell_index)
    }

    pub fn get_write(&self, v: VAddr) -> CellWriteGuard<'_> {
        self.table_ref(v.table_index).get_write(v.cell_index)
    }

    pub fn try_get_read(&self, v: VAddr) -> Option<CellReadGuard<'_>> {
        self.table_ref(v.table_index).try_get_read(v.cell_index)
    }

    pub fn try_get_write(&self, v: VAddr) -> Option<CellWriteGuard<'_>> {
        self.table_ref(v.table_index).try_get_write(v.cell_index)
    }

    /// Relocate the binding at `v`. See
    /// [`CellWriteGuard::relocate`] for the safety contract; `guard`
    /// must be the write guard for `v` obtained from this book.
    ///
    /// # Safety
    /// Same as [`CellWriteGuard::relocate`].
    pub unsafe fn move_cell(&self, v: VAddr, guard: &mut CellWriteGuard<'_>, new_paddr: NonNull<u8>, n_bytes: usize, update_vaddr: bool) {
        debug_assert_eq!(guard.index(), v.cell_index);
        guard.relocate(new_paddr, n_bytes, update_vaddr, v.table_index);
    }

    /// Return the cell at `v` to its table's free stack, adding the
    /// table back onto the book's free-list if it had been full.
    ///
    /// # Panics
    /// If `v`'s cell is already free or out of bounds, both fatal
    /// programming errors.
    pub fn free(&self, v: VAddr) {
        let outcome = self.table_ref(v.table_index).free(v.cell_index);
        if outcome == FreeOutcome::NewlyFree {
            self.try_addition(v.table_index);
        }
    }

    /// Whether `v` currently names a bound cell. Safe to call with an
    /// out-of-range table index (reports `false` rather than panicking).
    pub fn is_bound(&self, v: VAddr) -> bool {
        let inner = self.inner.read().unwrap();
        match inner.tables.get(v.table_index) {
            Some(at) => at.is_bound(v.cell_index),
            None => false,
        }
    }

    /// Total number of bound cells across every table. Read-only.
    pub fn fill(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.tables.iter().map(|t| t.fill()).sum()
    }

    pub fn table_count(&self) -> usize {
        self.inner.read().unwrap().tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_paddr(n: usize) -> NonNull<u8> {
        NonNull::new(n as *mut u8).unwrap()
    }

    #[test]
    fn expands_on_demand() {
        let ab = AddressBook::new(2);
        assert_eq!(ab.table_count(), 0);
        let v1 = ab.put(fake_paddr(0x1000));
        assert_eq!(ab.table_count(), 1);
        let v2 = ab.put(fake_paddr(0x2000));
        // Same table should still be used until full.
        assert_eq!(v1.table_index, v2.table_index);
        // This should have filled the first table and created a second.
        let v3 = ab.put(fake_paddr(0x3000));
        assert_eq!(ab.table_count(), 2);
        assert_ne!(v3.table_index, v1.table_index);
        assert_eq!(ab.fill(), 3);
    }

    #[test]
    fn free_reopens_table_for_reuse() {
        let ab = AddressBook::new(1);
        let v1 = ab.put(fake_paddr(0x1000));
        assert_eq!(ab.table_count(), 1);
        // Table is now full, not on the free-list.
        let v2 = ab.put(fake_paddr(0x2000));
        assert_eq!(ab.table_count(), 2);
        ab.free(v1);
        let v3 = ab.put(fake_paddr(0x1500));
        // v3 should reuse v1's table rather than making a third.
        assert_eq!(v3.table_index, v1.table_index);
        assert_eq!(ab.table_count(), 2);
        ab.free(v2);
        ab.free(v3);
        assert_eq!(ab.fill(), 0);
    }

    #[test]
    fn round_trip_via_get() {
        let ab = AddressBook::new(4);
        let v = ab.put(fake_paddr(0xBEEF));
        assert_eq!(ab.get_read(v).paddr(), fake_paddr(0xBEEF));
    }
}
