//! tracegc is a concurrent, relocating, tracing garbage-collected object
//! store meant to back a small virtual machine's heap.
//!
//! Logically the crate is a four-layer storage stack, leaves-first:
//! * [`util::address_table::AddressTable`] (L1): a fixed-capacity array of
//!   `(lock, physical pointer)` cells with a free-list threaded through a
//!   stack.
//! * [`util::address_book::AddressBook`] (L1): a growable sequence of
//!   address tables, handing out stable [`util::vaddr::VAddr`]s that stay
//!   valid across relocation.
//! * [`util::memory_block::MemoryBlock`] (L2): one contiguous arena
//!   partitioned into boundary-tagged pieces, with in-place one-step
//!   compaction ("shift").
//! * [`util::memory_space::MemorySpace`] (L3): a growable, randomized-
//!   placement federation of memory blocks sharing one address book.
//! * [`policy::collected_space::CollectedSpace`] (L4): object layout, the
//!   root set, and a tracing mark-sweep collector over the space below.
//!
//! The [`policy::collected_space::CollectedSpace`] is the entry point most
//! embedders want; the lower layers are public so a VM binding can reason
//! about or test them in isolation.

pub mod policy;
pub mod util;
