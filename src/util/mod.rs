//! The storage stack's L1-L3 layers, plus the small supporting utilities
//! (constants, configuration, logging, and the PRNG) they share.

pub mod address_book;
pub mod address_table;
pub mod constants;
pub mod logger;
pub mod memory_block;
pub mod memory_space;
pub mod options;
pub mod prng;
pub mod vaddr;
