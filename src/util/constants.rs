//! Fixed sizes and sentinel values shared across the storage stack.

/// Size in bytes of one word used for piece tags and free-list links.
pub const BYTES_IN_WORD: usize = std::mem::size_of::<u64>();

/// Size in bytes of a serialized [`crate::util::address_book::VAddr`]
/// (two `u64`s: table index, cell index).
pub const BYTES_IN_VADDR: usize = 2 * BYTES_IN_WORD;

/// Bit 0 of a piece tag marks it allocated; the rest of the word is `size`.
pub const MP_ALLOC_MASK: u64 = 0x1;
pub const MP_SIZE_MASK: u64 = !MP_ALLOC_MASK;

/// Header + footer tag words bracket every piece.
pub const MP_PADDING: usize = 2 * BYTES_IN_WORD;

/// A free piece body additionally stores `{prev, next}` size-list links.
pub const MFP_PADDING: usize = MP_PADDING + 2 * BYTES_IN_WORD;

/// An allocated piece body stores its own VAddr before the user region.
pub const MAP_PADDING: usize = MP_PADDING + BYTES_IN_VADDR;

/// Smallest possible piece, large enough to hold whichever of the two
/// paddings above is larger, plus two bytes of user-visible body so a
/// 1-byte allocation request is always satisfiable.
pub const MP_MIN_SIZE: usize = {
    let larger = if MFP_PADDING > MAP_PADDING {
        MFP_PADDING
    } else {
        MAP_PADDING
    };
    larger + 2
};

/// Sentinel size-list / free-stack link meaning "no neighbor".
pub const LIST_NULL: usize = usize::MAX;

/// Bytes the Memory Space prepends to every allocation it hands to a
/// Memory Block, ahead of the user's own bytes: a back-pointer to the
/// owning block (one word) padded out to a VAddr-sized slot so the
/// layout stays word-aligned alongside everything else this stack packs.
pub const MS_HEADER_BYTES: usize = BYTES_IN_VADDR;

/// `{gc_status, rt_len, da_size}`, one word each, prepended to every
/// object's bytes by the Collected Space.
pub const OBJ_HEADER_BYTES: usize = 3 * BYTES_IN_WORD;

static_assertions::const_assert!(MP_MIN_SIZE % 2 == 0);
static_assertions::const_assert!(MAP_PADDING <= MFP_PADDING || MFP_PADDING <= MAP_PADDING);
