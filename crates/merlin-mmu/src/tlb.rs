//! Software translation cache with revision-based invalidation.
//!
//! Entries are direct-mapped and tagged with the virtual page number OR'd with
//! the cache's current *virtual revision*. Bulk invalidation bumps the
//! revision, which makes every live tag unmatchable without touching the
//! entries; individual pages are invalidated by zeroing a single tag.
//!
//! A second, *physical* revision lives in the upper bits of each entry's flag
//! word. It is bumped (atomically, possibly from another thread) whenever the
//! host-side view of guest physical pages changes; entries whose stored
//! physical revision no longer matches keep their translation but must refresh
//! the physical-state flags before the next use.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Number of entries per cache. The index is the low 8 bits of the tag, so a
/// lookup needs no hashing.
pub const TLB_ENTRY_COUNT: usize = 256;

/// Virtual-revision increment. Tags hold a 48-bit address shifted right by
/// the page shift (36 bits), so the revision occupies bits 36..64.
pub const TLB_REVISION_INCR: u64 = 1 << 36;

/// Physical-revision increment. Flag bits 0..=8 are entry flags; the
/// physical revision occupies bits 9..64.
pub const TLB_PHYS_REV_INCR: u64 = 1 << 9;

/// Page tables: not executable.
pub const TLBE_F_PT_NO_EXEC: u64 = 1 << 0;
/// Page tables: not writable.
pub const TLBE_F_PT_NO_WRITE: u64 = 1 << 1;
/// Page tables: supervisor only.
pub const TLBE_F_PT_NO_USER: u64 = 1 << 2;
/// Physical page: not directly writable (write handler, ROM, ...).
pub const TLBE_F_PG_NO_WRITE: u64 = 1 << 3;
/// Physical page: not directly readable (MMIO, read handler, ...).
pub const TLBE_F_PG_NO_READ: u64 = 1 << 4;
/// Page tables: accessed bit still needs to be set.
pub const TLBE_F_PT_NO_ACCESSED: u64 = 1 << 5;
/// Page tables: dirty bit still needs to be set on write.
pub const TLBE_F_PT_NO_DIRTY: u64 = 1 << 6;
/// No direct host mapping for this page; accesses must be staged.
pub const TLBE_F_NO_DIRECT: u64 = 1 << 7;
/// Physical page: unassigned (neither RAM, ROM nor MMIO).
pub const TLBE_F_PG_UNASSIGNED: u64 = 1 << 8;
/// Mask of the physical revision inside `flags_and_phys_rev`.
pub const TLBE_PHYS_REV_MASK: u64 = !(TLB_PHYS_REV_INCR - 1);

/// Flag bits owned by the physical side, rewritten on a phys-revision
/// refresh.
pub const TLBE_PHYS_FLAGS: u64 =
    TLBE_F_PG_NO_WRITE | TLBE_F_PG_NO_READ | TLBE_F_NO_DIRECT | TLBE_F_PG_UNASSIGNED;

// Leaf addresses are at least 4-byte aligned, so bit 0 of the stored leaf
// address doubles as the "8-byte leaf entry" marker.
const LEAF_IS_64: u64 = 1 << 0;

#[derive(Debug, Clone, Copy, Default)]
pub struct TlbEntry {
    /// Virtual page number | virtual revision. Zero means invalid (the
    /// revision is never zero).
    pub tag: u64,
    /// Flag bits 0..=8 plus the physical revision in bits 9..64.
    pub flags_and_phys_rev: u64,
    /// Physical base of the 4KiB page.
    pub page_phys: u64,
    /// Physical address of the leaf paging-structure entry, with bit 0
    /// encoding whether the leaf is a 64-bit entry.
    leaf: u64,
}

impl TlbEntry {
    #[inline]
    pub fn set_leaf(&mut self, leaf_addr: u64, leaf_is_64: bool) {
        debug_assert_eq!(leaf_addr & 0x3, 0);
        self.leaf = leaf_addr | if leaf_is_64 { LEAF_IS_64 } else { 0 };
    }

    #[inline]
    pub fn leaf_addr(&self) -> u64 {
        self.leaf & !LEAF_IS_64
    }

    #[inline]
    pub fn leaf_is_64(&self) -> bool {
        self.leaf & LEAF_IS_64 != 0
    }

    /// Physical address for a virtual address covered by this entry.
    #[inline]
    pub fn translate(&self, vaddr: u64) -> u64 {
        self.page_phys | (vaddr & 0xfff)
    }
}

/// One software TLB bank. A virtual CPU owns two: code fetch and data.
#[derive(Debug)]
pub struct TranslationCache {
    entries: Box<[TlbEntry; TLB_ENTRY_COUNT]>,
    /// Current virtual revision (bits 36..64, never zero).
    revision: u64,
    /// Current physical revision (bits 9..64, never zero). Atomic because
    /// other threads may bump it during a physical-map invalidation
    /// broadcast; the broadcaster must hold the platform physical-map lock.
    phys_rev: AtomicU64,
    /// Set when the physical revision wrapped; the owning vCPU wipes the
    /// physical-state fields of all entries on its next lookup.
    phys_wrap_pending: AtomicBool,
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses (including revision mismatches).
    pub misses: u64,
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationCache {
    pub fn new() -> Self {
        Self {
            entries: Box::new([TlbEntry::default(); TLB_ENTRY_COUNT]),
            revision: TLB_REVISION_INCR,
            phys_rev: AtomicU64::new(TLB_PHYS_REV_INCR),
            phys_wrap_pending: AtomicBool::new(false),
            hits: 0,
            misses: 0,
        }
    }

    /// Tag for a virtual address under the current revision.
    ///
    /// The shift pair discards bits 48..64 (the canonical sign extension) and
    /// the page offset, leaving a 36-bit page number in bits 0..36.
    #[inline]
    pub fn tag_for(&self, vaddr: u64) -> u64 {
        ((vaddr << 16) >> (16 + 12)) | self.revision
    }

    #[inline]
    fn index_of(tag: u64) -> usize {
        tag as u8 as usize
    }

    /// Current physical revision.
    #[inline]
    pub fn phys_revision(&self) -> u64 {
        self.phys_rev.load(Ordering::Acquire)
    }

    /// Looks up the entry for `vaddr`. The tag comparison is the sole
    /// validity test; stale entries (older revision, zeroed tag) simply fail
    /// to match.
    #[inline]
    pub fn lookup(&mut self, vaddr: u64) -> Option<usize> {
        self.process_phys_wrap();
        let tag = self.tag_for(vaddr);
        let index = Self::index_of(tag);
        if self.entries[index].tag == tag {
            self.hits = self.hits.wrapping_add(1);
            Some(index)
        } else {
            self.misses = self.misses.wrapping_add(1);
            None
        }
    }

    #[inline]
    pub fn entry(&self, index: usize) -> &TlbEntry {
        &self.entries[index]
    }

    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> &mut TlbEntry {
        &mut self.entries[index]
    }

    /// Installs an entry for `vaddr`, replacing whatever occupied its slot.
    pub fn fill(&mut self, vaddr: u64, mut entry: TlbEntry) -> usize {
        let tag = self.tag_for(vaddr);
        entry.tag = tag;
        let index = Self::index_of(tag);
        self.entries[index] = entry;
        index
    }

    /// Invalidates the one entry covering `vaddr`, if present. O(1).
    pub fn invalidate_page(&mut self, vaddr: u64) {
        let tag = self.tag_for(vaddr);
        let entry = &mut self.entries[Self::index_of(tag)];
        if entry.tag == tag {
            entry.tag = 0;
        }
    }

    /// Invalidates every entry by bumping the virtual revision.
    ///
    /// Entries are only physically purged when the 64-bit revision counter
    /// wraps around, which keeps the common path O(1).
    pub fn invalidate_all(&mut self) {
        self.revision = self.revision.wrapping_add(TLB_REVISION_INCR);
        if self.revision == 0 {
            log::trace!("tlb: virtual revision wrapped, purging all tags");
            for entry in self.entries.iter_mut() {
                entry.tag = 0;
            }
            self.revision = TLB_REVISION_INCR;
        }
    }

    /// Bumps the physical revision, making the physical-state flags of every
    /// entry stale. Entries are refreshed lazily on next use.
    ///
    /// Takes `&self` so the platform can broadcast this to every vCPU's
    /// caches while they are owned elsewhere; the caller must hold the
    /// platform physical-map lock for the duration of the broadcast.
    pub fn invalidate_all_physical(&self) {
        let mut cur = self.phys_rev.load(Ordering::Relaxed);
        loop {
            let mut next = cur.wrapping_add(TLB_PHYS_REV_INCR);
            let wrapped = next & TLBE_PHYS_REV_MASK == 0;
            if wrapped {
                next = TLB_PHYS_REV_INCR;
            }
            match self
                .phys_rev
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    if wrapped {
                        log::trace!("tlb: physical revision wrapped");
                        self.phys_wrap_pending.store(true, Ordering::Release);
                    }
                    return;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    /// Applies a deferred physical-revision wraparound: wipes the physical
    /// state of every entry so it is re-derived on next use.
    fn process_phys_wrap(&mut self) {
        if !self.phys_wrap_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        for entry in self.entries.iter_mut() {
            entry.flags_and_phys_rev &=
                !(TLBE_PHYS_REV_MASK | TLBE_F_PG_NO_READ | TLBE_F_PG_NO_WRITE);
            entry.flags_and_phys_rev |= TLBE_F_NO_DIRECT;
        }
    }

    /// Current virtual revision (diagnostics and tests).
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Forces the virtual revision, to exercise wraparound without 2^28
    /// bump iterations.
    #[cfg(test)]
    pub(crate) fn force_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}
