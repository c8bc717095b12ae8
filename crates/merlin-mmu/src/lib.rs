//! x86/x86-64 paging unit with revision-tagged software translation caches.
//!
//! This crate implements the paging modes an interpreter core needs:
//! - No paging (identity mapping)
//! - 32-bit paging (4KB / 4MB pages)
//! - PAE paging (4KB / 2MB pages)
//! - 4-level long mode paging (4KB / 2MB / 1GB pages) with canonical checks
//!
//! Translations are cached in two per-CPU [`tlb::TranslationCache`] banks
//! (code fetch and data). Cache entries also carry physical-page state
//! (directly mappable, read/write guarded, unassigned) versioned by a
//! separate physical revision so the platform can invalidate host-side state
//! across CPUs without touching guest-visible translations.

pub mod tlb;

use tlb::{
    TlbEntry, TranslationCache, TLBE_F_NO_DIRECT, TLBE_F_PG_NO_READ, TLBE_F_PG_NO_WRITE,
    TLBE_F_PG_UNASSIGNED, TLBE_F_PT_NO_ACCESSED, TLBE_F_PT_NO_DIRTY, TLBE_F_PT_NO_EXEC,
    TLBE_F_PT_NO_USER, TLBE_F_PT_NO_WRITE, TLBE_PHYS_FLAGS, TLBE_PHYS_REV_MASK,
};


/// Whether accessed/dirty page-table bits are set at translation time (as the
/// reference implementation does) rather than when a mapped access commits.
/// Architecturally under-specified; treat as policy, not a guarantee.
pub const AD_BITS_AT_TRANSLATION: bool = true;

/// Physical memory access used for page-table walking and staged accesses.
///
/// This is intentionally minimal; the CPU core wraps a richer platform bus
/// and forwards the physical reads/writes used here.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u64) -> u8;
    fn read_u16(&mut self, paddr: u64) -> u16;
    fn read_u32(&mut self, paddr: u64) -> u32;
    fn read_u64(&mut self, paddr: u64) -> u64;

    fn write_u8(&mut self, paddr: u64, value: u8);
    fn write_u16(&mut self, paddr: u64, value: u16);
    fn write_u32(&mut self, paddr: u64, value: u32);
    fn write_u64(&mut self, paddr: u64, value: u64);

    /// Read a byte slice from physical memory.
    ///
    /// The default implementation falls back to byte-at-a-time reads via
    /// [`MemoryBus::read_u8`]. Backends are encouraged to override this with
    /// a more efficient bulk implementation.
    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(paddr.wrapping_add(i as u64));
        }
    }

    /// Write a byte slice to physical memory.
    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u64), byte);
        }
    }

    /// Fallible bulk read, for backends whose physical access can fail
    /// (handler I/O errors). The default never fails.
    #[inline]
    fn try_read_bytes(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), PhysAccessError> {
        self.read_bytes(paddr, dst);
        Ok(())
    }

    /// Fallible bulk write; see [`MemoryBus::try_read_bytes`].
    #[inline]
    fn try_write_bytes(&mut self, paddr: u64, src: &[u8]) -> Result<(), PhysAccessError> {
        self.write_bytes(paddr, src);
        Ok(())
    }

    /// Classification of the physical page containing `page_phys`.
    ///
    /// The default treats everything as plain RAM without a direct host
    /// mapping, which forces staged (bounce-buffered) accesses — correct for
    /// any backend, just slower.
    #[inline]
    fn page_info(&mut self, page_phys: u64) -> PageInfo {
        let _ = page_phys;
        PageInfo {
            no_direct: true,
            ..PageInfo::ram()
        }
    }

    /// Direct host view of `[paddr, paddr + len)`, if the backing page is
    /// plain mapped RAM. `None` forces the staged path.
    #[inline]
    fn direct_mut(&mut self, paddr: u64, len: usize) -> Option<&mut [u8]> {
        let _ = (paddr, len);
        None
    }

    /// Second-level (nested) translation of a guest-physical address.
    ///
    /// Identity for non-nested configurations. A failure is propagated out
    /// of the walk untranslated; the nested-virtualization layer owns its
    /// interpretation.
    #[inline]
    fn second_level(&mut self, gphys: u64, access: AccessType) -> Result<u64, SecondLevelFault> {
        let _ = access;
        Ok(gphys)
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        <T as MemoryBus>::read_u8(&mut **self, paddr)
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        <T as MemoryBus>::read_u16(&mut **self, paddr)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        <T as MemoryBus>::read_u64(&mut **self, paddr)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        <T as MemoryBus>::write_u8(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        <T as MemoryBus>::write_u16(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        <T as MemoryBus>::write_u32(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        <T as MemoryBus>::write_u64(&mut **self, paddr, value)
    }

    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        <T as MemoryBus>::read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        <T as MemoryBus>::write_bytes(&mut **self, paddr, src)
    }

    #[inline]
    fn try_read_bytes(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), PhysAccessError> {
        <T as MemoryBus>::try_read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn try_write_bytes(&mut self, paddr: u64, src: &[u8]) -> Result<(), PhysAccessError> {
        <T as MemoryBus>::try_write_bytes(&mut **self, paddr, src)
    }

    #[inline]
    fn page_info(&mut self, page_phys: u64) -> PageInfo {
        <T as MemoryBus>::page_info(&mut **self, page_phys)
    }

    #[inline]
    fn direct_mut(&mut self, paddr: u64, len: usize) -> Option<&mut [u8]> {
        <T as MemoryBus>::direct_mut(&mut **self, paddr, len)
    }

    #[inline]
    fn second_level(&mut self, gphys: u64, access: AccessType) -> Result<u64, SecondLevelFault> {
        <T as MemoryBus>::second_level(&mut **self, gphys, access)
    }
}

/// Host-side classification of a guest physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Page is backed by nothing (not RAM, ROM or MMIO).
    pub unassigned: bool,
    /// Reads must go through an access handler (MMIO, ROM shadowing, ...).
    pub no_read: bool,
    /// Writes must go through an access handler (ROM, dirty tracking, ...).
    pub no_write: bool,
    /// No direct host mapping exists; even plain accesses must be staged.
    pub no_direct: bool,
}

impl PageInfo {
    /// Plain, directly mappable RAM.
    pub const fn ram() -> Self {
        Self {
            unassigned: false,
            no_read: false,
            no_write: false,
            no_direct: false,
        }
    }

    /// Handler-guarded page (MMIO and friends).
    pub const fn mmio() -> Self {
        Self {
            unassigned: false,
            no_read: true,
            no_write: true,
            no_direct: true,
        }
    }

    /// Unassigned physical address space.
    pub const fn unassigned() -> Self {
        Self {
            unassigned: true,
            no_read: true,
            no_write: true,
            no_direct: true,
        }
    }
}

/// A physical access failure (handler I/O error, torn backend, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysAccessError {
    pub paddr: u64,
}

impl core::fmt::Display for PhysAccessError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "physical memory access failed at {:#x}", self.paddr)
    }
}

impl std::error::Error for PhysAccessError {}

/// A second-level (nested) translation failure, propagated untranslated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondLevelFault {
    /// Guest-physical address that failed to translate.
    pub gphys: u64,
    /// Access the first-level walk was performing.
    pub access: AccessType,
}

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    fn is_execute(self) -> bool {
        matches!(self, AccessType::Execute)
    }
}

/// A translation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateFault {
    /// #PF with CR2 and the error code already computed.
    PageFault(PageFault),
    /// Non-canonical linear address in long mode (would raise #GP(0)).
    NonCanonical(u64),
    /// Nested second-level translation failed; owned by the
    /// nested-virtualization layer.
    Nested(SecondLevelFault),
}

/// #PF details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address (CR2).
    pub addr: u64,
    /// Error code as per Intel SDM.
    pub error_code: u32,
}

impl PageFault {
    #[inline]
    fn new(addr: u64, error_code: u32) -> Self {
        Self { addr, error_code }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PagingMode {
    Disabled,
    Legacy32,
    Pae,
    Long4,
}

/// A successful translation, with the cache-entry flag snapshot the access
/// layer uses to pick its fast or staged path.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    /// Physical address of the first byte.
    pub paddr: u64,
    /// Physical base of the containing 4KiB page.
    pub page_phys: u64,
    /// `TLBE_F_*` flag bits (physical state already refreshed).
    pub flags: u64,
}

impl Translation {
    /// Whether a direct host mapping may be used for this access kind.
    #[inline]
    pub fn directly_accessible(&self, access: AccessType) -> bool {
        if self.flags & TLBE_F_NO_DIRECT != 0 {
            return false;
        }
        match access {
            AccessType::Read | AccessType::Execute => self.flags & TLBE_F_PG_NO_READ == 0,
            AccessType::Write => self.flags & TLBE_F_PG_NO_WRITE == 0,
        }
    }

    #[inline]
    pub fn unassigned(&self) -> bool {
        self.flags & TLBE_F_PG_UNASSIGNED != 0
    }

    #[inline]
    pub fn read_guarded(&self) -> bool {
        self.flags & TLBE_F_PG_NO_READ != 0
    }
}

/// Result of a guest page-table walk, before cache insertion.
struct WalkInfo {
    /// Physical base of the 4KiB page containing the address (large pages
    /// are cached at 4KiB granularity).
    page_phys: u64,
    user: bool,
    writable: bool,
    nx: bool,
    /// Leaf paging-structure entry (for deferred A/D updates).
    leaf_addr: u64,
    leaf_is_64: bool,
    /// Whether the leaf dirty bit is already set.
    dirty: bool,
    /// Whether the accessed bits along the walk are already set.
    accessed: bool,
}

/// x86 paging unit: control-register state, page walkers, and the two
/// translation caches. Owned exclusively by its virtual CPU.
#[derive(Debug)]
pub struct Mmu {
    cr0: u64,
    cr2: u64,
    cr3: u64,
    cr4: u64,
    efer: u64,
    mode: PagingMode,
    max_phys_bits: u8,
    code_tlb: TranslationCache,
    data_tlb: TranslationCache,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        let mut mmu = Self {
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            efer: 0,
            mode: PagingMode::Disabled,
            max_phys_bits: 52,
            code_tlb: TranslationCache::new(),
            data_tlb: TranslationCache::new(),
        };
        mmu.update_cached_state();
        mmu
    }

    #[inline]
    fn update_cached_state(&mut self) {
        self.mode = if self.cr0 & CR0_PG == 0 {
            PagingMode::Disabled
        } else if self.cr4 & CR4_PAE == 0 {
            PagingMode::Legacy32
        } else if self.efer & EFER_LME != 0 {
            PagingMode::Long4
        } else {
            PagingMode::Pae
        };
    }

    /// CR2 is architecturally written by the CPU on #PF injection; the MMU
    /// stores it for convenience so the CPU can fetch it after translation.
    #[inline]
    pub fn cr2(&self) -> u64 {
        self.cr2
    }

    #[inline]
    pub fn cr0(&self) -> u64 {
        self.cr0
    }

    #[inline]
    pub fn cr3(&self) -> u64 {
        self.cr3
    }

    #[inline]
    pub fn cr4(&self) -> u64 {
        self.cr4
    }

    #[inline]
    pub fn efer(&self) -> u64 {
        self.efer
    }

    #[inline]
    pub fn set_cr2(&mut self, value: u64) {
        self.cr2 = value;
    }

    pub fn set_cr0(&mut self, value: u64) {
        let old_relevant = self.cr0 & (CR0_PG | CR0_WP);
        self.cr0 = value;
        if self.cr0 & (CR0_PG | CR0_WP) != old_relevant {
            self.invalidate_all();
        }
        self.update_cached_state();
    }

    /// Any address-space change invalidates both caches via a revision bump.
    pub fn set_cr3(&mut self, value: u64) {
        self.cr3 = value;
        self.invalidate_all();
        self.update_cached_state();
    }

    pub fn set_cr4(&mut self, value: u64) {
        let old_relevant = self.cr4 & (CR4_PAE | CR4_PSE | CR4_PGE);
        self.cr4 = value;
        if self.cr4 & (CR4_PAE | CR4_PSE | CR4_PGE) != old_relevant {
            self.invalidate_all();
        }
        self.update_cached_state();
    }

    pub fn set_efer(&mut self, value: u64) {
        let old_relevant = self.efer & (EFER_LME | EFER_NXE);
        self.efer = value;
        if self.efer & (EFER_LME | EFER_NXE) != old_relevant {
            self.invalidate_all();
        }
        self.update_cached_state();
    }

    #[track_caller]
    pub fn set_max_phys_bits(&mut self, bits: u8) {
        assert!(
            (1..=52).contains(&bits),
            "max_phys_bits must be 1..=52 (got {bits})"
        );
        if self.max_phys_bits != bits {
            self.max_phys_bits = bits;
            self.invalidate_all();
        }
    }

    #[inline]
    pub fn code_cache(&mut self) -> &mut TranslationCache {
        &mut self.code_tlb
    }

    #[inline]
    pub fn data_cache(&mut self) -> &mut TranslationCache {
        &mut self.data_tlb
    }

    /// INVLPG: drop the one entry covering `vaddr` from both caches.
    pub fn invalidate_page(&mut self, vaddr: u64) {
        self.code_tlb.invalidate_page(vaddr);
        self.data_tlb.invalidate_page(vaddr);
    }

    /// Invalidate every cached translation (revision bump).
    pub fn invalidate_all(&mut self) {
        self.code_tlb.invalidate_all();
        self.data_tlb.invalidate_all();
    }

    /// Invalidate all cached *physical* page state. Callable cross-thread
    /// under the platform physical-map lock; see
    /// [`TranslationCache::invalidate_all_physical`].
    pub fn invalidate_all_physical(&self) {
        self.code_tlb.invalidate_all_physical();
        self.data_tlb.invalidate_all_physical();
    }

    /// Translate a linear address to a physical address, consulting and
    /// filling the translation caches.
    ///
    /// `cpl` is the current privilege level (0..=3). Only CPL==3 is treated
    /// as "user"; all others are "supervisor".
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u64,
        access: AccessType,
        cpl: u8,
    ) -> Result<Translation, TranslateFault> {
        let is_user = cpl == 3;
        let mode = self.mode;

        // With paging disabled, x86 uses a 32-bit linear address space (long
        // mode cannot be active without paging). In non-long paging modes the
        // linear address is also 32-bit. In long mode, enforce canonical
        // form.
        let vaddr = match mode {
            PagingMode::Disabled | PagingMode::Legacy32 | PagingMode::Pae => vaddr as u32 as u64,
            PagingMode::Long4 => {
                if !is_canonical_48(vaddr) {
                    return Err(TranslateFault::NonCanonical(vaddr));
                }
                vaddr
            }
        };

        let is_exec = access.is_execute();
        let hit = if is_exec {
            self.code_tlb.lookup(vaddr)
        } else {
            self.data_tlb.lookup(vaddr)
        };

        let index = match hit {
            Some(index) => index,
            None => {
                let info = match mode {
                    PagingMode::Disabled => WalkInfo {
                        page_phys: vaddr & !0xfff,
                        user: true,
                        writable: true,
                        nx: false,
                        leaf_addr: 0,
                        leaf_is_64: false,
                        dirty: true,
                        accessed: true,
                    },
                    PagingMode::Legacy32 => self.walk_legacy32(bus, vaddr, access, is_user)?,
                    PagingMode::Pae => self.walk_pae(bus, vaddr, access, is_user)?,
                    PagingMode::Long4 => self.walk_long4(bus, vaddr, access, is_user)?,
                };

                let mut entry = TlbEntry::default();
                entry.page_phys = info.page_phys;
                let mut flags = 0u64;
                if !info.user {
                    flags |= TLBE_F_PT_NO_USER;
                }
                if !info.writable {
                    flags |= TLBE_F_PT_NO_WRITE;
                }
                if info.nx {
                    flags |= TLBE_F_PT_NO_EXEC;
                }
                if !info.accessed {
                    flags |= TLBE_F_PT_NO_ACCESSED;
                }
                if !info.dirty {
                    flags |= TLBE_F_PT_NO_DIRTY;
                }
                entry.flags_and_phys_rev = flags;
                entry.set_leaf(info.leaf_addr, info.leaf_is_64);

                let phys_rev = self.cache_mut(is_exec).phys_revision();
                let info = bus.page_info(entry.page_phys);
                apply_phys_state(&mut entry, phys_rev, info);
                self.cache_mut(is_exec).fill(vaddr, entry)
            }
        };

        let phys_rev = self.cache_mut(is_exec).phys_revision();
        let mut entry = *self.cache_mut(is_exec).entry(index);

        // Physical-revision mismatch: the translation is still valid but the
        // host-side page state must be re-derived.
        if entry.flags_and_phys_rev & TLBE_PHYS_REV_MASK != phys_rev {
            let info = bus.page_info(entry.page_phys);
            apply_phys_state(&mut entry, phys_rev, info);
            *self.cache_mut(is_exec).entry_mut(index) = entry;
        }

        let flags = entry.flags_and_phys_rev;
        if is_user && flags & TLBE_F_PT_NO_USER != 0 {
            return Err(self.page_fault(vaddr, pf_error_code(true, access, is_user, false)));
        }
        if access.is_write()
            && flags & TLBE_F_PT_NO_WRITE != 0
            && (is_user || self.cr0 & CR0_WP != 0)
        {
            return Err(self.page_fault(vaddr, pf_error_code(true, access, is_user, false)));
        }
        if is_exec && flags & TLBE_F_PT_NO_EXEC != 0 {
            return Err(self.page_fault(vaddr, pf_error_code(true, access, is_user, false)));
        }

        // Deferred accessed/dirty maintenance for entries cached before the
        // relevant bit was due (read fill followed by a write hit, or the
        // commit-time A/D policy).
        if entry.leaf_addr() != 0 {
            if flags & TLBE_F_PT_NO_ACCESSED != 0 {
                set_leaf_bit(bus, &entry, PTE_A64);
                entry.flags_and_phys_rev &= !TLBE_F_PT_NO_ACCESSED;
                *self.cache_mut(is_exec).entry_mut(index) = entry;
            }
            if access.is_write() && flags & TLBE_F_PT_NO_DIRTY != 0 {
                set_leaf_bit(bus, &entry, PTE_D64);
                entry.flags_and_phys_rev &= !TLBE_F_PT_NO_DIRTY;
                *self.cache_mut(is_exec).entry_mut(index) = entry;
            }
        }

        Ok(Translation {
            paddr: entry.translate(vaddr),
            page_phys: entry.page_phys,
            flags: entry.flags_and_phys_rev & !TLBE_PHYS_REV_MASK,
        })
    }

    #[inline]
    fn cache_mut(&mut self, is_exec: bool) -> &mut TranslationCache {
        if is_exec {
            &mut self.code_tlb
        } else {
            &mut self.data_tlb
        }
    }

    fn page_fault(&mut self, vaddr: u64, error_code: u32) -> TranslateFault {
        self.cr2 = vaddr;
        TranslateFault::PageFault(PageFault::new(vaddr, error_code))
    }

    #[inline]
    fn cr4_pse(&self) -> bool {
        self.cr4 & CR4_PSE != 0
    }

    #[inline]
    fn nx_enabled(&self) -> bool {
        self.efer & EFER_NXE != 0
    }

    #[inline]
    fn phys_addr_mask(&self) -> u64 {
        (1u64 << self.max_phys_bits) - 1
    }

    fn walk_legacy32(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u64,
        access: AccessType,
        is_user: bool,
    ) -> Result<WalkInfo, TranslateFault> {
        let set_ad = AD_BITS_AT_TRANSLATION;

        let pd_base = (self.cr3 & 0xffff_ffff) & !0xfff;
        let pde_addr = self.nested(bus, pd_base + ((vaddr >> 22) & 0x3ff) * 4)?;
        let pde = bus.read_u32(pde_addr) as u64;
        if pde & PTE_P == 0 {
            return Err(self.page_fault(vaddr, pf_error_code(false, access, is_user, false)));
        }

        let pde_ps = pde & PTE_PS != 0;
        if pde_ps {
            // 4MB pages require CR4.PSE; otherwise PS is treated as reserved.
            if !self.cr4_pse() {
                return Err(self.page_fault(vaddr, pf_error_code(true, access, is_user, true)));
            }
            if pde & LEGACY32_4MB_RESERVED_MASK != 0 {
                return Err(self.page_fault(vaddr, pf_error_code(true, access, is_user, true)));
            }

            let user = pde & PTE_US != 0;
            let writable = pde & PTE_RW != 0;
            self.check_walk_perms(vaddr, user, writable, false, access, is_user)?;

            let mut new_pde = pde | PTE_A;
            if set_ad && access.is_write() {
                new_pde |= PTE_D;
            }
            if set_ad && new_pde != pde {
                bus.write_u32(pde_addr, new_pde as u32);
            }

            return Ok(WalkInfo {
                page_phys: (pde & 0xffc0_0000) | (vaddr & 0x003f_f000),
                user,
                writable,
                nx: false,
                leaf_addr: pde_addr,
                leaf_is_64: false,
                dirty: set_ad && new_pde & PTE_D != 0,
                accessed: set_ad,
            });
        }

        if set_ad && pde & PTE_A == 0 {
            bus.write_u32(pde_addr, (pde | PTE_A) as u32);
        }

        let pt_base = pde & 0xffff_f000;
        let pte_addr = self.nested(bus, pt_base + ((vaddr >> 12) & 0x3ff) * 4)?;
        let pte = bus.read_u32(pte_addr) as u64;
        if pte & PTE_P == 0 {
            return Err(self.page_fault(vaddr, pf_error_code(false, access, is_user, false)));
        }

        let user = (pde & PTE_US != 0) && (pte & PTE_US != 0);
        let writable = (pde & PTE_RW != 0) && (pte & PTE_RW != 0);
        self.check_walk_perms(vaddr, user, writable, false, access, is_user)?;

        let mut new_pte = pte | PTE_A;
        if set_ad && access.is_write() {
            new_pte |= PTE_D;
        }
        if set_ad && new_pte != pte {
            bus.write_u32(pte_addr, new_pte as u32);
        }

        Ok(WalkInfo {
            page_phys: pte & 0xffff_f000,
            user,
            writable,
            nx: false,
            leaf_addr: pte_addr,
            leaf_is_64: false,
            dirty: set_ad && new_pte & PTE_D != 0,
            accessed: set_ad,
        })
    }

    fn walk_pae(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u64,
        access: AccessType,
        is_user: bool,
    ) -> Result<WalkInfo, TranslateFault> {
        let nx_enabled = self.nx_enabled();
        let addr_mask = self.phys_addr_mask();

        let pdpt_base = (self.cr3 & 0xffff_ffff) & !0x1f;
        let pdpte_addr = self.nested(bus, pdpt_base + ((vaddr >> 30) & 0x3) * 8)?;
        let pdpte = bus.read_u64(pdpte_addr);
        let pdpte = self.check_entry64(bus, pdpte_addr, pdpte, vaddr, access, is_user, Level::PdptePae)?;

        // In IA-32 PAE paging the PDPT entry does not participate in U/S or
        // R/W protection; it can contribute NX when EFER.NXE is enabled.
        let mut user = true;
        let mut writable = true;
        let mut nx = nx_enabled && pdpte & PTE_NX != 0;

        let pd_base = (pdpte & addr_mask) & !0xfff;
        let pde_addr = self.nested(bus, pd_base + ((vaddr >> 21) & 0x1ff) * 8)?;
        let pde = bus.read_u64(pde_addr);
        let pde = self.check_entry64(bus, pde_addr, pde, vaddr, access, is_user, Level::PdePae)?;

        user &= pde & PTE_US64 != 0;
        writable &= pde & PTE_RW64 != 0;
        nx |= nx_enabled && pde & PTE_NX != 0;

        if pde & PTE_PS64 != 0 {
            self.check_walk_perms(vaddr, user, writable, nx, access, is_user)?;
            let dirty = self.finish_leaf(bus, pde_addr, pde, access);
            return Ok(WalkInfo {
                page_phys: ((pde & addr_mask) & !0x1f_ffff) | (vaddr & 0x1f_f000),
                user,
                writable,
                nx,
                leaf_addr: pde_addr,
                leaf_is_64: true,
                dirty,
                accessed: AD_BITS_AT_TRANSLATION,
            });
        }

        let pt_base = (pde & addr_mask) & !0xfff;
        let pte_addr = self.nested(bus, pt_base + ((vaddr >> 12) & 0x1ff) * 8)?;
        let pte = bus.read_u64(pte_addr);
        let pte = self.check_entry64(bus, pte_addr, pte, vaddr, access, is_user, Level::PtePae)?;

        user &= pte & PTE_US64 != 0;
        writable &= pte & PTE_RW64 != 0;
        nx |= nx_enabled && pte & PTE_NX != 0;

        self.check_walk_perms(vaddr, user, writable, nx, access, is_user)?;
        let dirty = self.finish_leaf(bus, pte_addr, pte, access);

        Ok(WalkInfo {
            page_phys: (pte & addr_mask) & !0xfff,
            user,
            writable,
            nx,
            leaf_addr: pte_addr,
            leaf_is_64: true,
            dirty,
            accessed: AD_BITS_AT_TRANSLATION,
        })
    }

    fn walk_long4(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u64,
        access: AccessType,
        is_user: bool,
    ) -> Result<WalkInfo, TranslateFault> {
        let nx_enabled = self.nx_enabled();
        let addr_mask = self.phys_addr_mask();

        let pml4_base = (self.cr3 & addr_mask) & !0xfff;
        let pml4e_addr = self.nested(bus, pml4_base + ((vaddr >> 39) & 0x1ff) * 8)?;
        let pml4e = bus.read_u64(pml4e_addr);
        let pml4e = self.check_entry64(bus, pml4e_addr, pml4e, vaddr, access, is_user, Level::Pml4e)?;

        let mut user = pml4e & PTE_US64 != 0;
        let mut writable = pml4e & PTE_RW64 != 0;
        let mut nx = nx_enabled && pml4e & PTE_NX != 0;

        let pdpt_base = (pml4e & addr_mask) & !0xfff;
        let pdpte_addr = self.nested(bus, pdpt_base + ((vaddr >> 30) & 0x1ff) * 8)?;
        let pdpte = bus.read_u64(pdpte_addr);
        let pdpte =
            self.check_entry64(bus, pdpte_addr, pdpte, vaddr, access, is_user, Level::PdpteLong)?;

        user &= pdpte & PTE_US64 != 0;
        writable &= pdpte & PTE_RW64 != 0;
        nx |= nx_enabled && pdpte & PTE_NX != 0;

        if pdpte & PTE_PS64 != 0 {
            self.check_walk_perms(vaddr, user, writable, nx, access, is_user)?;
            let dirty = self.finish_leaf(bus, pdpte_addr, pdpte, access);
            return Ok(WalkInfo {
                page_phys: ((pdpte & addr_mask) & !0x3fff_ffff) | (vaddr & 0x3fff_f000),
                user,
                writable,
                nx,
                leaf_addr: pdpte_addr,
                leaf_is_64: true,
                dirty,
                accessed: AD_BITS_AT_TRANSLATION,
            });
        }

        let pd_base = (pdpte & addr_mask) & !0xfff;
        let pde_addr = self.nested(bus, pd_base + ((vaddr >> 21) & 0x1ff) * 8)?;
        let pde = bus.read_u64(pde_addr);
        let pde = self.check_entry64(bus, pde_addr, pde, vaddr, access, is_user, Level::PdeLong)?;

        user &= pde & PTE_US64 != 0;
        writable &= pde & PTE_RW64 != 0;
        nx |= nx_enabled && pde & PTE_NX != 0;

        if pde & PTE_PS64 != 0 {
            self.check_walk_perms(vaddr, user, writable, nx, access, is_user)?;
            let dirty = self.finish_leaf(bus, pde_addr, pde, access);
            return Ok(WalkInfo {
                page_phys: ((pde & addr_mask) & !0x1f_ffff) | (vaddr & 0x1f_f000),
                user,
                writable,
                nx,
                leaf_addr: pde_addr,
                leaf_is_64: true,
                dirty,
                accessed: AD_BITS_AT_TRANSLATION,
            });
        }

        let pt_base = (pde & addr_mask) & !0xfff;
        let pte_addr = self.nested(bus, pt_base + ((vaddr >> 12) & 0x1ff) * 8)?;
        let pte = bus.read_u64(pte_addr);
        let pte = self.check_entry64(bus, pte_addr, pte, vaddr, access, is_user, Level::PteLong)?;

        user &= pte & PTE_US64 != 0;
        writable &= pte & PTE_RW64 != 0;
        nx |= nx_enabled && pte & PTE_NX != 0;

        self.check_walk_perms(vaddr, user, writable, nx, access, is_user)?;
        let dirty = self.finish_leaf(bus, pte_addr, pte, access);

        Ok(WalkInfo {
            page_phys: (pte & addr_mask) & !0xfff,
            user,
            writable,
            nx,
            leaf_addr: pte_addr,
            leaf_is_64: true,
            dirty,
            accessed: AD_BITS_AT_TRANSLATION,
        })
    }

    /// Applies the second-level translation to a paging-structure address.
    #[inline]
    fn nested(&mut self, bus: &mut impl MemoryBus, gphys: u64) -> Result<u64, TranslateFault> {
        bus.second_level(gphys, AccessType::Read)
            .map_err(TranslateFault::Nested)
    }

    /// Present/reserved checks plus the accessed-bit update for one 64-bit
    /// paging-structure entry.
    #[allow(clippy::too_many_arguments)]
    fn check_entry64(
        &mut self,
        bus: &mut impl MemoryBus,
        entry_addr: u64,
        entry: u64,
        vaddr: u64,
        access: AccessType,
        is_user: bool,
        level: Level,
    ) -> Result<u64, TranslateFault> {
        if entry & PTE_P64 == 0 {
            return Err(self.page_fault(vaddr, pf_error_code(false, access, is_user, false)));
        }
        if self.has_reserved_bits64(entry, level) {
            return Err(self.page_fault(vaddr, pf_error_code(true, access, is_user, true)));
        }

        // IA-32 PAE PDPT entries do not have Accessed/Dirty bits; all other
        // paging-structure entries we emulate do.
        let mut entry = entry;
        if AD_BITS_AT_TRANSLATION && level != Level::PdptePae && entry & PTE_A64 == 0 {
            entry |= PTE_A64;
            bus.write_u64(entry_addr, entry);
        }
        Ok(entry)
    }

    /// Leaf D-bit update per the A/D policy; returns whether D is now set.
    fn finish_leaf(
        &mut self,
        bus: &mut impl MemoryBus,
        leaf_addr: u64,
        leaf: u64,
        access: AccessType,
    ) -> bool {
        if AD_BITS_AT_TRANSLATION && access.is_write() && leaf & PTE_D64 == 0 {
            bus.write_u64(leaf_addr, leaf | PTE_D64);
            return true;
        }
        leaf & PTE_D64 != 0
    }

    fn check_walk_perms(
        &mut self,
        vaddr: u64,
        user_ok: bool,
        writable_ok: bool,
        nx: bool,
        access: AccessType,
        is_user: bool,
    ) -> Result<(), TranslateFault> {
        if is_user && !user_ok {
            return Err(self.page_fault(vaddr, pf_error_code(true, access, is_user, false)));
        }
        if access.is_write() && !writable_ok && (is_user || self.cr0 & CR0_WP != 0) {
            return Err(self.page_fault(vaddr, pf_error_code(true, access, is_user, false)));
        }
        if access.is_execute() && nx {
            return Err(self.page_fault(vaddr, pf_error_code(true, access, is_user, false)));
        }
        Ok(())
    }

    fn has_reserved_bits64(&self, entry: u64, level: Level) -> bool {
        // Bits 52..=58 are available to software in most 64-bit
        // paging-structure entries; OSes use them freely.
        const IGNORED_AVL_HIGH_MASK: u64 = 0x7f << 52;

        let nx_enabled = self.nx_enabled();
        if !nx_enabled && entry & PTE_NX != 0 {
            return true;
        }

        // PS is reserved at certain levels.
        if matches!(level, Level::Pml4e | Level::PdptePae) && entry & PTE_PS64 != 0 {
            return true;
        }

        let addr_mask = self.phys_addr_mask();

        if level == Level::PdptePae {
            // IA-32 PAE PDPT entry: P, PWT, PCD, AVL(9..=11) and the PD base
            // address; bits 1,2,5..=8 are reserved.
            let allowed_flags = PTE_P64 | (1 << 3) | (1 << 4) | (0x7 << 9);
            let mut allowed = allowed_flags | (addr_mask & !0xfff);
            if nx_enabled {
                allowed |= PTE_NX;
            }
            return entry & !allowed != 0;
        }

        let page_align: u64 = match level {
            Level::PdpteLong if entry & PTE_PS64 != 0 => 1 << 30,
            Level::PdePae | Level::PdeLong if entry & PTE_PS64 != 0 => 1 << 21,
            _ => 0x1000,
        };

        let mut allowed = (addr_mask & !(page_align - 1)) | 0x1fff | IGNORED_AVL_HIGH_MASK;
        if nx_enabled {
            allowed |= PTE_NX;
        }
        entry & !allowed != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Pml4e,
    PdpteLong,
    PdeLong,
    PteLong,
    PdptePae,
    PdePae,
    PtePae,
}

fn apply_phys_state(entry: &mut TlbEntry, phys_rev: u64, info: PageInfo) {
    let mut flags = entry.flags_and_phys_rev & !(TLBE_PHYS_REV_MASK | TLBE_PHYS_FLAGS);
    if info.unassigned {
        flags |= TLBE_F_PG_UNASSIGNED | TLBE_F_PG_NO_READ | TLBE_F_PG_NO_WRITE | TLBE_F_NO_DIRECT;
    }
    if info.no_read {
        flags |= TLBE_F_PG_NO_READ;
    }
    if info.no_write {
        flags |= TLBE_F_PG_NO_WRITE;
    }
    if info.no_direct {
        flags |= TLBE_F_NO_DIRECT;
    }
    entry.flags_and_phys_rev = flags | phys_rev;
}

/// Sets a bit in the leaf paging-structure entry recorded by a cache entry.
fn set_leaf_bit(bus: &mut impl MemoryBus, entry: &TlbEntry, bit: u64) {
    let leaf_addr = entry.leaf_addr();
    if entry.leaf_is_64() {
        let val = bus.read_u64(leaf_addr);
        bus.write_u64(leaf_addr, val | bit);
    } else {
        let val = bus.read_u32(leaf_addr);
        bus.write_u32(leaf_addr, val | bit as u32);
    }
}

#[inline]
fn pf_error_code(present: bool, access: AccessType, is_user: bool, rsvd: bool) -> u32 {
    let mut code = 0u32;
    if present {
        code |= 1 << 0;
    }
    if access.is_write() {
        code |= 1 << 1;
    }
    if is_user {
        code |= 1 << 2;
    }
    if rsvd {
        code |= 1 << 3;
    }
    if access.is_execute() {
        code |= 1 << 4;
    }
    code
}

/// Canonical if bits 48..63 are a sign-extension of bit 47.
#[inline]
pub fn is_canonical_48(vaddr: u64) -> bool {
    // For canonical values `(top17 + 1)` is either 1 or 0x20000, both of
    // which have bits 1..16 clear.
    (((vaddr >> 47).wrapping_add(1)) & 0x1fffe) == 0
}

const CR0_WP: u64 = 1 << 16;
const CR0_PG: u64 = 1 << 31;

const CR4_PSE: u64 = 1 << 4;
const CR4_PAE: u64 = 1 << 5;
const CR4_PGE: u64 = 1 << 7;

const EFER_LME: u64 = 1 << 8;
const EFER_NXE: u64 = 1 << 11;

const PTE_P: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;
const PTE_US: u64 = 1 << 2;
const PTE_A: u64 = 1 << 5;
const PTE_D: u64 = 1 << 6;
const PTE_PS: u64 = 1 << 7;

const PTE_P64: u64 = 1 << 0;
const PTE_RW64: u64 = 1 << 1;
const PTE_US64: u64 = 1 << 2;
const PTE_A64: u64 = 1 << 5;
const PTE_D64: u64 = 1 << 6;
const PTE_PS64: u64 = 1 << 7;
const PTE_NX: u64 = 1 << 63;

const LEGACY32_4MB_RESERVED_MASK: u64 = 0x003f_e000;
