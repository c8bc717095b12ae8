//! Guest memory mapping: the per-instruction active-mapping table, bounce
//! buffers, and the typed data/stack/code accessors built on them.
//!
//! `map` hands out a token for a byte view of guest memory. The fast path is
//! a direct host view of the backing page; anything irregular (page-crossing
//! accesses, handler-guarded pages, unassigned physical space) is staged in a
//! bounce buffer that commits back to physical memory on unmap. An
//! instruction either commits every mapping it made or the step rolls all of
//! them back, so no partial write is ever observable.

use bitflags::bitflags;
use merlin_mmu::tlb::{
    TLBE_F_NO_DIRECT, TLBE_F_PG_NO_READ, TLBE_F_PG_NO_WRITE, TLBE_F_PG_UNASSIGNED,
};
use merlin_mmu::{AccessType, MemoryBus, PhysAccessError, Translation, TranslateFault};

use crate::event::{Event, MemFault, PlatformError};
use crate::seg::{apply_segment, SegAccess};
use crate::state::{Seg, CR0_AM, RFLAGS_AC};
use crate::Cpu;

bitflags! {
    /// Access details for one guest memory mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        const TYPE_READ = 1 << 0;
        const TYPE_WRITE = 1 << 1;
        const TYPE_EXEC = 1 << 2;
        const WHAT_CODE = 1 << 4;
        const WHAT_DATA = 1 << 5;
        const WHAT_STACK = 1 << 6;
        const WHAT_SYS = 1 << 7;
        /// The mapping is staged in a bounce buffer.
        const BOUNCED = 1 << 9;

        const DATA_R = Self::TYPE_READ.bits() | Self::WHAT_DATA.bits();
        const DATA_W = Self::TYPE_WRITE.bits() | Self::WHAT_DATA.bits();
        const DATA_RW =
            Self::TYPE_READ.bits() | Self::TYPE_WRITE.bits() | Self::WHAT_DATA.bits();
        const STACK_R = Self::TYPE_READ.bits() | Self::WHAT_STACK.bits();
        const STACK_W = Self::TYPE_WRITE.bits() | Self::WHAT_STACK.bits();
        const SYS_R = Self::TYPE_READ.bits() | Self::WHAT_SYS.bits();
        const SYS_W = Self::TYPE_WRITE.bits() | Self::WHAT_SYS.bits();
        const CODE_X = Self::TYPE_EXEC.bits() | Self::WHAT_CODE.bits();
    }
}

impl Access {
    #[inline]
    fn access_type(self) -> AccessType {
        if self.contains(Access::TYPE_WRITE) {
            AccessType::Write
        } else if self.contains(Access::TYPE_EXEC) {
            AccessType::Execute
        } else {
            AccessType::Read
        }
    }
}

/// Alignment-violation policy for a mapped access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignPolicy {
    /// Misalignment always raises #GP(0) (strict SSE/AVX style).
    Gp,
    /// Misalignment raises #AC(0) only when alignment checking is armed
    /// (CR0.AM, RFLAGS.AC, CPL==3); otherwise the access proceeds.
    Ac,
}

/// Concurrent mappings one instruction may hold (e.g. source + destination
/// of a string move plus a stack access).
pub const MAX_MAPPINGS: usize = 3;

/// Bounce-buffer capacity, sized for the largest mapped access (FXSAVE
/// area).
pub const BOUNCE_BUF_SIZE: usize = 512;

/// Fill byte for reads of unassigned physical space.
pub const UNASSIGNED_FILL: u8 = 0xff;

const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy)]
enum Backing {
    Unused,
    /// Direct host view of one physical range.
    Direct { paddr: u64 },
    /// Staged in this slot's bounce buffer; committed to one or two
    /// physical ranges on unmap.
    Bounce {
        phys_first: u64,
        phys_second: u64,
        len_first: u16,
        len_second: u16,
        unassigned_first: bool,
        unassigned_second: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct MappingSlot {
    access: Access,
    len: u16,
    backing: Backing,
}

impl MappingSlot {
    const UNUSED: Self = Self {
        access: Access::empty(),
        len: 0,
        backing: Backing::Unused,
    };

    #[inline]
    fn in_use(&self) -> bool {
        !matches!(self.backing, Backing::Unused)
    }
}

/// Token for an active mapping; consumed by exactly one commit, or swept by
/// `rollback_all`.
#[derive(Debug, Clone, Copy)]
pub struct MemMapping {
    slot: u8,
}

#[derive(Debug)]
pub(crate) struct MappingTable {
    slots: [MappingSlot; MAX_MAPPINGS],
    bounce: Box<[[u8; BOUNCE_BUF_SIZE]; MAX_MAPPINGS]>,
    next_hint: u8,
    active: u8,
    /// Bytes committed through stack-segment write mappings (diagnostics).
    pub stack_bytes_written: u64,
}

impl MappingTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: [MappingSlot::UNUSED; MAX_MAPPINGS],
            bounce: Box::new([[0; BOUNCE_BUF_SIZE]; MAX_MAPPINGS]),
            next_hint: 0,
            active: 0,
            stack_bytes_written: 0,
        }
    }

    fn alloc(&mut self) -> Result<usize, PlatformError> {
        if (self.active as usize) >= MAX_MAPPINGS {
            return Err(PlatformError::MappingSlotsExhausted);
        }
        let start = self.next_hint as usize;
        for i in 0..MAX_MAPPINGS {
            let slot = (start + i) % MAX_MAPPINGS;
            if !self.slots[slot].in_use() {
                self.next_hint = ((slot + 1) % MAX_MAPPINGS) as u8;
                return Ok(slot);
            }
        }
        Err(PlatformError::MappingSlotsExhausted)
    }

    fn free(&mut self, slot: usize) {
        debug_assert!(self.slots[slot].in_use());
        self.slots[slot] = MappingSlot::UNUSED;
        self.active -= 1;
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active as usize
    }
}

impl Cpu {
    /// Maps `len` bytes of guest memory at linear address `linear`.
    ///
    /// Permissions are rechecked against the current translation on every
    /// call; the returned token must be consumed by [`Cpu::commit`] or swept
    /// by [`Cpu::rollback_all`] before the instruction step ends.
    pub fn map_linear<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        linear: u64,
        len: u32,
        access: Access,
        align: u32,
        policy: AlignPolicy,
    ) -> Result<MemMapping, MemFault> {
        debug_assert!(len >= 1);
        debug_assert!(align.is_power_of_two());
        if len as usize > BOUNCE_BUF_SIZE {
            return Err(PlatformError::BounceOverflow(len as usize).into());
        }

        if linear & (align as u64 - 1) != 0 {
            match policy {
                AlignPolicy::Gp => return Err(Event::gp0().into()),
                AlignPolicy::Ac => {
                    if self.alignment_checks_armed() {
                        return Err(Event::ac0().into());
                    }
                }
            }
        }

        let atype = access.access_type();
        // Implicit system accesses (descriptor tables, TSS) are supervisor
        // accesses regardless of CPL.
        let cpl = if access.contains(Access::WHAT_SYS) {
            0
        } else {
            self.state.cpl()
        };

        let first = self
            .mmu
            .translate(bus, linear, atype, cpl)
            .map_err(fault_of)?;

        let page_off = (linear & (PAGE_SIZE - 1)) as u32;
        let slot = self.maps.alloc()?;

        if page_off + len > PAGE_SIZE as u32 {
            // Page-crossing: two sub-translations, one bounce buffer sized
            // to the whole access.
            let len_first = PAGE_SIZE as u32 - page_off;
            let len_second = len - len_first;
            let second = self
                .mmu
                .translate(bus, (linear & !(PAGE_SIZE - 1)).wrapping_add(PAGE_SIZE), atype, cpl)
                .map_err(fault_of)?;

            let buf = &mut self.maps.bounce[slot][..len as usize];
            if access.intersects(Access::TYPE_READ | Access::TYPE_EXEC) {
                load_bounce(bus, &mut buf[..len_first as usize], &first)?;
                load_bounce(bus, &mut buf[len_first as usize..], &second)?;
            } else {
                buf.fill(0);
            }

            self.maps.slots[slot] = MappingSlot {
                access: access | Access::BOUNCED,
                len: len as u16,
                backing: Backing::Bounce {
                    phys_first: first.paddr,
                    phys_second: second.paddr,
                    len_first: len_first as u16,
                    len_second: len_second as u16,
                    unassigned_first: first.unassigned(),
                    unassigned_second: second.unassigned(),
                },
            };
            self.maps.active += 1;
            return Ok(MemMapping { slot: slot as u8 });
        }

        if direct_ok(&first, access) && bus.direct_mut(first.paddr, len as usize).is_some() {
            self.maps.slots[slot] = MappingSlot {
                access,
                len: len as u16,
                backing: Backing::Direct { paddr: first.paddr },
            };
            self.maps.active += 1;
            return Ok(MemMapping { slot: slot as u8 });
        }

        // Handler-guarded, unassigned or simply not host-mappable: stage the
        // one physical range.
        let buf = &mut self.maps.bounce[slot][..len as usize];
        if access.intersects(Access::TYPE_READ | Access::TYPE_EXEC) {
            load_bounce(bus, buf, &first)?;
        } else {
            buf.fill(0);
        }

        self.maps.slots[slot] = MappingSlot {
            access: access | Access::BOUNCED,
            len: len as u16,
            backing: Backing::Bounce {
                phys_first: first.paddr,
                phys_second: 0,
                len_first: len as u16,
                len_second: 0,
                unassigned_first: first.unassigned(),
                unassigned_second: false,
            },
        };
        self.maps.active += 1;
        Ok(MemMapping { slot: slot as u8 })
    }

    /// Segmented variant of [`Cpu::map_linear`].
    pub fn map_seg<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        seg: Seg,
        offset: u64,
        len: u32,
        access: Access,
        align: u32,
        policy: AlignPolicy,
    ) -> Result<MemMapping, MemFault> {
        let seg_access = match access.access_type() {
            AccessType::Write => SegAccess::Write,
            AccessType::Execute => SegAccess::Execute,
            AccessType::Read => SegAccess::Read,
        };
        let linear = apply_segment(&self.state, seg, offset, len, seg_access)?;
        self.map_linear(bus, linear, len, access, align, policy)
    }

    /// The byte view of an active mapping.
    pub fn mapping_slice<'a, B: MemoryBus>(
        &'a mut self,
        bus: &'a mut B,
        mapping: MemMapping,
    ) -> Result<&'a mut [u8], MemFault> {
        let slot = self.maps.slots[mapping.slot as usize];
        match slot.backing {
            Backing::Direct { paddr } => bus
                .direct_mut(paddr, slot.len as usize)
                .ok_or_else(|| PhysAccessError { paddr }.into()),
            Backing::Bounce { .. } => {
                Ok(&mut self.maps.bounce[mapping.slot as usize][..slot.len as usize])
            }
            Backing::Unused => {
                debug_assert!(false, "mapping token used after unmap");
                Err(PlatformError::MappingSlotsExhausted.into())
            }
        }
    }

    /// Commits and releases one mapping.
    ///
    /// Direct mappings only free their slot; bounce-buffered write mappings
    /// flush the staged bytes back to physical memory in ascending address
    /// order (up to two writes for a page-crossing access). Writes to
    /// unassigned space are silently discarded. On a write failure the slot
    /// stays active so the step's rollback sweeps it.
    pub fn commit<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        mapping: MemMapping,
    ) -> Result<(), MemFault> {
        let index = mapping.slot as usize;
        let slot = self.maps.slots[index];
        debug_assert!(slot.in_use(), "mapping token used after unmap");

        if let Backing::Bounce {
            phys_first,
            phys_second,
            len_first,
            len_second,
            unassigned_first,
            unassigned_second,
        } = slot.backing
        {
            if slot.access.contains(Access::TYPE_WRITE) {
                let buf = &self.maps.bounce[index];
                if !unassigned_first {
                    bus.try_write_bytes(phys_first, &buf[..len_first as usize])
                        .map_err(PlatformError::from)?;
                }
                if len_second != 0 && !unassigned_second {
                    bus.try_write_bytes(
                        phys_second,
                        &buf[len_first as usize..(len_first + len_second) as usize],
                    )
                    .map_err(PlatformError::from)?;
                }
            }
        }

        if slot.access.contains(Access::WHAT_STACK) && slot.access.contains(Access::TYPE_WRITE) {
            self.maps.stack_bytes_written += slot.len as u64;
        }

        self.maps.free(index);
        Ok(())
    }

    /// Releases every still-active mapping without writing anything back.
    /// Called once per failed instruction step; afterwards the table is
    /// empty.
    pub fn rollback_all(&mut self) {
        for slot in self.maps.slots.iter_mut() {
            *slot = MappingSlot::UNUSED;
        }
        self.maps.active = 0;
    }

    /// Number of in-flight mappings (diagnostics and tests).
    pub fn active_mappings(&self) -> usize {
        self.maps.active_count()
    }

    /// Bytes committed through stack write mappings (diagnostics).
    pub fn stack_bytes_written(&self) -> u64 {
        self.maps.stack_bytes_written
    }

    fn alignment_checks_armed(&self) -> bool {
        self.mmu.cr0() & CR0_AM != 0 && self.state.get_flag(RFLAGS_AC) && self.state.cpl() == 3
    }

    /// Reads a value through a data segment.
    pub fn read_data<T: MemValue, B: MemoryBus>(
        &mut self,
        bus: &mut B,
        seg: Seg,
        offset: u64,
    ) -> Result<T, MemFault> {
        let mapping = self.map_seg(
            bus,
            seg,
            offset,
            T::LEN,
            Access::DATA_R,
            T::LEN,
            AlignPolicy::Ac,
        )?;
        let bytes = self.mapping_slice(bus, mapping)?;
        let value = T::from_le_slice(bytes);
        self.commit(bus, mapping)?;
        Ok(value)
    }

    /// Writes a value through a data segment.
    pub fn write_data<T: MemValue, B: MemoryBus>(
        &mut self,
        bus: &mut B,
        seg: Seg,
        offset: u64,
        value: T,
    ) -> Result<(), MemFault> {
        let mapping = self.map_seg(
            bus,
            seg,
            offset,
            T::LEN,
            Access::DATA_W,
            T::LEN,
            AlignPolicy::Ac,
        )?;
        let bytes = self.mapping_slice(bus, mapping)?;
        value.write_le(bytes);
        self.commit(bus, mapping)
    }

    /// Reads a value at a linear address as an implicit supervisor access
    /// (descriptor tables, TSS, IVT).
    pub fn read_sys<T: MemValue, B: MemoryBus>(
        &mut self,
        bus: &mut B,
        linear: u64,
    ) -> Result<T, MemFault> {
        let mapping = self.map_linear(bus, linear, T::LEN, Access::SYS_R, 1, AlignPolicy::Ac)?;
        let bytes = self.mapping_slice(bus, mapping)?;
        let value = T::from_le_slice(bytes);
        self.commit(bus, mapping)?;
        Ok(value)
    }

    /// Writes a value at a linear address as an implicit supervisor access.
    pub fn write_sys<T: MemValue, B: MemoryBus>(
        &mut self,
        bus: &mut B,
        linear: u64,
        value: T,
    ) -> Result<(), MemFault> {
        let mapping = self.map_linear(bus, linear, T::LEN, Access::SYS_W, 1, AlignPolicy::Ac)?;
        let bytes = self.mapping_slice(bus, mapping)?;
        value.write_le(bytes);
        self.commit(bus, mapping)
    }

    /// Pushes a value onto the current stack, updating the stack pointer on
    /// success.
    pub fn push<T: MemValue, B: MemoryBus>(
        &mut self,
        bus: &mut B,
        value: T,
    ) -> Result<(), MemFault> {
        let sp = self.state.stack_ptr().wrapping_sub(T::LEN as u64);
        let mapping = self.map_seg(
            bus,
            Seg::Ss,
            sp & stack_mask(&self.state),
            T::LEN,
            Access::STACK_W,
            1,
            AlignPolicy::Ac,
        )?;
        let bytes = self.mapping_slice(bus, mapping)?;
        value.write_le(bytes);
        self.commit(bus, mapping)?;
        self.state.set_stack_ptr(sp);
        Ok(())
    }

    /// Fetches up to `count` (≤ 15) instruction bytes at the current RIP via
    /// the code-fetch translation path.
    pub fn fetch_code_bytes<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        count: usize,
    ) -> Result<[u8; 15], MemFault> {
        let count = count.min(15);
        let mut buf = [0u8; 15];
        if count == 0 {
            return Ok(buf);
        }
        let linear = apply_segment(
            &self.state,
            Seg::Cs,
            self.state.rip(),
            count as u32,
            SegAccess::Execute,
        )?;

        let mut offset = 0usize;
        while offset < count {
            let addr = linear.wrapping_add(offset as u64);
            let t = self
                .mmu
                .translate(bus, addr, AccessType::Execute, self.state.cpl())
                .map_err(fault_of)?;

            let page_rem = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize;
            let chunk = page_rem.min(count - offset);
            let dst = &mut buf[offset..offset + chunk];
            if t.unassigned() {
                dst.fill(UNASSIGNED_FILL);
            } else {
                bus.try_read_bytes(t.paddr, dst)
                    .map_err(PlatformError::from)?;
            }
            offset += chunk;
        }
        Ok(buf)
    }
}

fn direct_ok(t: &Translation, access: Access) -> bool {
    if t.flags & TLBE_F_NO_DIRECT != 0 || t.flags & TLBE_F_PG_UNASSIGNED != 0 {
        return false;
    }
    if access.intersects(Access::TYPE_READ | Access::TYPE_EXEC) && t.flags & TLBE_F_PG_NO_READ != 0
    {
        return false;
    }
    if access.contains(Access::TYPE_WRITE) && t.flags & TLBE_F_PG_NO_WRITE != 0 {
        return false;
    }
    true
}

fn load_bounce<B: MemoryBus>(
    bus: &mut B,
    buf: &mut [u8],
    t: &Translation,
) -> Result<(), MemFault> {
    if t.unassigned() {
        buf.fill(UNASSIGNED_FILL);
        Ok(())
    } else {
        bus.try_read_bytes(t.paddr, buf)
            .map_err(|e| PlatformError::from(e).into())
    }
}

fn fault_of(tf: TranslateFault) -> MemFault {
    match tf {
        TranslateFault::PageFault(pf) => Event::pf(pf.addr, pf.error_code).into(),
        TranslateFault::NonCanonical(_) => Event::gp0().into(),
        TranslateFault::Nested(f) => MemFault::Nested(f),
    }
}

fn stack_mask(state: &crate::state::CpuState) -> u64 {
    match state.mode {
        crate::state::CpuMode::Long => u64::MAX,
        crate::state::CpuMode::Real | crate::state::CpuMode::Vm86 => 0xffff,
        crate::state::CpuMode::Protected => {
            if state.segments.ss.default_big() {
                0xffff_ffff
            } else {
                0xffff
            }
        }
    }
}

/// Little-endian scalar moved through a mapping.
pub trait MemValue: Copy {
    const LEN: u32;
    fn from_le_slice(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_mem_value {
    ($($ty:ty),*) => {$(
        impl MemValue for $ty {
            const LEN: u32 = core::mem::size_of::<$ty>() as u32;

            #[inline]
            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut raw = [0u8; core::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..core::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(raw)
            }

            #[inline]
            fn write_le(self, bytes: &mut [u8]) {
                bytes[..core::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

impl_mem_value!(u8, u16, u32, u64, u128);
