//! Descriptor-table access: GDT/LDT descriptor fetch, accessed-bit marking,
//! and task-state-segment stack sourcing.

use merlin_mmu::MemoryBus;

use crate::event::{Event, MemFault};
use crate::state::{
    SegmentRegister, SEG_ATTR_DB, SEG_ATTR_DPL_SHIFT, SEG_ATTR_G, SEG_ATTR_L, SEG_ATTR_P,
    SEG_ATTR_S,
};
use crate::Cpu;

/// A raw 8-byte segment/system descriptor with field accessors.
///
/// Decoded lazily through methods; gate descriptors are normalized
/// separately by the dispatcher before any branching logic runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub raw: u64,
}

impl Descriptor {
    #[inline]
    pub fn base(&self) -> u64 {
        ((self.raw >> 16) & 0xff_ffff) | ((self.raw >> 32) & 0xff00_0000)
    }

    #[inline]
    pub fn limit(&self) -> u32 {
        let raw = ((self.raw & 0xffff) | ((self.raw >> 32) & 0xf_0000)) as u32;
        if self.granular() {
            (raw << 12) | 0xfff
        } else {
            raw
        }
    }

    #[inline]
    pub fn typ(&self) -> u8 {
        ((self.raw >> 40) & 0xf) as u8
    }

    #[inline]
    pub fn s(&self) -> bool {
        self.raw & (1 << 44) != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        ((self.raw >> 45) & 0x3) as u8
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.raw & (1 << 47) != 0
    }

    #[inline]
    pub fn long(&self) -> bool {
        self.raw & (1 << 53) != 0
    }

    #[inline]
    pub fn default_big(&self) -> bool {
        self.raw & (1 << 54) != 0
    }

    #[inline]
    pub fn granular(&self) -> bool {
        self.raw & (1 << 55) != 0
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.s() && self.typ() & 0x8 != 0
    }

    #[inline]
    pub fn conforming(&self) -> bool {
        self.is_code() && self.typ() & 0x4 != 0
    }

    /// Builds the hidden segment-register cache this descriptor describes.
    pub fn to_segment(&self, selector: u16) -> SegmentRegister {
        let mut attr = (self.typ() as u16) | ((self.dpl() as u16) << SEG_ATTR_DPL_SHIFT);
        if self.s() {
            attr |= SEG_ATTR_S;
        }
        if self.present() {
            attr |= SEG_ATTR_P;
        }
        if self.long() {
            attr |= SEG_ATTR_L;
        }
        if self.default_big() {
            attr |= SEG_ATTR_DB;
        }
        if self.granular() {
            attr |= SEG_ATTR_G;
        }
        SegmentRegister {
            selector,
            base: self.base(),
            limit: self.limit(),
            attr,
        }
    }
}

impl Cpu {
    /// Fetches the descriptor named by `selector` from the GDT or LDT.
    ///
    /// A selector outside its table (or an LDT reference without a usable
    /// LDT) raises `fault_vector` with the selector's non-RPL bits as error
    /// code, OR'd with `err_ext` (the external-event bit when fetching on
    /// behalf of an external interrupt).
    pub fn fetch_descriptor<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        selector: u16,
        fault_vector: u8,
        err_ext: u32,
    ) -> Result<Descriptor, MemFault> {
        let offset = (selector & 0xfff8) as u64;
        let fault =
            || Event::with_error_code(fault_vector, ((selector & 0xfffc) as u32) | err_ext);

        let (base, limit) = if selector & 0b100 != 0 {
            let ldtr = &self.state.tables.ldtr;
            if ldtr.is_unusable() || !ldtr.is_present() {
                return Err(fault().into());
            }
            (ldtr.base, ldtr.limit as u64)
        } else {
            (
                self.state.tables.gdtr.base,
                self.state.tables.gdtr.limit as u64,
            )
        };

        if offset + 7 > limit {
            return Err(fault().into());
        }

        let raw = self.read_sys::<u64, _>(bus, base.wrapping_add(offset))?;
        Ok(Descriptor { raw })
    }

    /// Sets the accessed bit of the descriptor named by `selector`.
    pub fn mark_descriptor_accessed<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        selector: u16,
    ) -> Result<(), MemFault> {
        let offset = (selector & 0xfff8) as u64;
        let base = if selector & 0b100 != 0 {
            self.state.tables.ldtr.base
        } else {
            self.state.tables.gdtr.base
        };
        // Type byte; bit 0 is the accessed bit for code/data descriptors.
        let addr = base.wrapping_add(offset + 5);
        let byte = self.read_sys::<u8, _>(bus, addr)?;
        if byte & 0x1 == 0 {
            self.write_sys(bus, addr, byte | 0x1)?;
        }
        Ok(())
    }

    fn tr_usable(&self) -> bool {
        let tr = &self.state.tables.tr;
        !tr.is_unusable()
            && tr.is_present()
            && (tr.selector >> 3) != 0
            && !tr.s()
            && matches!(tr.typ(), 0x9 | 0xb)
    }

    /// Stack selector:pointer for a privilege-level change, from the 32-bit
    /// TSS.
    pub fn tss32_stack_for_cpl<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        cpl: u8,
    ) -> Result<(u16, u32), MemFault> {
        if !self.tr_usable() || cpl > 2 {
            return Err(Event::ts(0).into());
        }
        let base = self.state.tables.tr.base;
        let limit = self.state.tables.tr.limit as u64;
        let esp_off = 4u64 + (cpl as u64) * 8;
        let ss_off = esp_off + 4;
        if ss_off + 1 > limit {
            return Err(Event::ts(0).into());
        }
        let esp = self.read_sys::<u32, _>(bus, base.wrapping_add(esp_off))?;
        let ss = self.read_sys::<u16, _>(bus, base.wrapping_add(ss_off))?;
        if ss >> 3 == 0 {
            return Err(Event::ts(0).into());
        }
        Ok((ss, esp))
    }

    /// RSPn for a privilege-level change, from the 64-bit TSS.
    pub fn tss64_rsp_for_cpl<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        cpl: u8,
    ) -> Result<u64, MemFault> {
        if !self.tr_usable() || cpl > 2 {
            return Err(Event::ts(0).into());
        }
        let base = self.state.tables.tr.base;
        let limit = self.state.tables.tr.limit as u64;
        let off = 4u64 + (cpl as u64) * 8;
        if off + 7 > limit {
            return Err(Event::ts(0).into());
        }
        self.read_sys(bus, base.wrapping_add(off))
    }

    /// Interrupt-stack-table slot from the 64-bit TSS.
    pub fn tss64_ist_stack<B: MemoryBus>(&mut self, bus: &mut B, ist: u8) -> Result<u64, MemFault> {
        if !self.tr_usable() || !(1..=7).contains(&ist) {
            return Err(Event::ts(0).into());
        }
        let base = self.state.tables.tr.base;
        let limit = self.state.tables.tr.limit as u64;
        let off = 0x24u64 + (ist as u64 - 1) * 8;
        if off + 7 > limit {
            return Err(Event::ts(0).into());
        }
        self.read_sys(bus, base.wrapping_add(off))
    }
}
