//! Exception/interrupt delivery.
//!
//! [`Cpu::raise_xcpt_or_int`] is the single entry point for every event:
//! faults raised by the memory layer, software interrupts from the decode
//! layer, and external interrupts. It classifies the event against whatever
//! is already being delivered (escalating to double/triple fault per the
//! architectural table), offers it to the nested-virtualization intercept
//! hook, then runs the delivery path for the current CPU mode. Failures
//! encountered *while* delivering (descriptor reads, stack pushes) feed back
//! through the same classification.

use merlin_mmu::{is_canonical_48, MemoryBus};

use crate::event::{
    pushes_error_code, vector, Event, EventFlags, ExceptionClass, MemFault, VcpuExit,
};
use crate::intercept::{InterceptDisposition, InterceptHook};
use crate::state::{
    CpuMode, SegmentRegister, DR7_GD, RFLAGS_AC, RFLAGS_IF, RFLAGS_NT, RFLAGS_RF, RFLAGS_TF,
    RFLAGS_VM, SEG_ATTR_DB, SEG_ATTR_P, SEG_ATTR_S, SEG_ATTR_UNUSABLE,
};
use crate::Cpu;

/// Outcome of a delivery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The event (or its escalation) was delivered to the guest.
    Completed,
    /// The nested-virtualization hook claimed the event as a VM exit.
    Redirected {
        exit_code: u64,
        exit_info1: u64,
        exit_info2: u64,
    },
    /// An external NMI is currently blocked; nothing was delivered.
    NmiBlocked,
}

/// Beyond this delivery nesting depth the guest is doing something this core
/// does not model; bail out instead of looping.
const MAX_XCPT_RECURSION: u8 = 4;

/// External-event bit of architectural error codes.
const ERR_EXT: u32 = 1;

/// Error code for a fault located in the IDT: index, IDT bit, EXT bit.
#[inline]
fn idt_err(vec: u8, ext: u32) -> u32 {
    ((vec as u32) << 3) | 2 | ext
}

/// What to do about a new exception arriving during delivery of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RaiseAction {
    Deliver,
    DoubleFault,
    TripleFault,
    CpuHang,
}

fn classify(prev: u8, cur: u8) -> RaiseAction {
    use ExceptionClass as C;
    if C::of(prev) == C::DoubleFault {
        return RaiseAction::TripleFault;
    }
    if prev == vector::AC && cur == vector::AC {
        return RaiseAction::CpuHang;
    }
    match (C::of(prev), C::of(cur)) {
        (C::PageFault, C::PageFault | C::Contributory) => RaiseAction::DoubleFault,
        (C::Contributory, C::Contributory) => RaiseAction::DoubleFault,
        // Everything else — including #PF during NMI delivery, which is
        // merely noted — delivers the new event directly.
        _ => RaiseAction::Deliver,
    }
}

/// Result of one mode-specific delivery path.
enum Delivered {
    /// This event reached the guest.
    This,
    /// A nested exception was delivered instead (or delivery was redirected
    /// partway); the original event is gone.
    Nested(DeliveryOutcome),
}

/// Result of one frame push during delivery.
enum PushOutcome {
    Pushed,
    /// The push faulted and the fault was delivered in its place.
    Nested(DeliveryOutcome),
}

macro_rules! try_mem {
    ($self:ident, $bus:ident, $hook:ident, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(fault) => {
                return $self
                    .handle_mem_fault($bus, $hook, fault)
                    .map(Delivered::Nested)
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateKind {
    Task,
    Interrupt16,
    Trap16,
    Interrupt32,
    Trap32,
    Interrupt64,
    Trap64,
}

impl GateKind {
    fn is_interrupt(self) -> bool {
        matches!(
            self,
            GateKind::Interrupt16 | GateKind::Interrupt32 | GateKind::Interrupt64
        )
    }

    fn is_16bit(self) -> bool {
        matches!(self, GateKind::Interrupt16 | GateKind::Trap16)
    }
}

/// A gate descriptor normalized before any branching logic runs.
#[derive(Debug, Clone, Copy)]
struct Gate {
    kind: GateKind,
    selector: u16,
    offset: u64,
    dpl: u8,
    present: bool,
    ist: u8,
}

fn decode_gate32(raw: u64) -> Option<Gate> {
    let kind = match (raw >> 40) & 0x1f {
        0x05 => GateKind::Task,
        0x06 => GateKind::Interrupt16,
        0x07 => GateKind::Trap16,
        0x0e => GateKind::Interrupt32,
        0x0f => GateKind::Trap32,
        _ => return None,
    };
    Some(Gate {
        kind,
        selector: (raw >> 16) as u16,
        offset: (raw & 0xffff) | ((raw >> 32) & 0xffff_0000),
        dpl: ((raw >> 45) & 0x3) as u8,
        present: raw & (1 << 47) != 0,
        ist: 0,
    })
}

fn decode_gate64(lo: u64, hi: u64) -> Option<Gate> {
    let kind = match (lo >> 40) & 0x1f {
        0x0e => GateKind::Interrupt64,
        0x0f => GateKind::Trap64,
        _ => return None,
    };
    Some(Gate {
        kind,
        selector: (lo >> 16) as u16,
        offset: (lo & 0xffff) | ((lo >> 32) & 0xffff_0000) | (hi << 32),
        dpl: ((lo >> 45) & 0x3) as u8,
        present: lo & (1 << 47) != 0,
        ist: ((lo >> 32) & 0x7) as u8,
    })
}

impl Cpu {
    /// Raises an exception or interrupt and delivers it (or its escalation).
    ///
    /// The pushed return address is the current `rip`: callers keep it at
    /// the faulting instruction for faults and advance it past the
    /// instruction first for traps and software interrupts. All still-active
    /// guest mappings of the failed instruction are rolled back before
    /// anything else happens.
    pub fn raise_xcpt_or_int<B: MemoryBus, H: InterceptHook>(
        &mut self,
        bus: &mut B,
        hook: &mut H,
        event: Event,
    ) -> Result<DeliveryOutcome, VcpuExit> {
        self.rollback_all();
        self.deliver(bus, hook, event)
    }

    /// Raises the architectural fault corresponding to a memory-layer
    /// failure, or surfaces the host-side condition.
    pub fn raise_mem_fault<B: MemoryBus, H: InterceptHook>(
        &mut self,
        bus: &mut B,
        hook: &mut H,
        fault: MemFault,
    ) -> Result<DeliveryOutcome, VcpuExit> {
        self.rollback_all();
        self.handle_mem_fault(bus, hook, fault)
    }

    fn handle_mem_fault<B: MemoryBus, H: InterceptHook>(
        &mut self,
        bus: &mut B,
        hook: &mut H,
        fault: MemFault,
    ) -> Result<DeliveryOutcome, VcpuExit> {
        // A failure mid-delivery may have left a mapping active (a commit
        // that could not write back); sweep before recursing.
        self.rollback_all();
        match fault {
            MemFault::Event(event) => self.deliver(bus, hook, event),
            MemFault::Nested(f) => Err(VcpuExit::NestedPageFault(f)),
            MemFault::Platform(p) => Err(VcpuExit::MemoryFault(p)),
        }
    }

    fn deliver<B: MemoryBus, H: InterceptHook>(
        &mut self,
        bus: &mut B,
        hook: &mut H,
        mut event: Event,
    ) -> Result<DeliveryOutcome, VcpuExit> {
        if event.flags.contains(EventFlags::CPU_XCPT) {
            if self.xcpt_depth >= MAX_XCPT_RECURSION {
                return Err(VcpuExit::NotImplemented("exception recursion too deep"));
            }

            if let Some((prev_vec, prev_flags)) = self.cur_event {
                if prev_flags.contains(EventFlags::CPU_XCPT) {
                    match classify(prev_vec, event.vector) {
                        RaiseAction::Deliver => {
                            if prev_vec == vector::NMI && event.vector == vector::PF {
                                log::trace!("#PF during NMI delivery (not escalated)");
                            }
                        }
                        RaiseAction::DoubleFault => {
                            log::debug!(
                                "escalating to #DF (vector {} during vector {prev_vec})",
                                event.vector
                            );
                            event = Event::df();
                        }
                        RaiseAction::TripleFault => {
                            log::debug!(
                                "vector {} during #DF delivery: triple fault",
                                event.vector
                            );
                            return Err(VcpuExit::TripleFault);
                        }
                        RaiseAction::CpuHang => return Err(VcpuExit::CpuHang),
                    }
                }

                // A fault taken in service of an external event reports the
                // external-event bit (except #PF and #DF, whose error codes
                // have their own formats).
                if prev_flags.contains(EventFlags::EXT_INT)
                    && event.flags.contains(EventFlags::HAS_ERR)
                    && event.vector != vector::PF
                    && event.vector != vector::DF
                {
                    event.error_code |= ERR_EXT;
                }
            }
        }

        // NMI blocking is decided by the nested-virtualization layer,
        // independently of (and before) the intercept check.
        if event.vector == vector::NMI
            && event.flags.contains(EventFlags::EXT_INT)
            && hook.nmi_blocked()
        {
            return Ok(DeliveryOutcome::NmiBlocked);
        }

        if let InterceptDisposition::Redirected {
            exit_code,
            exit_info1,
            exit_info2,
        } = hook.check_event_intercept(event.vector, event.flags, event.error_code, event.cr2)
        {
            return Ok(DeliveryOutcome::Redirected {
                exit_code,
                exit_info1,
                exit_info2,
            });
        }

        if event.flags.contains(EventFlags::HAS_CR2) {
            self.mmu.set_cr2(event.cr2);
        }

        let prev = self.cur_event;
        self.cur_event = Some((event.vector, event.flags));
        self.xcpt_depth += 1;

        let result = match self.state.mode {
            CpuMode::Real => self.deliver_real(bus, hook, &event),
            CpuMode::Vm86 | CpuMode::Protected => self.deliver_protected(bus, hook, &event),
            CpuMode::Long => self.deliver_long(bus, hook, &event),
        };

        self.xcpt_depth -= 1;
        self.cur_event = prev;

        match result? {
            Delivered::Nested(outcome) => Ok(outcome),
            Delivered::This => {
                if event.flags.contains(EventFlags::CPU_XCPT) {
                    match event.vector {
                        // Exactly one cache entry is dropped per committed
                        // #PF, so a retried access re-walks the tables but a
                        // second fault for the same cause stays deliverable.
                        vector::PF => self.mmu.data_cache().invalidate_page(event.cr2),
                        vector::DB => self.state.dr7 &= !DR7_GD,
                        _ => {}
                    }
                }
                Ok(DeliveryOutcome::Completed)
            }
        }
    }

    fn deliver_real<B: MemoryBus, H: InterceptHook>(
        &mut self,
        bus: &mut B,
        hook: &mut H,
        event: &Event,
    ) -> Result<Delivered, VcpuExit> {
        let ivt_off = (event.vector as u64) * 4;
        if ivt_off + 3 > self.state.tables.idtr.limit as u64 {
            return self
                .handle_mem_fault(bus, hook, Event::gp0().into())
                .map(Delivered::Nested);
        }

        let entry = try_mem!(
            self,
            bus,
            hook,
            self.read_sys::<u32, _>(bus, self.state.tables.idtr.base.wrapping_add(ivt_off))
        );
        let offset = entry & 0xffff;
        let segment = (entry >> 16) as u16;

        let flags = self.state.rflags();
        let cs = self.state.segments.cs.selector;
        let ip = self.state.rip() as u16;

        for value in [flags as u16, cs, ip] {
            if let PushOutcome::Nested(outcome) = self.push_checked(bus, hook, value)? {
                return Ok(Delivered::Nested(outcome));
            }
        }

        // Real-mode delivery clears IF, TF and AC.
        self.state
            .set_rflags(flags & !(RFLAGS_IF | RFLAGS_TF | RFLAGS_AC));
        self.state.segments.cs = SegmentRegister::real_mode(segment);
        self.state.set_rip(offset as u64);
        Ok(Delivered::This)
    }

    fn deliver_protected<B: MemoryBus, H: InterceptHook>(
        &mut self,
        bus: &mut B,
        hook: &mut H,
        event: &Event,
    ) -> Result<Delivered, VcpuExit> {
        let ext = if event.flags.contains(EventFlags::EXT_INT) {
            ERR_EXT
        } else {
            0
        };

        let idt_off = (event.vector as u64) * 8;
        if idt_off + 7 > self.state.tables.idtr.limit as u64 {
            return self
                .handle_mem_fault(bus, hook, Event::gp(idt_err(event.vector, ext)).into())
                .map(Delivered::Nested);
        }
        let raw = try_mem!(
            self,
            bus,
            hook,
            self.read_sys::<u64, _>(bus, self.state.tables.idtr.base.wrapping_add(idt_off))
        );

        let gate = match decode_gate32(raw) {
            Some(gate) => gate,
            None => {
                return self
                    .handle_mem_fault(bus, hook, Event::gp(idt_err(event.vector, ext)).into())
                    .map(Delivered::Nested)
            }
        };

        // Software-originated events honor the gate DPL; ICEBP is privileged
        // despite being a software instruction.
        if event.flags.contains(EventFlags::SOFT_INT)
            && !event.flags.contains(EventFlags::ICEBP_INSTR)
            && self.state.cpl() > gate.dpl
        {
            return self
                .handle_mem_fault(bus, hook, Event::gp(idt_err(event.vector, ext)).into())
                .map(Delivered::Nested);
        }

        if !gate.present {
            return self
                .handle_mem_fault(bus, hook, Event::np(idt_err(event.vector, ext)).into())
                .map(Delivered::Nested);
        }

        if gate.kind == GateKind::Task {
            return self.task_switch(bus, hook, event, gate.selector, ext);
        }

        let cs_sel = gate.selector;
        if cs_sel & 0xfffc == 0 {
            return self
                .handle_mem_fault(bus, hook, Event::gp(ext).into())
                .map(Delivered::Nested);
        }

        let cs_desc = try_mem!(
            self,
            bus,
            hook,
            self.fetch_descriptor(bus, cs_sel, vector::GP, ext)
        );
        let sel_err = ((cs_sel & 0xfffc) as u32) | ext;
        if !cs_desc.is_code() || cs_desc.dpl() > self.state.cpl() {
            return self
                .handle_mem_fault(bus, hook, Event::gp(sel_err).into())
                .map(Delivered::Nested);
        }
        if !cs_desc.present() {
            return self
                .handle_mem_fault(bus, hook, Event::np(sel_err).into())
                .map(Delivered::Nested);
        }
        if gate.offset > cs_desc.limit() as u64 {
            return self
                .handle_mem_fault(bus, hook, Event::gp(ext).into())
                .map(Delivered::Nested);
        }

        let cpl = self.state.cpl();
        let new_cpl = if cs_desc.conforming() {
            cpl
        } else {
            cs_desc.dpl()
        };
        let vm86 = self.state.get_flag(RFLAGS_VM);
        if vm86 && cs_desc.dpl() != 0 {
            // V8086 interrupts must land on a ring-0 handler.
            return self
                .handle_mem_fault(bus, hook, Event::gp(sel_err).into())
                .map(Delivered::Nested);
        }

        let old_flags = self.state.rflags();
        let old_cs = self.state.segments.cs.selector;
        let old_ss = self.state.segments.ss.selector;
        let old_rip = self.state.rip();
        let old_sp = self.state.stack_ptr();
        let old_segs = self.state.segments;

        if new_cpl < cpl || vm86 {
            let (ss_sel_raw, new_esp) =
                try_mem!(self, bus, hook, self.tss32_stack_for_cpl(bus, new_cpl));
            if ss_sel_raw & 0xfffc == 0 {
                return self
                    .handle_mem_fault(bus, hook, Event::ts(ext).into())
                    .map(Delivered::Nested);
            }
            let ss_desc = try_mem!(
                self,
                bus,
                hook,
                self.fetch_descriptor(bus, ss_sel_raw, vector::TS, ext)
            );
            let ss_err = ((ss_sel_raw & 0xfffc) as u32) | ext;
            if (ss_sel_raw & 0x3) as u8 != new_cpl
                || ss_desc.dpl() != new_cpl
                || !ss_desc.s()
                || ss_desc.is_code()
                || ss_desc.typ() & 0x2 == 0
            {
                return self
                    .handle_mem_fault(bus, hook, Event::ts(ss_err).into())
                    .map(Delivered::Nested);
            }
            if !ss_desc.present() {
                return self
                    .handle_mem_fault(bus, hook, Event::ss(ss_err).into())
                    .map(Delivered::Nested);
            }

            // Switch to the handler's privilege level and stack before
            // touching it, so paging permission checks observe the new CPL.
            let ss_sel = (ss_sel_raw & !0b11) | new_cpl as u16;
            if vm86 {
                self.state.set_flag(RFLAGS_VM, false);
                self.state.mode = CpuMode::Protected;
            }
            self.state.segments.ss = ss_desc.to_segment(ss_sel);
            self.state.set_stack_ptr(new_esp as u64);
            self.state.set_cpl(new_cpl);

            if vm86 {
                // Extra selector pushes so the handler can restore the V86
                // segment state; the data segments are then unusable.
                for sel in [old_segs.gs, old_segs.fs, old_segs.ds, old_segs.es] {
                    if let PushOutcome::Nested(outcome) =
                        self.push_gate(bus, hook, &gate, sel.selector as u32)?
                    {
                        return Ok(Delivered::Nested(outcome));
                    }
                }
                for seg in [
                    crate::state::Seg::Gs,
                    crate::state::Seg::Fs,
                    crate::state::Seg::Ds,
                    crate::state::Seg::Es,
                ] {
                    *self.state.segments.get_mut(seg) = SegmentRegister {
                        selector: 0,
                        base: 0,
                        limit: 0,
                        attr: SEG_ATTR_UNUSABLE,
                    };
                }
            }

            for value in [old_ss as u32, old_sp as u32] {
                if let PushOutcome::Nested(outcome) = self.push_gate(bus, hook, &gate, value)? {
                    return Ok(Delivered::Nested(outcome));
                }
            }
        }

        for value in [old_flags as u32, old_cs as u32, old_rip as u32] {
            if let PushOutcome::Nested(outcome) = self.push_gate(bus, hook, &gate, value)? {
                return Ok(Delivered::Nested(outcome));
            }
        }
        if event.flags.contains(EventFlags::HAS_ERR) && pushes_error_code(event.vector) {
            if let PushOutcome::Nested(outcome) =
                self.push_gate(bus, hook, &gate, event.error_code)?
            {
                return Ok(Delivered::Nested(outcome));
            }
        }

        let mut new_flags = self.state.rflags();
        if gate.kind.is_interrupt() {
            new_flags &= !RFLAGS_IF;
        }
        new_flags &= !(RFLAGS_TF | RFLAGS_NT | RFLAGS_RF | RFLAGS_VM);
        self.state.set_rflags(new_flags);
        self.state.mode = CpuMode::Protected;

        self.state.segments.cs = cs_desc.to_segment((cs_sel & !0b11) | new_cpl as u16);
        self.state.set_cpl(new_cpl);
        let ip_mask: u64 = if gate.kind.is_16bit() { 0xffff } else { 0xffff_ffff };
        self.state.set_rip(gate.offset & ip_mask);

        try_mem!(self, bus, hook, self.mark_descriptor_accessed(bus, cs_sel));
        Ok(Delivered::This)
    }

    fn deliver_long<B: MemoryBus, H: InterceptHook>(
        &mut self,
        bus: &mut B,
        hook: &mut H,
        event: &Event,
    ) -> Result<Delivered, VcpuExit> {
        let ext = if event.flags.contains(EventFlags::EXT_INT) {
            ERR_EXT
        } else {
            0
        };

        let idt_off = (event.vector as u64) * 16;
        if idt_off + 15 > self.state.tables.idtr.limit as u64 {
            return self
                .handle_mem_fault(bus, hook, Event::gp(idt_err(event.vector, ext)).into())
                .map(Delivered::Nested);
        }
        let base = self.state.tables.idtr.base;
        let lo = try_mem!(self, bus, hook, self.read_sys::<u64, _>(bus, base.wrapping_add(idt_off)));
        let hi = try_mem!(
            self,
            bus,
            hook,
            self.read_sys::<u64, _>(bus, base.wrapping_add(idt_off + 8))
        );

        let gate = match decode_gate64(lo, hi) {
            Some(gate) => gate,
            None => {
                return self
                    .handle_mem_fault(bus, hook, Event::gp(idt_err(event.vector, ext)).into())
                    .map(Delivered::Nested)
            }
        };

        if event.flags.contains(EventFlags::SOFT_INT)
            && !event.flags.contains(EventFlags::ICEBP_INSTR)
            && self.state.cpl() > gate.dpl
        {
            return self
                .handle_mem_fault(bus, hook, Event::gp(idt_err(event.vector, ext)).into())
                .map(Delivered::Nested);
        }
        if !gate.present {
            return self
                .handle_mem_fault(bus, hook, Event::np(idt_err(event.vector, ext)).into())
                .map(Delivered::Nested);
        }

        let cs_sel = gate.selector;
        if cs_sel & 0xfffc == 0 {
            return self
                .handle_mem_fault(bus, hook, Event::gp(ext).into())
                .map(Delivered::Nested);
        }
        let cs_desc = try_mem!(
            self,
            bus,
            hook,
            self.fetch_descriptor(bus, cs_sel, vector::GP, ext)
        );
        let sel_err = ((cs_sel & 0xfffc) as u32) | ext;
        // Long-mode delivery requires a 64-bit code segment.
        if !cs_desc.is_code()
            || !cs_desc.long()
            || cs_desc.default_big()
            || cs_desc.dpl() > self.state.cpl()
        {
            return self
                .handle_mem_fault(bus, hook, Event::gp(sel_err).into())
                .map(Delivered::Nested);
        }
        if !cs_desc.present() {
            return self
                .handle_mem_fault(bus, hook, Event::np(sel_err).into())
                .map(Delivered::Nested);
        }
        if !is_canonical_48(gate.offset) {
            return self
                .handle_mem_fault(bus, hook, Event::gp(ext).into())
                .map(Delivered::Nested);
        }

        let cpl = self.state.cpl();
        let new_cpl = if cs_desc.conforming() {
            cpl
        } else {
            cs_desc.dpl()
        };

        let old_flags = self.state.rflags();
        let old_cs = self.state.segments.cs.selector;
        let old_ss = self.state.segments.ss.selector;
        let old_rip = self.state.rip();
        let old_rsp = self.state.read_gpr64(crate::state::gpr::RSP);

        // Source the new stack: an IST slot if the gate names one, else the
        // TSS RSP for the target privilege level on a privilege change.
        let mut new_rsp = old_rsp;
        if gate.ist != 0 {
            let rsp = try_mem!(self, bus, hook, self.tss64_ist_stack(bus, gate.ist));
            if rsp == 0 || !is_canonical_48(rsp) {
                return self
                    .handle_mem_fault(bus, hook, Event::ts(ext).into())
                    .map(Delivered::Nested);
            }
            new_rsp = rsp;
        } else if new_cpl < cpl {
            let rsp = try_mem!(self, bus, hook, self.tss64_rsp_for_cpl(bus, new_cpl));
            if rsp == 0 || !is_canonical_48(rsp) {
                return self
                    .handle_mem_fault(bus, hook, Event::ts(ext).into())
                    .map(Delivered::Nested);
            }
            new_rsp = rsp;
        }

        if new_cpl < cpl {
            self.state.set_cpl(new_cpl);
            // IA-32e privilege transitions load a NULL selector into SS; the
            // cache stays flat so stack accesses keep working.
            self.state.segments.ss = SegmentRegister {
                selector: new_cpl as u16,
                base: 0,
                limit: 0xffff_ffff,
                attr: SEG_ATTR_P | SEG_ATTR_S | 0x3 | SEG_ATTR_DB,
            };
        }

        // The handler stack pointer is always 16-byte aligned.
        self.state
            .write_gpr64(crate::state::gpr::RSP, new_rsp & !0xf);

        // Fixed 5-or-6 slot frame: SS, RSP, RFLAGS, CS (carrying the old
        // CPL), RIP, optional error code.
        for value in [old_ss as u64, old_rsp, old_flags, old_cs as u64, old_rip] {
            if let PushOutcome::Nested(outcome) = self.push_checked(bus, hook, value)? {
                return Ok(Delivered::Nested(outcome));
            }
        }
        if event.flags.contains(EventFlags::HAS_ERR) && pushes_error_code(event.vector) {
            if let PushOutcome::Nested(outcome) =
                self.push_checked(bus, hook, event.error_code as u64)?
            {
                return Ok(Delivered::Nested(outcome));
            }
        }

        let mut new_flags = self.state.rflags();
        if gate.kind.is_interrupt() {
            new_flags &= !RFLAGS_IF;
        }
        new_flags &= !(RFLAGS_TF | RFLAGS_NT | RFLAGS_RF | RFLAGS_VM);
        self.state.set_rflags(new_flags);

        self.state.segments.cs = cs_desc.to_segment((cs_sel & !0b11) | new_cpl as u16);
        self.state.set_cpl(new_cpl);
        self.state.set_rip(gate.offset);

        try_mem!(self, bus, hook, self.mark_descriptor_accessed(bus, cs_sel));
        Ok(Delivered::This)
    }

    /// Task-gate delivery: a full 32-bit task switch into the TSS named by
    /// the gate, with the event's error code pushed on the incoming task's
    /// stack.
    fn task_switch<B: MemoryBus, H: InterceptHook>(
        &mut self,
        bus: &mut B,
        hook: &mut H,
        event: &Event,
        tss_sel: u16,
        ext: u32,
    ) -> Result<Delivered, VcpuExit> {
        let sel_err = ((tss_sel & 0xfffc) as u32) | ext;

        // The TSS selector must name a GDT descriptor.
        if tss_sel & 0xfffc == 0 || tss_sel & 0b100 != 0 {
            return self
                .handle_mem_fault(bus, hook, Event::gp(sel_err).into())
                .map(Delivered::Nested);
        }
        let desc = try_mem!(
            self,
            bus,
            hook,
            self.fetch_descriptor(bus, tss_sel, vector::GP, ext)
        );
        if desc.s() {
            return self
                .handle_mem_fault(bus, hook, Event::gp(sel_err).into())
                .map(Delivered::Nested);
        }
        match desc.typ() {
            0x9 => {}
            0xb => {
                // Already busy.
                return self
                    .handle_mem_fault(bus, hook, Event::gp(sel_err).into())
                    .map(Delivered::Nested);
            }
            0x1 | 0x3 => {
                return Err(VcpuExit::NotImplemented("16-bit TSS task switch"));
            }
            _ => {
                return self
                    .handle_mem_fault(bus, hook, Event::gp(sel_err).into())
                    .map(Delivered::Nested);
            }
        }
        if !desc.present() {
            return self
                .handle_mem_fault(bus, hook, Event::np(sel_err).into())
                .map(Delivered::Nested);
        }
        if desc.limit() < 0x67 {
            return self
                .handle_mem_fault(bus, hook, Event::ts(sel_err).into())
                .map(Delivered::Nested);
        }

        log::debug!("task switch to TSS {tss_sel:#x} for vector {}", event.vector);

        let new_base = desc.base();
        let old_base = self.state.tables.tr.base;
        let old_tr_sel = self.state.tables.tr.selector;

        // Save the outgoing context into the current TSS.
        let out: [(u64, u32); 16] = [
            (0x20, self.state.rip() as u32),
            (0x24, self.state.rflags() as u32),
            (0x28, self.state.read_gpr32(crate::state::gpr::RAX)),
            (0x2c, self.state.read_gpr32(crate::state::gpr::RCX)),
            (0x30, self.state.read_gpr32(crate::state::gpr::RDX)),
            (0x34, self.state.read_gpr32(crate::state::gpr::RBX)),
            (0x38, self.state.read_gpr32(crate::state::gpr::RSP)),
            (0x3c, self.state.read_gpr32(crate::state::gpr::RBP)),
            (0x40, self.state.read_gpr32(crate::state::gpr::RSI)),
            (0x44, self.state.read_gpr32(crate::state::gpr::RDI)),
            (0x48, self.state.segments.es.selector as u32),
            (0x4c, self.state.segments.cs.selector as u32),
            (0x50, self.state.segments.ss.selector as u32),
            (0x54, self.state.segments.ds.selector as u32),
            (0x58, self.state.segments.fs.selector as u32),
            (0x5c, self.state.segments.gs.selector as u32),
        ];
        for (off, value) in out {
            try_mem!(self, bus, hook, self.write_sys(bus, old_base.wrapping_add(off), value));
        }

        // Incoming context.
        let new_cr3 = try_mem!(self, bus, hook, self.read_sys::<u32, _>(bus, new_base + 0x1c));
        let new_eip = try_mem!(self, bus, hook, self.read_sys::<u32, _>(bus, new_base + 0x20));
        let mut new_eflags =
            try_mem!(self, bus, hook, self.read_sys::<u32, _>(bus, new_base + 0x24)) as u64;
        let mut gprs = [0u32; 8];
        for (i, slot) in gprs.iter_mut().enumerate() {
            *slot = try_mem!(
                self,
                bus,
                hook,
                self.read_sys::<u32, _>(bus, new_base + 0x28 + (i as u64) * 4)
            );
        }
        let mut sels = [0u16; 6];
        for (i, slot) in sels.iter_mut().enumerate() {
            *slot = try_mem!(
                self,
                bus,
                hook,
                self.read_sys::<u16, _>(bus, new_base + 0x48 + (i as u64) * 4)
            );
        }
        let ldt_sel = try_mem!(self, bus, hook, self.read_sys::<u16, _>(bus, new_base + 0x60));

        // Interrupt-initiated switches nest: back-link to the outgoing task,
        // NT set in the incoming context, outgoing TSS stays busy.
        try_mem!(self, bus, hook, self.write_sys(bus, new_base, old_tr_sel));
        new_eflags |= RFLAGS_NT;

        // Mark the incoming TSS busy.
        let type_byte_addr = self
            .state
            .tables
            .gdtr
            .base
            .wrapping_add((tss_sel & 0xfff8) as u64 + 5);
        let type_byte = try_mem!(self, bus, hook, self.read_sys::<u8, _>(bus, type_byte_addr));
        try_mem!(self, bus, hook, self.write_sys(bus, type_byte_addr, type_byte | 0x2));

        // Commit the incoming execution state.
        self.mmu.set_cr3(new_cr3 as u64);
        self.state.set_rflags(new_eflags);
        self.state.set_rip(new_eip as u64);
        for (i, value) in gprs.into_iter().enumerate() {
            self.state.write_gpr32(i, value);
        }

        let vm86 = new_eflags & RFLAGS_VM != 0;
        self.state.mode = if vm86 { CpuMode::Vm86 } else { CpuMode::Protected };

        self.state.tables.tr = SegmentRegister {
            selector: tss_sel,
            base: new_base,
            limit: desc.limit(),
            // Busy 32-bit TSS.
            attr: SEG_ATTR_P | 0xb,
        };

        // LDTR, then the incoming segment registers.
        if ldt_sel & 0xfffc != 0 {
            let ldt_desc = try_mem!(
                self,
                bus,
                hook,
                self.fetch_descriptor(bus, ldt_sel, vector::TS, ext)
            );
            if ldt_desc.s() || ldt_desc.typ() != 0x2 || !ldt_desc.present() {
                return self
                    .handle_mem_fault(
                        bus,
                        hook,
                        Event::ts(((ldt_sel & 0xfffc) as u32) | ext).into(),
                    )
                    .map(Delivered::Nested);
            }
            self.state.tables.ldtr = ldt_desc.to_segment(ldt_sel);
        } else {
            self.state.tables.ldtr = SegmentRegister {
                selector: ldt_sel,
                base: 0,
                limit: 0,
                attr: SEG_ATTR_UNUSABLE,
            };
        }

        if vm86 {
            let [es, cs, ss, ds, fs, gs] = sels;
            self.state.segments.es = SegmentRegister::real_mode(es);
            self.state.segments.cs = SegmentRegister::real_mode(cs);
            self.state.segments.ss = SegmentRegister::real_mode(ss);
            self.state.segments.ds = SegmentRegister::real_mode(ds);
            self.state.segments.fs = SegmentRegister::real_mode(fs);
            self.state.segments.gs = SegmentRegister::real_mode(gs);
        } else {
            let new_cpl = (sels[1] & 0x3) as u8;
            self.state.set_cpl(new_cpl);
            for (i, sel) in sels.into_iter().enumerate() {
                let seg = match i {
                    0 => crate::state::Seg::Es,
                    1 => crate::state::Seg::Cs,
                    2 => crate::state::Seg::Ss,
                    3 => crate::state::Seg::Ds,
                    4 => crate::state::Seg::Fs,
                    5 => crate::state::Seg::Gs,
                    _ => unreachable!(),
                };
                if sel & 0xfffc == 0 {
                    // Null: CS and SS may not be null in the incoming task.
                    if matches!(seg, crate::state::Seg::Cs | crate::state::Seg::Ss) {
                        return self
                            .handle_mem_fault(bus, hook, Event::ts(ext).into())
                            .map(Delivered::Nested);
                    }
                    *self.state.segments.get_mut(seg) = SegmentRegister {
                        selector: sel,
                        base: 0,
                        limit: 0,
                        attr: SEG_ATTR_UNUSABLE,
                    };
                    continue;
                }
                let seg_desc = try_mem!(
                    self,
                    bus,
                    hook,
                    self.fetch_descriptor(bus, sel, vector::TS, ext)
                );
                let seg_err = ((sel & 0xfffc) as u32) | ext;
                let valid = match seg {
                    crate::state::Seg::Cs => seg_desc.is_code(),
                    crate::state::Seg::Ss => {
                        seg_desc.s() && !seg_desc.is_code() && seg_desc.typ() & 0x2 != 0
                    }
                    _ => seg_desc.s() && (!seg_desc.is_code() || seg_desc.typ() & 0x2 != 0),
                };
                if !valid {
                    return self
                        .handle_mem_fault(bus, hook, Event::ts(seg_err).into())
                        .map(Delivered::Nested);
                }
                if !seg_desc.present() {
                    return self
                        .handle_mem_fault(bus, hook, Event::np(seg_err).into())
                        .map(Delivered::Nested);
                }
                *self.state.segments.get_mut(seg) = seg_desc.to_segment(sel);
            }
        }

        // The incoming EIP must lie inside the new code segment.
        if self.state.rip() > self.state.segments.cs.limit as u64 {
            return self
                .handle_mem_fault(bus, hook, Event::gp(ext).into())
                .map(Delivered::Nested);
        }

        if event.flags.contains(EventFlags::HAS_ERR) && pushes_error_code(event.vector) {
            if let PushOutcome::Nested(outcome) =
                self.push_checked(bus, hook, event.error_code)?
            {
                return Ok(Delivered::Nested(outcome));
            }
        }

        Ok(Delivered::This)
    }

    fn push_checked<T: crate::memmap::MemValue, B: MemoryBus, H: InterceptHook>(
        &mut self,
        bus: &mut B,
        hook: &mut H,
        value: T,
    ) -> Result<PushOutcome, VcpuExit> {
        match self.push(bus, value) {
            Ok(()) => Ok(PushOutcome::Pushed),
            Err(fault) => self
                .handle_mem_fault(bus, hook, fault)
                .map(PushOutcome::Nested),
        }
    }

    /// Push with the width of the delivering gate.
    fn push_gate<B: MemoryBus, H: InterceptHook>(
        &mut self,
        bus: &mut B,
        hook: &mut H,
        gate: &Gate,
        value: u32,
    ) -> Result<PushOutcome, VcpuExit> {
        if gate.kind.is_16bit() {
            self.push_checked(bus, hook, value as u16)
        } else {
            self.push_checked(bus, hook, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table_matches_architecture() {
        use RaiseAction as A;

        // (page-fault, page-fault | contributory) escalates.
        assert_eq!(classify(vector::PF, vector::PF), A::DoubleFault);
        assert_eq!(classify(vector::PF, vector::GP), A::DoubleFault);
        assert_eq!(classify(vector::PF, vector::TS), A::DoubleFault);

        // (contributory, contributory) escalates; contributory then #PF is
        // delivered serially.
        assert_eq!(classify(vector::GP, vector::GP), A::DoubleFault);
        assert_eq!(classify(vector::NP, vector::SS), A::DoubleFault);
        assert_eq!(classify(vector::GP, vector::PF), A::Deliver);

        // Anything during #DF delivery is terminal.
        assert_eq!(classify(vector::DF, vector::GP), A::TripleFault);
        assert_eq!(classify(vector::DF, vector::DF), A::TripleFault);
        assert_eq!(classify(vector::DF, vector::UD), A::TripleFault);

        // NMI followed by #PF is tagged but not escalated.
        assert_eq!(classify(vector::NMI, vector::PF), A::Deliver);

        // Benign pairs deliver.
        assert_eq!(classify(vector::UD, vector::GP), A::Deliver);
        assert_eq!(classify(vector::DB, vector::DB), A::Deliver);

        // Two alignment checks hang the CPU.
        assert_eq!(classify(vector::AC, vector::AC), A::CpuHang);
    }

    #[test]
    fn gate32_decoding_normalizes_types() {
        // Present 32-bit interrupt gate, DPL 3, selector 0x08, offset
        // 0x12345678 (type_attr 0xEE = P | DPL3 | 0xE).
        let raw = 0x5678u64 | (0x08u64 << 16) | (0xeeu64 << 40) | (0x1234u64 << 48);
        let gate = decode_gate32(raw).unwrap();
        assert_eq!(gate.kind, GateKind::Interrupt32);
        assert_eq!(gate.selector, 0x08);
        assert_eq!(gate.offset, 0x1234_5678);
        assert_eq!(gate.dpl, 3);
        assert!(gate.present);

        // Present task gate to TSS selector 0x28.
        let raw = (0x85u64 << 40) | (0x28u64 << 16);
        let gate = decode_gate32(raw).unwrap();
        assert_eq!(gate.kind, GateKind::Task);
        assert_eq!(gate.selector, 0x28);

        // Garbage type is rejected before any other checks run.
        assert!(decode_gate32(0x1u64 << 40).is_none());
    }

    #[test]
    fn gate64_decoding_carries_ist_and_wide_offset() {
        // Present 64-bit interrupt gate, IST 2, selector 0x08, offset
        // 0x0000_7fff_dead_beef.
        let lo = 0xbeefu64 | (0x08u64 << 16) | (2u64 << 32) | (0x8eu64 << 40) | (0xdeadu64 << 48);
        let hi = 0x0000_7fffu64;
        let gate = decode_gate64(lo, hi).unwrap();
        assert_eq!(gate.kind, GateKind::Interrupt64);
        assert_eq!(gate.ist, 2);
        assert_eq!(gate.dpl, 0);
        assert!(gate.present);
        assert_eq!(gate.offset, 0x0000_7fff_dead_beef);
    }
}
