//! Segmentation: logical address to linear address.
//!
//! Pure functions of the CPU-visible segment-register state; the only side
//! effect is the returned fault.

use crate::event::Event;
use crate::state::{CpuMode, CpuState, Seg};
use merlin_mmu::is_canonical_48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegAccess {
    Read,
    Write,
    Execute,
}

/// Applies segment base/limit/permission rules to `offset`, producing a
/// linear address.
///
/// In 64-bit mode only FS/GS contribute a base and the sole check is that
/// the first and last byte are canonical (#GP(0) otherwise). In 16/32-bit
/// modes the segment must be usable and present, the access must agree with
/// the segment type, and the offset range must satisfy the (expand-up or
/// expand-down) limit; violations raise #SS for SS-relative accesses and
/// #GP otherwise.
pub fn apply_segment(
    state: &CpuState,
    seg: Seg,
    offset: u64,
    len: u32,
    access: SegAccess,
) -> Result<u64, Event> {
    debug_assert!(len >= 1);

    if state.mode == CpuMode::Long {
        let base = match seg {
            Seg::Fs | Seg::Gs => state.segments.get(seg).base,
            _ => 0,
        };
        let first = base.wrapping_add(offset);
        let last = first.wrapping_add(len as u64 - 1);
        if !is_canonical_48(first) || !is_canonical_48(last) {
            return Err(Event::gp0());
        }
        return Ok(first);
    }

    let reg = state.segments.get(seg);

    if state.mode == CpuMode::Real || state.mode == CpuMode::Vm86 {
        let last = match offset.checked_add(len as u64 - 1) {
            Some(v) => v,
            None => return Err(seg_fault(seg, 0)),
        };
        if last > reg.limit as u64 {
            return Err(seg_fault(seg, 0));
        }
        return Ok(reg.base.wrapping_add(offset) & 0xffff_ffff);
    }

    if reg.is_unusable() {
        return Err(seg_fault(seg, 0));
    }
    if !reg.is_present() {
        return Err(seg_fault(seg, reg.selector));
    }

    match access {
        SegAccess::Write => {
            if !reg.writable() {
                return Err(seg_fault(seg, reg.selector));
            }
        }
        SegAccess::Read => {
            if !reg.readable() {
                return Err(seg_fault(seg, reg.selector));
            }
        }
        SegAccess::Execute => {
            if !reg.is_code() {
                return Err(seg_fault(seg, reg.selector));
            }
        }
    }

    let last = match offset.checked_add(len as u64 - 1) {
        Some(v) => v,
        None => return Err(seg_fault(seg, reg.selector)),
    };

    if reg.expand_down() {
        // Valid range is (limit, upper]; the limit names the last *invalid*
        // offset.
        let upper: u64 = if reg.default_big() { 0xffff_ffff } else { 0xffff };
        if offset <= reg.limit as u64 || last > upper {
            return Err(seg_fault(seg, reg.selector));
        }
    } else if last > reg.limit as u64 {
        return Err(seg_fault(seg, reg.selector));
    }

    Ok(reg.base.wrapping_add(offset) & 0xffff_ffff)
}

/// #SS for stack-segment violations, #GP otherwise; error code 0 for a null
/// selector context, else the selector's non-RPL bits.
fn seg_fault(seg: Seg, selector: u16) -> Event {
    let err = (selector & !0b11) as u32;
    if seg == Seg::Ss {
        Event::ss(err)
    } else {
        Event::gp(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SegmentRegister, SEG_ATTR_DB, SEG_ATTR_P, SEG_ATTR_S};

    fn protected_state() -> CpuState {
        let mut state = CpuState::new(CpuMode::Protected);
        state.segments.ds = SegmentRegister {
            selector: 0x10,
            base: 0x1000,
            limit: 0xfff,
            // Read/write data.
            attr: SEG_ATTR_P | SEG_ATTR_S | 0x3 | SEG_ATTR_DB,
        };
        state
    }

    #[test]
    fn protected_limit_violation_reports_selector() {
        let state = protected_state();
        assert_eq!(
            apply_segment(&state, Seg::Ds, 0xffc, 4, SegAccess::Read),
            Ok(0x1ffc)
        );
        assert_eq!(
            apply_segment(&state, Seg::Ds, 0xffd, 4, SegAccess::Read),
            Err(Event::gp(0x10))
        );
    }

    #[test]
    fn write_to_read_only_segment_faults() {
        let mut state = protected_state();
        // Read-only data (type 1).
        state.segments.ds.attr = SEG_ATTR_P | SEG_ATTR_S | 0x1;
        assert!(apply_segment(&state, Seg::Ds, 0, 4, SegAccess::Read).is_ok());
        assert_eq!(
            apply_segment(&state, Seg::Ds, 0, 4, SegAccess::Write),
            Err(Event::gp(0x10))
        );
    }

    #[test]
    fn read_through_execute_only_code_faults() {
        let mut state = protected_state();
        // Execute-only code (type 8).
        state.segments.ds.attr = SEG_ATTR_P | SEG_ATTR_S | 0x8;
        assert_eq!(
            apply_segment(&state, Seg::Ds, 0, 1, SegAccess::Read),
            Err(Event::gp(0x10))
        );
        assert!(apply_segment(&state, Seg::Ds, 0, 1, SegAccess::Execute).is_ok());
    }

    #[test]
    fn expand_down_inverts_the_limit() {
        let mut state = protected_state();
        // Expand-down read/write data (type 7), 32-bit upper bound.
        state.segments.ds.attr = SEG_ATTR_P | SEG_ATTR_S | 0x7 | SEG_ATTR_DB;
        state.segments.ds.limit = 0xfff;
        // Offsets at or below the limit are the *invalid* ones.
        assert_eq!(
            apply_segment(&state, Seg::Ds, 0xfff, 1, SegAccess::Read),
            Err(Event::gp(0x10))
        );
        assert_eq!(
            apply_segment(&state, Seg::Ds, 0x1000, 4, SegAccess::Read),
            Ok(0x2000)
        );
    }

    #[test]
    fn stack_segment_violations_raise_ss() {
        let mut state = protected_state();
        state.segments.ss = SegmentRegister {
            selector: 0x18,
            base: 0,
            limit: 0xff,
            attr: SEG_ATTR_P | SEG_ATTR_S | 0x3,
        };
        assert_eq!(
            apply_segment(&state, Seg::Ss, 0x100, 2, SegAccess::Write),
            Err(Event::ss(0x18))
        );
    }

    #[test]
    fn real_mode_checks_the_cached_limit() {
        let state = CpuState::new(CpuMode::Real);
        assert_eq!(
            apply_segment(&state, Seg::Ds, 0xffff, 1, SegAccess::Read),
            Ok(0xffff)
        );
        assert_eq!(
            apply_segment(&state, Seg::Ds, 0xffff, 2, SegAccess::Read),
            Err(Event::gp0())
        );
    }

    #[test]
    fn long_mode_applies_fs_base_and_canonical_checks() {
        let mut state = CpuState::new(CpuMode::Long);
        state.segments.fs.base = 0x1_0000;
        assert_eq!(
            apply_segment(&state, Seg::Fs, 0x234, 8, SegAccess::Read),
            Ok(0x1_0234)
        );
        // DS base is ignored.
        state.segments.ds.base = 0x5000;
        assert_eq!(
            apply_segment(&state, Seg::Ds, 0x234, 8, SegAccess::Read),
            Ok(0x234)
        );
        // Last byte lands in non-canonical space.
        assert_eq!(
            apply_segment(&state, Seg::Ds, 0x0000_7fff_ffff_fffc, 8, SegAccess::Read),
            Err(Event::gp0())
        );
    }
}
