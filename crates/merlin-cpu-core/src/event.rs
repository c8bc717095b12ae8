//! Architectural events (exceptions and interrupts) and the error taxonomy.
//!
//! An [`Event`] is an ordinary value: translation and mapping code returns it
//! through `Result` and the dispatcher is the single authority that turns it
//! into a delivered exception, a double fault, or a triple fault. Host-side
//! failures are kept strictly apart in [`PlatformError`]; they are never
//! delivered to the guest.

use bitflags::bitflags;
use merlin_mmu::{PhysAccessError, SecondLevelFault};
use thiserror::Error;

/// Architecturally defined x86 exception vectors.
pub mod vector {
    pub const DE: u8 = 0;
    pub const DB: u8 = 1;
    pub const NMI: u8 = 2;
    pub const BP: u8 = 3;
    pub const OF: u8 = 4;
    pub const BR: u8 = 5;
    pub const UD: u8 = 6;
    pub const NM: u8 = 7;
    pub const DF: u8 = 8;
    pub const TS: u8 = 10;
    pub const NP: u8 = 11;
    pub const SS: u8 = 12;
    pub const GP: u8 = 13;
    pub const PF: u8 = 14;
    pub const MF: u8 = 16;
    pub const AC: u8 = 17;
    pub const MC: u8 = 18;
    pub const XF: u8 = 19;
}

bitflags! {
    /// Delivery flags describing how an event originated and what it
    /// carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        /// CPU exception (as opposed to an interrupt).
        const CPU_XCPT = 1 << 0;
        /// Software interrupt (`INT n`).
        const SOFT_INT = 1 << 1;
        /// External hardware interrupt.
        const EXT_INT = 1 << 2;
        /// The event pushes/carries an error code.
        const HAS_ERR = 1 << 4;
        /// The event carries a faulting address (CR2).
        const HAS_CR2 = 1 << 5;
        /// Originates from `INT3`.
        const BP_INSTR = 1 << 6;
        /// Originates from `INTO`.
        const OF_INSTR = 1 << 7;
        /// Originates from `INT1`/ICEBP (privileged despite being software).
        const ICEBP_INSTR = 1 << 8;
    }
}

/// Whether the CPU pushes an error code for this exception vector.
#[inline]
pub const fn pushes_error_code(vec: u8) -> bool {
    matches!(
        vec,
        vector::DF
            | vector::TS
            | vector::NP
            | vector::SS
            | vector::GP
            | vector::PF
            | vector::AC
    )
}

/// Recursive-delivery class of an exception vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl ExceptionClass {
    pub fn of(vec: u8) -> Self {
        match vec {
            vector::PF => Self::PageFault,
            vector::DF => Self::DoubleFault,
            vector::DE | vector::TS | vector::NP | vector::SS | vector::GP => Self::Contributory,
            _ => Self::Benign,
        }
    }
}

/// One exception/interrupt awaiting delivery. Transient: exists for the
/// duration of a single delivery call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub vector: u8,
    pub flags: EventFlags,
    pub error_code: u32,
    pub cr2: u64,
}

impl Event {
    pub const fn exception(vector: u8) -> Self {
        Self {
            vector,
            flags: EventFlags::CPU_XCPT,
            error_code: 0,
            cr2: 0,
        }
    }

    /// An exception carrying an explicit error code.
    pub const fn with_error_code(vector: u8, error_code: u32) -> Self {
        Self {
            vector,
            flags: EventFlags::CPU_XCPT.union(EventFlags::HAS_ERR),
            error_code,
            cr2: 0,
        }
    }

    pub const fn gp(error_code: u32) -> Self {
        Self::with_error_code(vector::GP, error_code)
    }

    pub const fn gp0() -> Self {
        Self::gp(0)
    }

    pub const fn ss(error_code: u32) -> Self {
        Self::with_error_code(vector::SS, error_code)
    }

    pub const fn np(error_code: u32) -> Self {
        Self::with_error_code(vector::NP, error_code)
    }

    pub const fn ts(error_code: u32) -> Self {
        Self::with_error_code(vector::TS, error_code)
    }

    pub const fn ac0() -> Self {
        Self::with_error_code(vector::AC, 0)
    }

    pub const fn ud() -> Self {
        Self::exception(vector::UD)
    }

    pub const fn pf(cr2: u64, error_code: u32) -> Self {
        Self {
            vector: vector::PF,
            flags: EventFlags::CPU_XCPT
                .union(EventFlags::HAS_ERR)
                .union(EventFlags::HAS_CR2),
            error_code,
            cr2,
        }
    }

    /// The double fault escalation target; the error code is always zero.
    pub const fn df() -> Self {
        Self::with_error_code(vector::DF, 0)
    }

    pub const fn software_interrupt(vector: u8) -> Self {
        Self {
            vector,
            flags: EventFlags::SOFT_INT,
            error_code: 0,
            cr2: 0,
        }
    }

    pub const fn external_interrupt(vector: u8) -> Self {
        Self {
            vector,
            flags: EventFlags::EXT_INT,
            error_code: 0,
            cr2: 0,
        }
    }
}

/// Host/platform failures. Never guest-visible; the interpreter step that
/// hits one of these aborts instead of emulating.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error(transparent)]
    Phys(#[from] PhysAccessError),
    /// More concurrent guest mappings than the per-instruction table holds;
    /// indicates a broken caller, not a guest condition.
    #[error("active mapping table exhausted")]
    MappingSlotsExhausted,
    /// A single mapped access larger than a bounce buffer.
    #[error("access of {0} bytes exceeds the bounce buffer")]
    BounceOverflow(usize),
}

/// Failure of a translation/mapping/data operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemFault {
    /// Architectural fault to feed into the dispatcher.
    Event(Event),
    /// Second-level (nested) translation failure, owned by the
    /// nested-virtualization layer.
    Nested(SecondLevelFault),
    /// Host failure.
    Platform(PlatformError),
}

impl From<Event> for MemFault {
    fn from(event: Event) -> Self {
        MemFault::Event(event)
    }
}

impl From<PlatformError> for MemFault {
    fn from(err: PlatformError) -> Self {
        MemFault::Platform(err)
    }
}

impl From<PhysAccessError> for MemFault {
    fn from(err: PhysAccessError) -> Self {
        MemFault::Platform(PlatformError::Phys(err))
    }
}

/// Terminal conditions the interpreter core reports to its caller instead of
/// continuing emulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcpuExit {
    /// Failure to deliver an exception (including #DF); equates to CPU
    /// shutdown and must be turned into a guest reset/stop by the VM layer.
    TripleFault,
    /// Deterministic guest hang (#AC delivered while delivering #AC).
    CpuHang,
    /// Nested second-level translation fault to hand to the
    /// nested-virtualization layer.
    NestedPageFault(SecondLevelFault),
    /// Non-architectural host failure.
    MemoryFault(PlatformError),
    /// A condition this core deliberately does not emulate.
    NotImplemented(&'static str),
}
