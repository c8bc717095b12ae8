//! Interpreter-core memory access and event delivery for a software x86
//! vCPU.
//!
//! The two halves are deliberately joined at [`Cpu`]: every guest memory
//! access can raise a fault that flows into the event dispatcher, and the
//! dispatcher re-enters the memory layer to read descriptor tables and push
//! stack frames. Instruction decode/execute lives elsewhere and drives this
//! core through [`Cpu::fetch_code_bytes`], the typed data accessors, and
//! [`Cpu::raise_xcpt_or_int`].

pub mod desc;
pub mod dispatch;
pub mod event;
pub mod intercept;
pub mod memmap;
pub mod seg;
pub mod state;

pub use dispatch::DeliveryOutcome;
pub use event::{vector, Event, EventFlags, MemFault, PlatformError, VcpuExit};
pub use intercept::{InterceptDisposition, InterceptHook, NoIntercept};
pub use memmap::{Access, AlignPolicy, MemMapping, MemValue, BOUNCE_BUF_SIZE, MAX_MAPPINGS};
pub use merlin_mmu::{MemoryBus, Mmu, PageInfo};

use event::EventFlags as Flags;

/// One virtual CPU's interpreter-core state: architectural registers, the
/// paging unit with its translation caches, the per-instruction
/// active-mapping table, and the event-nesting bookkeeping.
///
/// Owned exclusively by the thread running this vCPU; the only cross-thread
/// entry point is [`Cpu::invalidate_tlb_all_physical`].
#[derive(Debug)]
pub struct Cpu {
    pub state: state::CpuState,
    pub mmu: Mmu,
    pub(crate) maps: memmap::MappingTable,
    /// Vector and flags of the event currently being delivered, if any.
    pub(crate) cur_event: Option<(u8, Flags)>,
    pub(crate) xcpt_depth: u8,
}

impl Cpu {
    pub fn new(mode: state::CpuMode) -> Self {
        Self {
            state: state::CpuState::new(mode),
            mmu: Mmu::new(),
            maps: memmap::MappingTable::new(),
            cur_event: None,
            xcpt_depth: 0,
        }
    }

    /// Drops every cached translation (e.g. after an external rewrite of the
    /// guest page tables).
    pub fn invalidate_tlb_all(&mut self) {
        self.mmu.invalidate_all();
    }

    /// Drops the cached translation for one page.
    pub fn invalidate_tlb_page(&mut self, vaddr: u64) {
        self.mmu.invalidate_page(vaddr);
    }

    /// Invalidates cached physical-page state. Part of the platform's
    /// cross-CPU broadcast when host mappings change; the caller must hold
    /// the platform physical-map lock.
    pub fn invalidate_tlb_all_physical(&self) {
        self.mmu.invalidate_all_physical();
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(state::CpuMode::Real)
    }
}
