use merlin_cpu_core::state::{CpuMode, CR0_AM, RFLAGS_AC};
use merlin_cpu_core::state::Seg;
use merlin_cpu_core::{
    Access, AlignPolicy, Cpu, Event, MemFault, MemoryBus, PageInfo, PlatformError,
};
use merlin_mmu::PhysAccessError;

#[derive(Debug)]
struct TestBus {
    mem: Vec<u8>,
    mmio_pages: Vec<u64>,
    unassigned_pages: Vec<u64>,
    /// Log of committed physical writes: (paddr, len).
    phys_writes: Vec<(u64, usize)>,
}

impl TestBus {
    fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            mmio_pages: Vec::new(),
            unassigned_pages: Vec::new(),
            phys_writes: Vec::new(),
        }
    }

    fn is_ram(&self, page: u64) -> bool {
        !self.mmio_pages.contains(&page) && !self.unassigned_pages.contains(&page)
    }
}

impl MemoryBus for TestBus {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.mem.get(paddr as usize).copied().unwrap_or(0)
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(paddr), self.read_u8(paddr + 1)])
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        let mut b = [0u8; 4];
        for (i, slot) in b.iter_mut().enumerate() {
            *slot = self.read_u8(paddr + i as u64);
        }
        u32::from_le_bytes(b)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        let mut b = [0u8; 8];
        for (i, slot) in b.iter_mut().enumerate() {
            *slot = self.read_u8(paddr + i as u64);
        }
        u64::from_le_bytes(b)
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        if let Some(slot) = self.mem.get_mut(paddr as usize) {
            *slot = value;
        }
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(paddr + i as u64, byte);
        }
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(paddr + i as u64, byte);
        }
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(paddr + i as u64, byte);
        }
    }

    fn try_write_bytes(&mut self, paddr: u64, src: &[u8]) -> Result<(), PhysAccessError> {
        self.phys_writes.push((paddr, src.len()));
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(paddr + i as u64, byte);
        }
        Ok(())
    }

    fn page_info(&mut self, page_phys: u64) -> PageInfo {
        if self.unassigned_pages.contains(&page_phys) {
            PageInfo::unassigned()
        } else if self.mmio_pages.contains(&page_phys) {
            PageInfo::mmio()
        } else {
            PageInfo::ram()
        }
    }

    fn direct_mut(&mut self, paddr: u64, len: usize) -> Option<&mut [u8]> {
        if !self.is_ram(paddr & !0xfff) {
            return None;
        }
        self.mem.get_mut(paddr as usize..paddr as usize + len)
    }
}

fn real_mode_cpu() -> Cpu {
    Cpu::new(CpuMode::Real)
}

#[test]
fn page_crossing_write_commits_two_ascending_physical_writes() {
    let mut bus = TestBus::new(0x3000);
    let mut cpu = real_mode_cpu();

    let mapping = cpu
        .map_linear(&mut bus, 0xffe, 4, Access::DATA_W, 1, AlignPolicy::Ac)
        .unwrap();
    cpu.mapping_slice(&mut bus, mapping)
        .unwrap()
        .copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
    cpu.commit(&mut bus, mapping).unwrap();

    assert_eq!(bus.phys_writes, vec![(0xffe, 2), (0x1000, 2)]);
    assert_eq!(&bus.mem[0xffe..0x1002], &[0xaa, 0xbb, 0xcc, 0xdd]);
    assert_eq!(cpu.active_mappings(), 0);
}

#[test]
fn rollback_discards_staged_bytes_entirely() {
    let mut bus = TestBus::new(0x3000);
    let mut cpu = real_mode_cpu();

    let mapping = cpu
        .map_linear(&mut bus, 0xffe, 4, Access::DATA_W, 1, AlignPolicy::Ac)
        .unwrap();
    cpu.mapping_slice(&mut bus, mapping)
        .unwrap()
        .copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
    cpu.rollback_all();

    assert!(bus.phys_writes.is_empty());
    assert_eq!(&bus.mem[0xffe..0x1002], &[0, 0, 0, 0]);
    assert_eq!(cpu.active_mappings(), 0);
}

#[test]
fn single_page_ram_access_uses_a_direct_view() {
    let mut bus = TestBus::new(0x3000);
    bus.mem[0x100..0x104].copy_from_slice(&[1, 2, 3, 4]);
    let mut cpu = real_mode_cpu();

    let mapping = cpu
        .map_linear(&mut bus, 0x100, 4, Access::DATA_RW, 1, AlignPolicy::Ac)
        .unwrap();
    {
        let view = cpu.mapping_slice(&mut bus, mapping).unwrap();
        assert_eq!(view, &[1, 2, 3, 4]);
        view[0] = 0x99;
    }
    cpu.commit(&mut bus, mapping).unwrap();

    // The write went straight to memory; nothing was staged or re-written.
    assert!(bus.phys_writes.is_empty());
    assert_eq!(bus.mem[0x100], 0x99);
}

#[test]
fn handler_guarded_page_is_bounce_buffered() {
    let mut bus = TestBus::new(0x3000);
    bus.mem[0x1004] = 0x42;
    bus.mmio_pages.push(0x1000);
    let mut cpu = real_mode_cpu();

    let mapping = cpu
        .map_linear(&mut bus, 0x1004, 4, Access::DATA_RW, 1, AlignPolicy::Ac)
        .unwrap();
    {
        let view = cpu.mapping_slice(&mut bus, mapping).unwrap();
        assert_eq!(view[0], 0x42);
        view.copy_from_slice(&[5, 6, 7, 8]);
    }
    cpu.commit(&mut bus, mapping).unwrap();

    // The staged bytes went back through the (handler-routed) physical
    // write path.
    assert_eq!(bus.phys_writes, vec![(0x1004, 4)]);
    assert_eq!(&bus.mem[0x1004..0x1008], &[5, 6, 7, 8]);
}

#[test]
fn unassigned_reads_see_the_fill_pattern_and_writes_vanish() {
    let mut bus = TestBus::new(0x3000);
    bus.unassigned_pages.push(0x2000);
    let mut cpu = real_mode_cpu();

    let mapping = cpu
        .map_linear(&mut bus, 0x2010, 8, Access::DATA_R, 1, AlignPolicy::Ac)
        .unwrap();
    assert_eq!(cpu.mapping_slice(&mut bus, mapping).unwrap(), &[0xff; 8]);
    cpu.commit(&mut bus, mapping).unwrap();

    let mapping = cpu
        .map_linear(&mut bus, 0x2010, 8, Access::DATA_W, 1, AlignPolicy::Ac)
        .unwrap();
    cpu.mapping_slice(&mut bus, mapping)
        .unwrap()
        .copy_from_slice(&[1; 8]);
    cpu.commit(&mut bus, mapping).unwrap();

    assert!(bus.phys_writes.is_empty());
}

#[test]
fn mapping_table_capacity_is_a_hard_internal_limit() {
    let mut bus = TestBus::new(0x3000);
    bus.mmio_pages.push(0x0); // force staging so slots stay busy
    let mut cpu = real_mode_cpu();

    let m1 = cpu
        .map_linear(&mut bus, 0x10, 4, Access::DATA_R, 1, AlignPolicy::Ac)
        .unwrap();
    let _m2 = cpu
        .map_linear(&mut bus, 0x20, 4, Access::DATA_R, 1, AlignPolicy::Ac)
        .unwrap();
    let _m3 = cpu
        .map_linear(&mut bus, 0x30, 4, Access::DATA_R, 1, AlignPolicy::Ac)
        .unwrap();
    let err = cpu
        .map_linear(&mut bus, 0x40, 4, Access::DATA_R, 1, AlignPolicy::Ac)
        .unwrap_err();
    assert_eq!(
        err,
        MemFault::Platform(PlatformError::MappingSlotsExhausted)
    );

    // Releasing one slot makes room again.
    cpu.commit(&mut bus, m1).unwrap();
    assert!(cpu
        .map_linear(&mut bus, 0x40, 4, Access::DATA_R, 1, AlignPolicy::Ac)
        .is_ok());
    cpu.rollback_all();
}

#[test]
fn alignment_policy_selects_ac_or_gp() {
    let mut bus = TestBus::new(0x3000);
    let mut cpu = real_mode_cpu();

    // #AC only fires with CR0.AM, RFLAGS.AC and CPL 3.
    assert!(cpu
        .map_linear(&mut bus, 0x101, 2, Access::DATA_R, 2, AlignPolicy::Ac)
        .is_ok());
    cpu.rollback_all();

    let cr0 = cpu.mmu.cr0();
    cpu.mmu.set_cr0(cr0 | CR0_AM);
    cpu.state.set_flag(RFLAGS_AC, true);
    cpu.state.set_cpl(3);
    let err = cpu
        .map_linear(&mut bus, 0x101, 2, Access::DATA_R, 2, AlignPolicy::Ac)
        .unwrap_err();
    assert_eq!(err, MemFault::Event(Event::ac0()));

    // The strict policy raises #GP(0) regardless of the #AC arming.
    let err = cpu
        .map_linear(&mut bus, 0x104, 16, Access::DATA_R, 16, AlignPolicy::Gp)
        .unwrap_err();
    assert_eq!(err, MemFault::Event(Event::gp0()));
}

#[test]
fn stack_pushes_account_committed_bytes() {
    let mut bus = TestBus::new(0x3000);
    let mut cpu = real_mode_cpu();
    cpu.state.set_stack_ptr(0x1000);

    cpu.push(&mut bus, 0x1234u16).unwrap();
    cpu.push(&mut bus, 0x5678_9abcu32).unwrap();

    assert_eq!(cpu.state.stack_ptr(), 0x1000 - 6);
    assert_eq!(cpu.stack_bytes_written(), 6);
    assert_eq!(&bus.mem[0xffa..0xffe], &0x5678_9abcu32.to_le_bytes());
    assert_eq!(&bus.mem[0xffe..0x1000], &0x1234u16.to_le_bytes());
}

#[test]
fn typed_data_access_goes_through_the_segment_base() {
    let mut bus = TestBus::new(0x3000);
    let mut cpu = real_mode_cpu();
    cpu.state.segments.ds = merlin_cpu_core::state::SegmentRegister::real_mode(0x100);

    cpu.write_data(&mut bus, Seg::Ds, 4, 0xdead_beefu32).unwrap();
    assert_eq!(&bus.mem[0x1004..0x1008], &0xdead_beefu32.to_le_bytes());
    assert_eq!(
        cpu.read_data::<u32, _>(&mut bus, Seg::Ds, 4).unwrap(),
        0xdead_beef
    );
    assert_eq!(cpu.active_mappings(), 0);
}

#[test]
fn code_fetch_reads_across_page_boundaries() {
    let mut bus = TestBus::new(0x3000);
    for (i, byte) in (0..8u8).enumerate() {
        bus.mem[0xffc + i] = byte;
    }
    let mut cpu = real_mode_cpu();
    cpu.state.segments.cs = merlin_cpu_core::state::SegmentRegister {
        selector: 0,
        base: 0,
        limit: 0xffff_ffff,
        attr: cpu.state.segments.cs.attr,
    };
    cpu.state.set_rip(0xffc);

    let bytes = cpu.fetch_code_bytes(&mut bus, 8).unwrap();
    assert_eq!(&bytes[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
}
