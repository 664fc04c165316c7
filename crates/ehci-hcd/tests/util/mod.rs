#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ehci_hcd::done_queue::DoneBatch;
use ehci_hcd::hooks::{InterruptSignal, IsochScavenger, RootHubOps, TimeSource};
use ehci_hcd::regs::{
    RegisterBus, INVALID_REGISTER_VALUE, REG_FRINDEX, REG_USBCMD, REG_USBINTR, REG_USBSTS,
    USBINTR_MASK, USBSTS_INT_MASK,
};
use ehci_hcd::schedule::{
    FrameRecord, PeriodicTd, TdKind, ITD_STATUS_ACTIVE, ITD_TRANSACTION0_OFFSET,
    LINK_PTR_TERMINATE, LINK_PTR_TYPE_ITD, TD_NEXT_LINK_OFFSET, UFRAMES_PER_FRAME,
};
use ehci_hcd::{ControllerConfig, EhciController, FilterContext, MemoryBus};

pub const LIST_BASE: u32 = 0x1000;

/// USBCMD with run + periodic schedule enable, the steady running state.
pub const USBCMD_RUNNING: u32 = ehci_hcd::regs::USBCMD_RS | ehci_hcd::regs::USBCMD_PSE;

// ---------------------------------------------------------------------------
// DMA memory

pub struct TestMemory {
    pub data: Vec<u8>,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn read_u32_at(&self, addr: u64) -> u32 {
        let addr = addr as usize;
        u32::from_le_bytes(self.data[addr..addr + 4].try_into().unwrap())
    }

    pub fn write_u32_at(&mut self, addr: u64, value: u32) {
        let addr = addr as usize;
        self.data[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl MemoryBus for TestMemory {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        let start = paddr as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        let start = paddr as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
    }
}

/// Memory that fails the test on any DMA access.
pub struct PanicMem;

impl MemoryBus for PanicMem {
    fn read_physical(&mut self, paddr: u64, _buf: &mut [u8]) {
        panic!("unexpected DMA read at {paddr:#x}");
    }

    fn write_physical(&mut self, paddr: u64, _buf: &[u8]) {
        panic!("unexpected DMA write at {paddr:#x}");
    }
}

// ---------------------------------------------------------------------------
// Register file

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegEvent {
    Read(u64),
    Write(u64, u32),
    Sync,
}

/// Operational register block with hardware-ish semantics: USBSTS is
/// write-1-to-clear, and any register (or the whole block) can be switched to
/// returning the removal sentinel.
#[derive(Default)]
pub struct TestRegisterFile {
    regs: Mutex<[u32; 4]>,
    dead: AtomicBool,
    dead_offsets: Mutex<Vec<u64>>,
    events: Mutex<Vec<RegEvent>>,
}

impl TestRegisterFile {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn index(offset: u64) -> usize {
        assert!(offset <= REG_FRINDEX && offset % 4 == 0, "bad register offset {offset:#x}");
        (offset / 4) as usize
    }

    pub fn set(&self, offset: u64, value: u32) {
        self.regs.lock().unwrap()[Self::index(offset)] = value;
    }

    pub fn get(&self, offset: u64) -> u32 {
        self.regs.lock().unwrap()[Self::index(offset)]
    }

    /// Raise status bits, as the hardware would when latching an interrupt.
    pub fn raise_status(&self, bits: u32) {
        self.regs.lock().unwrap()[Self::index(REG_USBSTS)] |= bits;
    }

    /// All subsequent reads of every register return the sentinel.
    pub fn unplug(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    /// All subsequent reads of one register return the sentinel.
    pub fn unplug_register(&self, offset: u64) {
        self.dead_offsets.lock().unwrap().push(offset);
    }

    pub fn events(&self) -> Vec<RegEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn read_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|ev| matches!(ev, RegEvent::Read(_)))
            .count()
    }

    pub fn write_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|ev| matches!(ev, RegEvent::Write(..)))
            .count()
    }
}

/// Shared handle to a [`TestRegisterFile`] used as the controller's bus. A
/// newtype is required because the orphan rule forbids implementing the
/// foreign `RegisterBus` trait directly for `Arc<TestRegisterFile>`.
#[derive(Clone)]
pub struct SharedRegs(pub Arc<TestRegisterFile>);

impl RegisterBus for SharedRegs {
    fn read_register(&self, offset: u64) -> u32 {
        self.0.events.lock().unwrap().push(RegEvent::Read(offset));
        if self.0.dead.load(Ordering::SeqCst)
            || self.0.dead_offsets.lock().unwrap().contains(&offset)
        {
            return INVALID_REGISTER_VALUE;
        }
        self.0.regs.lock().unwrap()[TestRegisterFile::index(offset)].to_le()
    }

    fn write_register(&self, offset: u64, value: u32) {
        let value = u32::from_le(value);
        self.0
            .events
            .lock()
            .unwrap()
            .push(RegEvent::Write(offset, value));
        let mut regs = self.0.regs.lock().unwrap();
        let idx = TestRegisterFile::index(offset);
        if offset == REG_USBSTS {
            regs[idx] &= !(value & USBSTS_INT_MASK);
        } else {
            regs[idx] = value;
        }
    }

    fn sync(&self) {
        self.0.events.lock().unwrap().push(RegEvent::Sync);
    }
}

// ---------------------------------------------------------------------------
// Hooks

#[derive(Default)]
pub struct TestSignal {
    count: AtomicU32,
}

impl TestSignal {
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

impl InterruptSignal for TestSignal {
    fn signal(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl TimeSource for TestClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub struct RetiredTdInfo {
    pub paddr: u32,
    pub records: [FrameRecord; UFRAMES_PER_FRAME],
}

/// Scavenger that records every drained batch.
#[derive(Default)]
pub struct CollectingScavenger {
    pub batches: Vec<Vec<RetiredTdInfo>>,
}

impl CollectingScavenger {
    pub fn total_retired(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn last_paddrs(&self) -> Vec<u32> {
        self.batches
            .last()
            .map(|batch| batch.iter().map(|td| td.paddr).collect())
            .unwrap_or_default()
    }
}

impl IsochScavenger for CollectingScavenger {
    fn completed_transactions(&mut self, batch: DoneBatch) {
        self.batches.push(
            batch
                .map(|td| RetiredTdInfo {
                    paddr: td.paddr(),
                    records: *td.frame_records(),
                })
                .collect(),
        );
    }
}

#[derive(Default)]
pub struct TestRootHub {
    pub usability_checks: u32,
    pub resume_checks: u32,
}

impl RootHubOps for TestRootHub {
    fn ensure_usability(&mut self) {
        self.usability_checks += 1;
    }

    fn check_for_port_resumes(&mut self) {
        self.resume_checks += 1;
    }
}

// ---------------------------------------------------------------------------
// Harness

pub struct Harness {
    pub regs: Arc<TestRegisterFile>,
    pub ctrl: EhciController<SharedRegs>,
    pub mem: TestMemory,
    pub signal: TestSignal,
    pub clock: TestClock,
}

impl Harness {
    /// Controller in the steady running state: all six interrupt causes
    /// enabled, periodic schedule on, frame list at [`LIST_BASE`].
    pub fn new() -> Self {
        let regs = TestRegisterFile::new();
        regs.set(REG_USBCMD, USBCMD_RUNNING);
        regs.set(REG_USBINTR, USBINTR_MASK);
        let ctrl = EhciController::new(SharedRegs(regs.clone()), ControllerConfig::new(LIST_BASE));
        Self {
            regs,
            ctrl,
            mem: TestMemory::new(0x1_0000),
            signal: TestSignal::default(),
            clock: TestClock::default(),
        }
    }

    pub fn filter(&mut self) -> bool {
        let mut ctx = FilterContext {
            mem: &mut self.mem,
            signal: &self.signal,
            clock: &self.clock,
        };
        self.ctrl.filter_interrupt(&mut ctx)
    }

    pub fn poll(&mut self, scavenger: &mut dyn IsochScavenger, root_hub: &mut dyn RootHubOps) {
        let mut ctx = ehci_hcd::PollContext {
            scavenger,
            root_hub,
        };
        self.ctrl.poll_interrupts(&mut ctx);
    }

    /// Seeds a high-speed iTD into `slot`, with per-microframe active bits
    /// from `active_mask`, linked from the physical frame-list entry.
    pub fn seed_itd(&mut self, slot: usize, paddr: u32, active_mask: u8) -> &mut Self {
        self.mem
            .write_u32_at(u64::from(paddr) + TD_NEXT_LINK_OFFSET, LINK_PTR_TERMINATE);
        for uframe in 0..UFRAMES_PER_FRAME {
            let word = if active_mask & (1 << uframe) != 0 {
                ITD_STATUS_ACTIVE
            } else {
                0
            };
            self.mem.write_u32_at(
                u64::from(paddr) + ITD_TRANSACTION0_OFFSET + 4 * uframe as u64,
                word,
            );
        }

        let mut sched = self.ctrl.schedule();
        let entry_paddr = sched.entry_paddr(slot);
        sched.set_list_entry(slot, Some(PeriodicTd::new(TdKind::HighSpeedIsoch, paddr)));
        drop(sched);
        self.mem.write_u32_at(entry_paddr, paddr | LINK_PTR_TYPE_ITD);
        self
    }

    /// Seeds an all-inactive low-latency iTD into `slot`.
    pub fn seed_low_latency_itd(&mut self, slot: usize, paddr: u32) -> &mut Self {
        self.seed_itd(slot, paddr, 0);
        let mut sched = self.ctrl.schedule();
        let mut td = sched.set_list_entry(slot, None).unwrap();
        td.set_low_latency(true);
        sched.set_list_entry(slot, Some(td));
        drop(sched);
        self
    }

    pub fn set_out_slot(&mut self, slot: u16) -> &mut Self {
        self.ctrl.schedule().set_out_slot(Some(slot));
        self
    }

    /// Points FRINDEX at `frame`/`microframe`.
    pub fn set_frindex(&mut self, frame: u32, microframe: u32) -> &mut Self {
        self.regs
            .set(REG_FRINDEX, (frame << 3) | (microframe & 7));
        self
    }
}
