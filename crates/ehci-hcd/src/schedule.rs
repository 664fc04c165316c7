//! Periodic schedule bookkeeping.
//!
//! The controller walks the periodic frame list in DMA memory by physical
//! link pointers; the driver mirrors that list with logical elements so it
//! can unlink and retire descriptors without re-deriving structure from raw
//! memory. Every element therefore carries two chains: the slot chain
//! (`logical_next`, mirroring the hardware's link word) and the done-queue
//! chain (`done_link`), which must stay separate so that pushing an element
//! onto the done queue never disturbs an in-progress slot traversal.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use crate::memory::MemoryBus;
use crate::regs::FRINDEX_UFRAME_MASK;

/// Microframes per frame; also the number of transaction slots in a
/// high-speed isochronous descriptor.
pub const UFRAMES_PER_FRAME: usize = 8;

// In-memory descriptor layout (EHCI 1.0 §3.3/§3.4). Both iTD and siTD start
// with their next-link pointer; only the status words differ.
pub const TD_NEXT_LINK_OFFSET: u64 = 0x00;
pub const ITD_TRANSACTION0_OFFSET: u64 = 0x04;
pub const ITD_STATUS_ACTIVE: u32 = 1 << 31;
pub const SITD_STATE_OFFSET: u64 = 0x0c;
pub const SITD_STATUS_ACTIVE: u32 = 1 << 7;

// Link pointer encoding shared by frame-list entries and descriptor links.
pub const LINK_PTR_TERMINATE: u32 = 1 << 0;
pub const LINK_PTR_TYPE_ITD: u32 = 0 << 1;
pub const LINK_PTR_TYPE_QH: u32 = 1 << 1;
pub const LINK_PTR_TYPE_SITD: u32 = 2 << 1;
pub const LINK_PTR_ADDR_MASK: u32 = 0xffff_ffe0;

/// A hardware link word from a frame-list entry or descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkPointer(pub u32);

impl LinkPointer {
    pub fn terminated(self) -> bool {
        self.0 & LINK_PTR_TERMINATE != 0
    }

    pub fn addr(self) -> u32 {
        self.0 & LINK_PTR_ADDR_MASK
    }
}

/// What kind of element occupies a periodic slot chain.
///
/// Interrupt queue heads share the periodic list with isochronous descriptors
/// but are serviced elsewhere; they mark the end of the isochronous region of
/// a slot chain and the retirement walk never descends past one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TdKind {
    /// High-speed isochronous descriptor (iTD): eight per-microframe
    /// transaction words, each with its own active bit.
    HighSpeedIsoch,
    /// Split-transaction isochronous descriptor (siTD) for full/low-speed
    /// devices behind a high-speed hub: a single status word.
    SplitIsoch,
    /// Interrupt queue head; opaque to the retirement walk.
    InterruptQh,
}

impl TdKind {
    pub fn is_isoch(self) -> bool {
        !matches!(self, TdKind::InterruptQh)
    }
}

/// Status captured from a descriptor at retirement, for low-latency
/// consumers that need per-microframe results stamped with the retirement
/// time rather than waiting for the gated scavenge pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameRecord {
    pub status: u32,
    pub timestamp: u64,
}

/// The endpoint owning a set of scheduled descriptors.
///
/// Shared between the submission path (gated context) and the filter, so the
/// counters are atomic: the filter bumps `on_producer_q` and drops
/// `scheduled_tds` as it retires, while the endpoint-level machinery reads
/// them to decide when an endpoint has drained.
#[derive(Debug, Default)]
pub struct IsochEndpoint {
    on_producer_q: AtomicU32,
    scheduled_tds: AtomicI32,
    uses_back_ptr: AtomicBool,
}

impl IsochEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks this endpoint as using the siTD back pointer, i.e. its split
    /// transactions wrap past the end of their frame-list slot.
    pub fn set_uses_back_ptr(&self, uses: bool) {
        self.uses_back_ptr.store(uses, Ordering::Relaxed);
    }

    pub fn uses_back_ptr(&self) -> bool {
        self.uses_back_ptr.load(Ordering::Relaxed)
    }

    /// Accounts for a descriptor being linked into the schedule.
    pub fn note_scheduled(&self) {
        self.scheduled_tds.fetch_add(1, Ordering::AcqRel);
    }

    /// Accounts for a descriptor moving from the schedule to the done queue.
    pub(crate) fn note_produced(&self) {
        self.on_producer_q.fetch_add(1, Ordering::Relaxed);
        self.scheduled_tds.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn on_producer_q(&self) -> u32 {
        self.on_producer_q.load(Ordering::Relaxed)
    }

    pub fn scheduled_tds(&self) -> i32 {
        self.scheduled_tds.load(Ordering::Acquire)
    }
}

/// One periodic schedule element: the logical mirror of an iTD/siTD (or an
/// interrupt QH boundary marker) linked into a frame-list slot.
#[derive(Debug)]
pub struct PeriodicTd {
    kind: TdKind,
    paddr: u32,
    low_latency: bool,
    endpoint: Option<Arc<IsochEndpoint>>,
    frame_records: [FrameRecord; UFRAMES_PER_FRAME],
    pub(crate) logical_next: Option<Box<PeriodicTd>>,
    pub(crate) done_link: Option<Box<PeriodicTd>>,
}

impl PeriodicTd {
    pub fn new(kind: TdKind, paddr: u32) -> Box<Self> {
        debug_assert_eq!(paddr & !LINK_PTR_ADDR_MASK, 0, "descriptor misaligned");
        Box::new(Self {
            kind,
            paddr,
            low_latency: false,
            endpoint: None,
            frame_records: Default::default(),
            logical_next: None,
            done_link: None,
        })
    }

    pub fn set_endpoint(&mut self, endpoint: Arc<IsochEndpoint>) {
        self.endpoint = Some(endpoint);
    }

    pub fn set_low_latency(&mut self, low_latency: bool) {
        self.low_latency = low_latency;
    }

    pub fn kind(&self) -> TdKind {
        self.kind
    }

    pub fn paddr(&self) -> u32 {
        self.paddr
    }

    pub fn low_latency(&self) -> bool {
        self.low_latency
    }

    pub fn endpoint(&self) -> Option<&Arc<IsochEndpoint>> {
        self.endpoint.as_ref()
    }

    pub fn next(&self) -> Option<&PeriodicTd> {
        self.logical_next.as_deref()
    }

    /// Per-microframe status captured at retirement (low-latency elements
    /// only; all-zero otherwise).
    pub fn frame_records(&self) -> &[FrameRecord; UFRAMES_PER_FRAME] {
        &self.frame_records
    }

    /// Snapshots descriptor status into `frame_records`, stamped with the
    /// single timestamp captured for the whole retirement pass.
    pub(crate) fn update_frame_list(&mut self, mem: &mut dyn MemoryBus, timestamp: u64) {
        match self.kind {
            TdKind::HighSpeedIsoch => {
                for uframe in 0..UFRAMES_PER_FRAME {
                    let status = mem.read_u32(
                        u64::from(self.paddr) + ITD_TRANSACTION0_OFFSET + 4 * uframe as u64,
                    );
                    self.frame_records[uframe] = FrameRecord { status, timestamp };
                }
            }
            TdKind::SplitIsoch => {
                let status = mem.read_u32(u64::from(self.paddr) + SITD_STATE_OFFSET);
                self.frame_records[0] = FrameRecord { status, timestamp };
            }
            TdKind::InterruptQh => debug_assert!(false, "interrupt QH on the done queue"),
        }
    }
}

/// The driver-side view of the periodic frame list.
pub struct PeriodicSchedule {
    entries: usize,
    list_base: u32,
    slots: Vec<Option<Box<PeriodicTd>>>,
    out_slot: Option<u16>,
}

impl PeriodicSchedule {
    /// `entries` must match the frame list size programmed in USBCMD
    /// (256/512/1024); `list_base` is the physical address programmed into
    /// PERIODICLISTBASE.
    pub fn new(entries: usize, list_base: u32) -> Self {
        assert!(
            matches!(entries, 256 | 512 | 1024),
            "EHCI frame lists have 256, 512 or 1024 entries"
        );
        let mut slots = Vec::with_capacity(entries);
        slots.resize_with(entries, || None);
        Self {
            entries,
            list_base,
            slots,
            // Out of range until the periodic schedule is brought up; the
            // filter skips the walk entirely while this is unset.
            out_slot: None,
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn list_base(&self) -> u32 {
        self.list_base
    }

    pub fn out_slot(&self) -> Option<u16> {
        self.out_slot
    }

    /// Sets the scavenge cursor. The schedule-enable path points it at the
    /// current slot when the periodic schedule starts; `None` parks it.
    pub fn set_out_slot(&mut self, slot: Option<u16>) {
        debug_assert!(slot.map_or(true, |s| (s as usize) < self.entries));
        self.out_slot = slot;
    }

    pub(crate) fn advance_out_slot(&mut self, slot: u16) {
        self.out_slot = Some(slot);
    }

    pub fn next_slot(&self, slot: usize) -> usize {
        (slot + 1) & (self.entries - 1)
    }

    /// Frame-list slot addressed by a FRINDEX value.
    pub fn slot_for_frindex(&self, frindex: u32) -> usize {
        ((frindex >> 3) as usize) & (self.entries - 1)
    }

    /// Physical address of a slot's frame-list entry.
    pub fn entry_paddr(&self, slot: usize) -> u64 {
        u64::from(self.list_base) + 4 * slot as u64
    }

    /// Logical head of a slot's element chain.
    pub fn list_entry(&self, slot: usize) -> Option<&PeriodicTd> {
        self.slots[slot].as_deref()
    }

    /// Replaces a slot's logical chain, returning the previous one. The
    /// caller owns keeping the physical frame-list entry consistent.
    pub fn set_list_entry(
        &mut self,
        slot: usize,
        chain: Option<Box<PeriodicTd>>,
    ) -> Option<Box<PeriodicTd>> {
        std::mem::replace(&mut self.slots[slot], chain)
    }

    pub(crate) fn take_slot(&mut self, slot: usize) -> Option<Box<PeriodicTd>> {
        self.slots[slot].take()
    }

    pub(crate) fn put_slot(&mut self, slot: usize, chain: Option<Box<PeriodicTd>>) {
        self.slots[slot] = chain;
    }
}

/// Microframe within the current frame for a FRINDEX value.
pub fn cur_microframe(frindex: u32) -> u32 {
    frindex & FRINDEX_UFRAME_MASK
}
