//! Periodic-list retirement walk.
//!
//! Runs inside the primary interrupt filter on a completion interrupt. Walks
//! frame-list slots from the scavenge cursor (`out_slot`) up to, but not
//! including, the slot after the one the controller is currently executing,
//! unlinking every isochronous descriptor that is provably complete and
//! pushing it onto the caller's retired chain. Work is bounded by the frame
//! list size, never by queue depth.
//!
//! The walk maintains the invariant that the hardware's view is updated
//! first: a descriptor's predecessor (or its frame-list entry) is re-pointed
//! at the descriptor's successor via the physical link word before the
//! element is handed to the done queue, because the controller traverses
//! physical links, not the driver's logical mirror.

use crate::done_queue::RetiredChain;
use crate::memory::MemoryBus;
use crate::schedule::{
    cur_microframe, PeriodicSchedule, PeriodicTd, TdKind, ITD_STATUS_ACTIVE,
    ITD_TRANSACTION0_OFFSET, SITD_STATE_OFFSET, SITD_STATUS_ACTIVE, TD_NEXT_LINK_OFFSET,
    UFRAMES_PER_FRAME,
};

/// Walks the periodic schedule and retires completed descriptors.
///
/// `frindex` is the FRINDEX value read after the completion interrupt was
/// observed; `timestamp` stamps every low-latency frame-list update made by
/// this pass. The returned chain is newest-first and has not yet been
/// published; the caller commits it to the done queue.
pub(crate) fn scavenge_periodic(
    sched: &mut PeriodicSchedule,
    mem: &mut dyn MemoryBus,
    frindex: u32,
    timestamp: u64,
) -> RetiredChain {
    let mut retired = RetiredChain::new();

    let Some(out_slot) = sched.out_slot() else {
        return retired;
    };

    let cur_slot = sched.slot_for_frindex(frindex);
    let stop_slot = sched.next_slot(cur_slot);
    let micro = cur_microframe(frindex);
    let mut test_slot = out_slot as usize;

    // Once any slot holds a deferred element the cursor stays pinned for the
    // remainder of the walk; advancing past it would orphan the element
    // until the frame list wraps back around.
    let mut cursor_pinned = false;

    while test_slot != stop_slot {
        let next_slot = sched.next_slot(test_slot);
        let mut need_rescavenge = false;

        let mut rest = sched.take_slot(test_slot);
        let mut kept: Option<Box<PeriodicTd>> = None;
        let mut kept_tail: &mut Option<Box<PeriodicTd>> = &mut kept;
        let mut prev_paddr: Option<u32> = None;

        while let Some(mut td) = rest.take() {
            if !td.kind().is_isoch() {
                // Interrupt QHs mark the end of the isochronous region of
                // this slot's chain; everything from here on stays put.
                rest = Some(td);
                break;
            }
            rest = td.logical_next.take();

            // A split descriptor that wraps past the end of its slot stays
            // linked until the controller is at least two microframes into
            // the current slot: inside that lookahead window the hardware
            // may still be writing back through the siTD back pointer.
            let wrap_hold = td.kind() == TdKind::SplitIsoch
                && td.endpoint().is_some_and(|ep| ep.uses_back_ptr())
                && next_slot == cur_slot
                && micro < 2;

            let retire = if wrap_hold {
                false
            } else if test_slot == cur_slot {
                descriptor_inactive(&td, mem)
            } else {
                // The controller has already moved past this slot, so the
                // descriptor cannot see further writes.
                true
            };

            if retire {
                let next_phys = mem.read_u32(u64::from(td.paddr()) + TD_NEXT_LINK_OFFSET);
                match prev_paddr {
                    Some(prev) => {
                        mem.write_u32(u64::from(prev) + TD_NEXT_LINK_OFFSET, next_phys)
                    }
                    None => mem.write_u32(sched.entry_paddr(test_slot), next_phys),
                }

                if td.low_latency() {
                    td.update_frame_list(mem, timestamp);
                }
                if let Some(ep) = td.endpoint() {
                    ep.note_produced();
                }
                retired.push(td);
            } else {
                need_rescavenge = true;
                prev_paddr = Some(td.paddr());
                let tail = kept_tail;
                kept_tail = &mut tail.insert(td).logical_next;
            }
        }

        *kept_tail = rest;
        sched.put_slot(test_slot, kept);

        test_slot = next_slot;
        // Only move the cursor past slots proven fully drained; a deferred
        // element keeps out_slot pinned so the next pass revisits it.
        cursor_pinned |= need_rescavenge;
        if !cursor_pinned && test_slot != cur_slot {
            sched.advance_out_slot(test_slot as u16);
        }
    }

    retired
}

/// Completion test for a descriptor in the slot the controller is currently
/// executing: any remaining active bit means the hardware may still write it.
fn descriptor_inactive(td: &PeriodicTd, mem: &mut dyn MemoryBus) -> bool {
    match td.kind() {
        TdKind::SplitIsoch => {
            mem.read_u32(u64::from(td.paddr()) + SITD_STATE_OFFSET) & SITD_STATUS_ACTIVE == 0
        }
        TdKind::HighSpeedIsoch => (0..UFRAMES_PER_FRAME).all(|uframe| {
            let word = mem
                .read_u32(u64::from(td.paddr()) + ITD_TRANSACTION0_OFFSET + 4 * uframe as u64);
            word & ITD_STATUS_ACTIVE == 0
        }),
        TdKind::InterruptQh => {
            debug_assert!(false, "boundary elements are never completion-tested");
            false
        }
    }
}
