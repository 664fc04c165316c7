//! Controller state and the two interrupt stages.
//!
//! The pipeline is split the way the host OS splits a dual-stage interrupt
//! source:
//!
//! - [`EhciController::filter_interrupt`] is the primary filter. It runs in
//!   interrupt context on whichever core took the interrupt, must not block,
//!   and does only the work that cannot wait: acknowledging status bits,
//!   frame-counter bookkeeping, and unlinking completed isochronous
//!   descriptors from the periodic schedule.
//! - [`EhciController::poll_interrupts`] is the gated action stage. It runs
//!   under the controller's serialization gate (no other controller-mutating
//!   entry point runs concurrently) and consumes the cause latches the filter
//!   set, dispatching to the long-running completion logic.
//!
//! The filter communicates with the gated stage through six sticky one-shot
//! cause latches, each written by the filter and cleared by exactly one
//! `poll_interrupts` invocation, and through the done queue's shadow
//! head/producer count hand-off.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::done_queue::DoneQueue;
use crate::hooks::{InterruptSignal, IsochScavenger, RootHubOps, TimeSource};
use crate::memory::MemoryBus;
use crate::regs::{
    HardwareError, RegisterBlock, RegisterBus, REG_FRINDEX, REG_USBCMD, REG_USBINTR, REG_USBSTS,
    USBCMD_PSE, USBSTS_FLR, USBSTS_HSE, USBSTS_IAA, USBSTS_PCD, USBSTS_USBERRINT, USBSTS_USBINT,
};
use crate::schedule::PeriodicSchedule;
use crate::schedule_periodic::scavenge_periodic;

/// Static controller parameters fixed at bring-up.
#[derive(Clone, Copy, Debug)]
pub struct ControllerConfig {
    /// Frame list size programmed in USBCMD (256, 512 or 1024 entries). The
    /// rollover arithmetic below depends on this never changing while the
    /// controller runs.
    pub frame_list_entries: usize,
    /// Physical address programmed into PERIODICLISTBASE.
    pub periodic_list_base: u32,
}

impl ControllerConfig {
    pub fn new(periodic_list_base: u32) -> Self {
        Self {
            frame_list_entries: 1024,
            periodic_list_base,
        }
    }

    /// FRINDEX midpoint. The frame-list-rollover interrupt fires on every
    /// toggle of the index's top bit; only an index observed back below this
    /// threshold is a physical wrap of the register.
    pub(crate) fn rollover_threshold(&self) -> u32 {
        (self.frame_list_entries * 8) as u32
    }

    /// Frames added to the wide counter per physical FRINDEX wrap: the full
    /// span the register covers before wrapping.
    pub(crate) fn frame_number_increment(&self) -> u64 {
        (self.frame_list_entries * 2) as u64
    }
}

/// Committed (frame, absolute-time) correspondence point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameAnchor {
    pub frame: u64,
    pub time: u64,
}

/// Controller power state as reported by the (external) power manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PowerState {
    #[default]
    On,
    Transitioning,
    Off,
}

/// A sticky one-shot interrupt-cause latch: set by the filter, consumed by
/// exactly one secondary-handler invocation.
#[derive(Default)]
struct CauseLatch(AtomicU32);

impl CauseLatch {
    fn latch(&self, bit: u32) {
        self.0.store(bit, Ordering::Release);
    }

    fn take(&self) -> bool {
        self.0.swap(0, Ordering::AcqRel) != 0
    }
}

#[derive(Default)]
struct InterruptCauses {
    host_error: CauseLatch,
    error: CauseLatch,
    complete: CauseLatch,
    port_change: CauseLatch,
    async_advance: CauseLatch,
    frame_rollover: CauseLatch,
}

/// State only ever touched under the serialization gate.
#[derive(Default)]
struct GatedState {
    anchor: FrameAnchor,
    power_state: PowerState,
    host_error_count: u32,
    host_errors_displayed: u32,
}

/// Collaborators the primary filter needs per invocation.
pub struct FilterContext<'a> {
    pub mem: &'a mut dyn MemoryBus,
    pub signal: &'a dyn InterruptSignal,
    pub clock: &'a dyn TimeSource,
}

/// Collaborators the gated stage needs per invocation.
pub struct PollContext<'a> {
    pub scavenger: &'a mut dyn IsochScavenger,
    pub root_hub: &'a mut dyn RootHubOps,
}

pub struct EhciController<B: RegisterBus> {
    regs: RegisterBlock<B>,
    config: ControllerConfig,
    /// Cleared the first time any register read returns the removal
    /// sentinel; every entry point short-circuits on it afterwards.
    available: AtomicBool,
    /// Wide monotonically increasing frame counter, in frames. Only the
    /// filter advances it.
    frame_number: AtomicU64,
    // Anchor staging. The filter writes these; the gated stage copies them
    // into the committed anchor, because the commit needs the gate the
    // filter cannot take.
    temp_anchor_frame: AtomicU64,
    temp_anchor_time: AtomicU64,
    isoch_abort_in_progress: AtomicBool,
    causes: InterruptCauses,
    schedule: Mutex<PeriodicSchedule>,
    done_queue: DoneQueue,
    gated: Mutex<GatedState>,
}

impl<B: RegisterBus> EhciController<B> {
    pub fn new(bus: B, config: ControllerConfig) -> Self {
        Self {
            regs: RegisterBlock::new(bus),
            config,
            available: AtomicBool::new(true),
            frame_number: AtomicU64::new(0),
            temp_anchor_frame: AtomicU64::new(0),
            temp_anchor_time: AtomicU64::new(0),
            isoch_abort_in_progress: AtomicBool::new(false),
            causes: InterruptCauses::default(),
            schedule: Mutex::new(PeriodicSchedule::new(
                config.frame_list_entries,
                config.periodic_list_base,
            )),
            done_queue: DoneQueue::new(),
            gated: Mutex::new(GatedState::default()),
        }
    }

    /// Primary interrupt filter.
    ///
    /// Invoked by the host OS whenever the controller's interrupt line
    /// asserts; runs in interrupt context and never blocks (the only lock it
    /// takes is the done queue's short spin section and the periodic
    /// schedule's, both bounded).
    ///
    /// Always returns `false`, meaning "do not run the action routine
    /// automatically". The filter signals the action stage explicitly through
    /// [`FilterContext::signal`] instead, which keeps the filter runnable
    /// again before the action stage executes; low-latency isochronous
    /// consumers depend on that when the action stage is delayed tens of
    /// milliseconds under load.
    pub fn filter_interrupt(&self, ctx: &mut FilterContext<'_>) -> bool {
        if !self.available.load(Ordering::Acquire) {
            return false;
        }

        if let Err(HardwareError::DeviceGone) = self.service_interrupts(ctx) {
            tracing::warn!("register read returned the removal sentinel; controller unavailable");
            self.available.store(false, Ordering::Release);
        }
        false
    }

    fn service_interrupts(&self, ctx: &mut FilterContext<'_>) -> Result<(), HardwareError> {
        let enabled = self.regs.read_checked(REG_USBINTR)?;
        let active = self.regs.read_checked(REG_USBSTS)? & enabled;
        if active == 0 {
            // Shared interrupt line: another device's interrupt, nothing of
            // ours pending.
            return Ok(());
        }
        tracing::trace!(enabled, active, "servicing controller interrupts");

        let mut status_clear = 0u32;
        let mut need_signal = false;

        if active & USBSTS_FLR != 0 {
            let frindex = self.regs.read_checked(REG_FRINDEX)?;
            // The rollover interrupt fires on each toggle of the index's top
            // bit; only the wrap back below the midpoint advances the wide
            // counter, and by the full register span.
            if frindex < self.config.rollover_threshold() {
                self.frame_number
                    .fetch_add(self.config.frame_number_increment(), Ordering::Relaxed);
            }
            let frame_number = self.frame_number.load(Ordering::Relaxed);
            self.temp_anchor_frame
                .store(frame_number + u64::from(frindex >> 3), Ordering::Relaxed);
            self.temp_anchor_time.store(ctx.clock.now(), Ordering::Relaxed);
            self.causes.frame_rollover.latch(USBSTS_FLR);
            status_clear |= USBSTS_FLR;
        }

        // These causes need no interrupt-context work; latch and let the
        // gated stage handle them.
        if active & USBSTS_IAA != 0 {
            self.causes.async_advance.latch(USBSTS_IAA);
            status_clear |= USBSTS_IAA;
            need_signal = true;
        }
        if active & USBSTS_HSE != 0 {
            self.causes.host_error.latch(USBSTS_HSE);
            status_clear |= USBSTS_HSE;
            need_signal = true;
        }
        if active & USBSTS_PCD != 0 {
            self.causes.port_change.latch(USBSTS_PCD);
            status_clear |= USBSTS_PCD;
            need_signal = true;
        }
        if active & USBSTS_USBERRINT != 0 {
            self.causes.error.latch(USBSTS_USBERRINT);
            status_clear |= USBSTS_USBERRINT;
            need_signal = true;
        }

        if active & USBSTS_USBINT != 0 {
            // One timestamp for everything retired by this pass keeps the
            // low-latency frame-list updates mutually consistent.
            let timestamp = ctx.clock.now();
            status_clear |= USBSTS_USBINT;
            need_signal = true;

            let abort_in_progress = self.isoch_abort_in_progress.load(Ordering::Acquire);
            if !abort_in_progress {
                // Some PCIe topologies need a read across the bus after a
                // status write-clear before the cleared state sticks. The
                // USBCMD read just below is that read, so flush the
                // accumulated bits now and keep the order: STS write, sync,
                // then USBCMD.
                self.regs.write(REG_USBSTS, status_clear);
                self.regs.sync();
                status_clear = 0;
            }

            if !abort_in_progress && self.regs.read(REG_USBCMD) & USBCMD_PSE != 0 {
                let mut sched = self.schedule.lock();
                if sched.out_slot().is_some() {
                    let frindex = self.regs.read_checked(REG_FRINDEX)?;
                    let retired = scavenge_periodic(&mut sched, ctx.mem, frindex, timestamp);
                    drop(sched);
                    self.done_queue.commit(retired);
                }
            }

            // The scavenger keys off this latch to know work is ready, so
            // the producer count must be fully published before it is set.
            self.causes.complete.latch(USBSTS_USBINT);
        }

        if status_clear != 0 {
            self.regs.write(REG_USBSTS, status_clear);
            self.regs.sync();
            // One read across the bus to force the write-clear home.
            let _ = self.regs.read(REG_USBSTS);
        }

        if need_signal {
            ctx.signal.signal();
        }
        Ok(())
    }

    /// Gated action-stage entry point wired to the host's interrupt event
    /// source: re-checks availability, then dispatches latched causes.
    pub fn handle_interrupt(&self, ctx: &mut PollContext<'_>) {
        if !self.available.load(Ordering::Acquire) {
            tracing::trace!("ignoring interrupt; controller is unavailable");
            return;
        }
        self.poll_interrupts(ctx);
    }

    /// Secondary interrupt handler.
    ///
    /// Must only be called from the controller's serialized execution
    /// context. Each latched cause is consumed at most once per invocation;
    /// the dispatch order matters (host error first, anchor commit last).
    pub fn poll_interrupts(&self, ctx: &mut PollContext<'_>) {
        let mut gated = self.gated.lock();

        if self.causes.host_error.take() {
            gated.host_error_count += 1;
            // Log only every power-of-two occurrence so a wedged bus cannot
            // flood the diagnostics.
            if gated.host_error_count == 1u32 << gated.host_errors_displayed {
                self.dump_registers("host system error");
                tracing::error!(
                    count = gated.host_error_count,
                    "host system error (fatal PCI error); controller not restarted"
                );
                gated.host_errors_displayed += 1;
                #[cfg(feature = "halt-on-host-error")]
                panic!("EHCI host system error (fatal PCI error)");
            }
        }

        if self.causes.error.take() {
            tracing::trace!("error interrupt");
            self.scavenge_completed_transactions(ctx);
        }

        if self.causes.complete.take() {
            tracing::trace!("completion interrupt");
            self.scavenge_completed_transactions(ctx);
        }

        if self.causes.port_change.take() {
            tracing::debug!("port change interrupt; ensuring usability");
            ctx.root_hub.ensure_usability();
            if gated.power_state == PowerState::On {
                ctx.root_hub.check_for_port_resumes();
            } else {
                // Racing the port state machine against an in-flight power
                // transition loses; the port keeps its change bit asserted,
                // so the check re-runs once power settles.
                tracing::debug!(
                    state = ?gated.power_state,
                    "deferring port resume check until power is stable"
                );
            }
        }

        if self.causes.async_advance.take() {
            // Consumed by the endpoint-deletion machinery elsewhere; nothing
            // more to do in this stage.
            tracing::trace!("async advance interrupt");
        }

        if self.causes.frame_rollover.take() {
            // The staged pair becomes authoritative only here: the filter
            // cannot take the gate, so this is the single commit point and
            // consumers never observe a half-updated anchor.
            gated.anchor = FrameAnchor {
                frame: self.temp_anchor_frame.load(Ordering::Relaxed),
                time: self.temp_anchor_time.load(Ordering::Relaxed),
            };
        }
    }

    fn scavenge_completed_transactions(&self, ctx: &mut PollContext<'_>) {
        let batch = self.done_queue.drain();
        tracing::trace!(count = batch.len(), "delivering retired descriptors");
        ctx.scavenger.completed_transactions(batch);
    }

    /// Logs the operational registers at error level, for fatal-error
    /// diagnostics.
    pub fn dump_registers(&self, reason: &str) {
        let usbcmd = self.regs.read(REG_USBCMD);
        let usbsts = self.regs.read(REG_USBSTS);
        let usbintr = self.regs.read(REG_USBINTR);
        let frindex = self.regs.read(REG_FRINDEX);
        tracing::error!(
            "register dump ({reason}): USBCMD={usbcmd:#010x} USBSTS={usbsts:#010x} \
             USBINTR={usbintr:#010x} FRINDEX={frindex:#010x}"
        );
    }

    /// False once the controller has been observed gone from the bus.
    pub fn available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Wide frame counter, in frames. Advances only on physical FRINDEX
    /// wraps, so it carries the bits above the hardware register's span.
    pub fn frame_number(&self) -> u64 {
        self.frame_number.load(Ordering::Relaxed)
    }

    /// Last committed (frame, time) anchor.
    pub fn anchor(&self) -> FrameAnchor {
        self.gated.lock().anchor
    }

    pub fn power_state(&self) -> PowerState {
        self.gated.lock().power_state
    }

    /// Host system errors observed so far.
    pub fn host_error_count(&self) -> u32 {
        self.gated.lock().host_error_count
    }

    /// Reported by the external power manager; gates the port-resume sweep.
    pub fn set_power_state(&self, state: PowerState) {
        self.gated.lock().power_state = state;
    }

    /// Set while an isochronous-endpoint abort is tearing down descriptors;
    /// suppresses the filter's periodic walk for the duration.
    pub fn set_isoch_abort_in_progress(&self, in_progress: bool) {
        self.isoch_abort_in_progress
            .store(in_progress, Ordering::Release);
    }

    pub fn done_queue(&self) -> &DoneQueue {
        &self.done_queue
    }

    /// The periodic schedule, for the transfer-submission path and tests.
    /// Held only briefly; the filter contends for this lock in interrupt
    /// context.
    pub fn schedule(&self) -> spin::MutexGuard<'_, PeriodicSchedule> {
        self.schedule.lock()
    }
}
