//! EHCI (USB 2.0) host-controller interrupt pipeline.
//!
//! This crate implements the split two-stage interrupt handler for an EHCI
//! controller: a fast, non-preemptible primary filter and a gated secondary
//! completion handler, together with the pieces they hand work through: the
//! periodic-schedule retirement walk, the retired-descriptor done queue, and
//! the frame-counter rollover bookkeeping.
//!
//! It is a driver *core*: the surrounding host stack supplies the hardware
//! register mapping ([`regs::RegisterBus`]), descriptor DMA memory
//! ([`MemoryBus`]), interrupt-source registration and the completion/root-hub
//! machinery ([`hooks`]). Transfer submission, bus enumeration, power
//! management and USB protocol handling live outside this crate.
//!
//! ## Execution contexts
//!
//! Two contexts with strictly different guarantees drive the pipeline:
//!
//! - **Interrupt context** runs [`EhciController::filter_interrupt`]. It
//!   cannot block; the only mutual exclusion it uses are short spin
//!   sections, and its work is bounded by the frame-list size rather than by
//!   queue depth.
//! - **Serialized (gated) context** runs
//!   [`EhciController::poll_interrupts`] and every other controller-mutating
//!   operation, one at a time. It alone consumes the cause latches and
//!   commits the frame anchor the filter staged.
//!
//! Hardware departure (a register read returning the all-ones sentinel) is
//! terminal: the controller is flagged unavailable and every subsequent
//! entry returns immediately without touching the register block.

mod controller;
pub mod done_queue;
pub mod hooks;
pub mod memory;
pub mod regs;
pub mod schedule;
mod schedule_periodic;

pub use controller::{
    ControllerConfig, EhciController, FilterContext, FrameAnchor, PollContext, PowerState,
};
pub use done_queue::{DoneBatch, DoneQueue};
pub use memory::MemoryBus;
pub use regs::HardwareError;
