//! Host-OS collaborator boundary.
//!
//! The interrupt pipeline does not own interrupt registration, time, root-hub
//! port machinery or transfer completion; the surrounding driver framework
//! provides them through these traits. Everything here may be called from the
//! gated (serialized) context; only [`InterruptSignal`] and [`TimeSource`]
//! are additionally called from the primary filter, which runs in interrupt
//! context and cannot block, so those implementations must be non-blocking.

use crate::done_queue::DoneBatch;

/// Wakes the gated action stage of a dual-stage interrupt source.
///
/// The filter always tells the host OS *not* to invoke the action stage
/// automatically and instead signals through this hook when deferred work
/// exists. Decoupling the two keeps filter latency bounded for low-latency
/// isochronous consumers even when the action stage is delayed under load.
pub trait InterruptSignal: Send + Sync {
    fn signal(&self);
}

/// Monotonic timestamp source.
///
/// Units are whatever the host uses for absolute time; the pipeline only
/// stores and forwards the values (frame anchors, low-latency retirement
/// stamps), it never does arithmetic across them.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> u64;
}

/// Converts retired descriptors into completed-transfer notifications.
///
/// Each drain of the done queue is delivered exactly once, in the LIFO order
/// the queue naturally produces; the receiver reorders as needed.
pub trait IsochScavenger {
    fn completed_transactions(&mut self, batch: DoneBatch);
}

/// Root-hub operations triggered by a port-change interrupt.
pub trait RootHubOps {
    /// Re-checks that the root hub is usable after a port event.
    fn ensure_usability(&mut self);

    /// Sweeps root-hub ports for resume detection. Only invoked while the
    /// controller power state is fully on.
    fn check_for_port_resumes(&mut self);
}
