//! Host-supplied switch that can hold back delivery.

/// Answer of a [`DeliveryGate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Go ahead and send
    Allow,
    /// Keep everything queued and try again at the next trigger
    Defer,
}

/// Consulted synchronously before every flush attempt.
///
/// Implementations must be quick and must not call back into the tracker.
/// Any `Fn() -> GateDecision` closure works as a gate.
pub trait DeliveryGate: Send + Sync {
    fn should_flush(&self) -> GateDecision;
}

impl<F> DeliveryGate for F
where
    F: Fn() -> GateDecision + Send + Sync,
{
    fn should_flush(&self) -> GateDecision {
        self()
    }
}
