//! Error kinds surfaced by the VM core.
//!
//! Only user-visible faults are recoverable; everything else (out-of-memory,
//! invariant violations, bootstrap inconsistencies) is fatal and is reported
//! by panicking, optionally after logging context via the `log` facade.

/// The kind of event that caused a trap into `vm_fault`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultType {
    ReadMiss,
    WriteMiss,
    ReadonlyViolation,
}

/// The single recoverable error kind the VM core returns to the trap
/// handler. Every fault either resolves successfully (the TLB has been
/// updated) or comes back as this.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvalidAccess;

pub type VmFaultResult = Result<(), InvalidAccess>;
