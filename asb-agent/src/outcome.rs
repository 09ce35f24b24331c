//! Operator-facing classification of failed operations

/// How a failed operation left the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Nothing was changed, or the failure is harmless to retry
    Failed,
    /// Something went wrong and was already undone (e.g. rollback restored)
    Remediated,
    /// The device may be in an inconsistent state; a human must look
    ManualInterventionRequired,
}
