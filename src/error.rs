//! VM Errors
//!
//! Every VM object operation reports failure through [`VmError`]. The
//! ordinary error kinds describe caller mistakes or resource exhaustion;
//! `ShouldWait` and `Batched` are control statuses produced by the fault
//! path when a page source is involved.

/// Result alias used throughout the crate
pub type VmResult<T> = Result<T, VmError>;

/// VM object operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// Offset or length outside the object, or 64-bit overflow
    #[error("offset or length out of range")]
    OutOfRange,
    /// Misaligned offset or disallowed zero length
    #[error("invalid arguments")]
    InvalidArgs,
    /// Operation incompatible with the object's current configuration
    #[error("object in wrong state for operation")]
    BadState,
    /// Non-faulting lookup missed
    #[error("page not found")]
    NotFound,
    /// Physical page allocator exhausted
    #[error("out of physical pages")]
    NoMemory,
    /// Not resizable, or pin count ceiling reached
    #[error("resource unavailable")]
    Unavailable,
    /// Operation not supported on this kind of object
    #[error("operation not supported")]
    NotSupported,
    /// Page table slot already occupied
    #[error("page already present at offset")]
    AlreadyExists,
    /// A page source request is outstanding; wait on it and retry
    #[error("page request pending")]
    ShouldWait,
    /// A page source request was extended; keep faulting, then finalize
    #[error("page request batched")]
    Batched,
    /// The page source failed the request
    #[error("page source failed request")]
    Io,
}

impl VmError {
    /// Whether this status means "wait on the page request and retry"
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::ShouldWait | Self::Batched)
    }
}
