//! Kernel error types
//!
//! A single error enum shared by every subsystem. Failures propagate as
//! `Result` values up to the shell, which reports them and continues; no
//! core failure is fatal to the kernel.

use core::fmt;

/// Errors surfaced by the kernel core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frames or heap bytes exhausted
    OutOfMemory,
    /// Translate or unmap of a virtual address with no mapping
    NotMapped,
    /// Mount, filesystem driver, device, or path component missing
    NotFound,
    /// On-disk structure failed validation (MBR signature, exFAT VBR,
    /// impossible sector geometry)
    BadFormat,
    /// Operation not offered by the target (e.g. write on a read-only
    /// filesystem or device)
    PermissionDenied,
    /// Underlying block operation transferred less than requested
    ShortIo,
    /// Zero length, empty name, malformed path or command
    InvalidArgument,
    /// Fixed-capacity table (drivers, mounts, threads, devices) is full
    ResourceExhausted,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::NotMapped => "address not mapped",
            Self::NotFound => "not found",
            Self::BadFormat => "bad on-disk format",
            Self::PermissionDenied => "operation not permitted",
            Self::ShortIo => "short I/O transfer",
            Self::InvalidArgument => "invalid argument",
            Self::ResourceExhausted => "resource table full",
        };
        f.write_str(msg)
    }
}
