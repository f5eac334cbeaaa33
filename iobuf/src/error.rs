//! Error types for the I/O buffer subsystem.

use core::fmt;

/// Errors surfaced by I/O buffer operations.
///
/// Every failure leaves the buffer involved in a releasable state; only
/// `TryAgain` is recovered internally (the page-in retry loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "I/O buffer errors must be handled, not silently discarded"]
pub enum IoBufferError {
    /// An allocator (descriptor storage, pool, virtual range, or physical
    /// page backing) refused the request.
    InsufficientResources { resource: &'static str },
    /// A caller-supplied value was out of range, or a supposedly non-paged
    /// page had no physical mapping.
    InvalidParameter { name: &'static str },
    /// An address range crosses the kernel/user boundary, or a vector
    /// element targets kernel memory from user mode.
    AccessViolation { address: u64 },
    /// The buffer cannot hold the requested bytes and cannot be extended,
    /// or extension would need more fragment slots than remain.
    BufferTooSmall { required: usize, capacity: usize },
    /// A copy or zero walk ran off the end of the fragment list.
    IncorrectBufferSize { offset: usize, size: usize },
    /// The physical page allocator failed during extension.
    NoMemory { requested_pages: usize },
    /// The page-in collaborator asked for a retry. Handled locally; never
    /// escapes a public operation.
    TryAgain,
}

/// Result type alias for I/O buffer operations.
pub type Result<T> = core::result::Result<T, IoBufferError>;

impl fmt::Display for IoBufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientResources { resource } => {
                write!(f, "Insufficient resources: {}", resource)
            }
            Self::InvalidParameter { name } => write!(f, "Invalid parameter: {}", name),
            Self::AccessViolation { address } => {
                write!(f, "Access violation at 0x{:x}", address)
            }
            Self::BufferTooSmall { required, capacity } => {
                write!(
                    f,
                    "Buffer too small: required {} bytes, capacity {}",
                    required, capacity
                )
            }
            Self::IncorrectBufferSize { offset, size } => {
                write!(
                    f,
                    "Incorrect buffer size: walk at offset {} for {} bytes",
                    offset, size
                )
            }
            Self::NoMemory { requested_pages } => {
                write!(f, "Out of memory: {} pages requested", requested_pages)
            }
            Self::TryAgain => write!(f, "Transient failure, retry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = IoBufferError::BufferTooSmall {
            required: 8192,
            capacity: 4096,
        };
        assert!(err.to_string().contains("8192"));
        let err = IoBufferError::AccessViolation { address: 0xdead };
        assert!(err.to_string().contains("0xdead"));
    }
}
