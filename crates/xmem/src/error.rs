//! Standalone error types for xmem
//!
//! Uses thiserror for clean, idiomatic Rust error definitions. Every public
//! operation in the crate returns one of these statuses; there are no
//! panicking paths in release builds.

use thiserror::Error;

#[cfg(feature = "logging")]
use tracing::{error, warn};

/// Memory subsystem errors
///
/// The variants are the exhaustive status taxonomy shared by the allocator
/// layer and the bank-management layer.
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemError {
    // --- Argument / contract errors ---
    #[error("Invalid arguments: {reason}")]
    InvalidArgs { reason: String },

    #[error("Illegal alignment: {align} (must be a non-zero power of two)")]
    IllegalAlign { align: usize },

    // --- Allocation errors ---
    #[error("Memory allocation failed: {size} bytes with {align} byte alignment")]
    AllocFailed { size: usize, align: usize },

    #[error("Pointer {addr:#x} is not an allocation of this allocator")]
    PtrOutOfBounds { addr: usize },

    #[error("Descriptor pool does not fit: {required} bytes required, {available} available")]
    PoolSizeTooSmall { required: usize, available: usize },

    // --- Policy errors ---
    #[error("Operation not supported by this allocation policy: {operation}")]
    UnsupportedAlloc { operation: &'static str },

    // --- Manager lifecycle errors ---
    #[error("Manager has not been initialized")]
    Uninitialized,

    #[error("Failed to initialize bank {bank}: {reason}")]
    InitBanksFailed { bank: usize, reason: String },

    #[error("Failed to initialize manager: {reason}")]
    InitMgrFailed { reason: String },

    #[error("Failed to reserve {requested} bytes of call-stack space")]
    StackReserveFailed { requested: usize },

    #[error("Unsupported memory configuration: {reason}")]
    ConfigUnsupported { reason: String },

    // --- Internal errors ---
    #[error("Internal allocator error: {reason}")]
    Internal { reason: String },
}

impl MemError {
    /// Check if the error is retryable
    ///
    /// Only exhaustion is retryable — freeing memory may make a later attempt
    /// succeed. This is what `alloc_wait` keys its retry loop on.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AllocFailed { .. })
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgs { .. } => "XMEM:ARGS:INVALID",
            Self::IllegalAlign { .. } => "XMEM:ARGS:ALIGN",
            Self::AllocFailed { .. } => "XMEM:ALLOC:FAILED",
            Self::PtrOutOfBounds { .. } => "XMEM:ALLOC:BOUNDS",
            Self::PoolSizeTooSmall { .. } => "XMEM:POOL:TOO_SMALL",
            Self::UnsupportedAlloc { .. } => "XMEM:OP:UNSUPPORTED",
            Self::Uninitialized => "XMEM:MGR:UNINIT",
            Self::InitBanksFailed { .. } => "XMEM:MGR:BANKS",
            Self::InitMgrFailed { .. } => "XMEM:MGR:INIT",
            Self::StackReserveFailed { .. } => "XMEM:MGR:STACK_RESERVE",
            Self::ConfigUnsupported { .. } => "XMEM:MGR:CONFIG",
            Self::Internal { .. } => "XMEM:INTERNAL",
        }
    }

    // ------------------------------------------------------------------
    // Convenience constructors
    // ------------------------------------------------------------------

    /// Create an invalid-arguments error
    pub fn invalid_args(reason: &str) -> Self {
        Self::InvalidArgs {
            reason: reason.to_string(),
        }
    }

    /// Create an illegal-alignment error
    #[must_use]
    pub fn illegal_align(align: usize) -> Self {
        Self::IllegalAlign { align }
    }

    /// Create an allocation-failed error
    pub fn alloc_failed(size: usize, align: usize) -> Self {
        #[cfg(feature = "logging")]
        warn!("memory allocation failed: {} bytes, align {}", size, align);

        Self::AllocFailed { size, align }
    }

    /// Create a pointer-out-of-bounds error
    #[must_use]
    pub fn ptr_out_of_bounds(addr: usize) -> Self {
        Self::PtrOutOfBounds { addr }
    }

    /// Create a descriptor-pool-too-small error
    #[must_use]
    pub fn pool_too_small(required: usize, available: usize) -> Self {
        Self::PoolSizeTooSmall {
            required,
            available,
        }
    }

    /// Create an unsupported-operation error
    #[must_use]
    pub fn unsupported(operation: &'static str) -> Self {
        Self::UnsupportedAlloc { operation }
    }

    /// Create a bank initialization error
    pub fn init_banks_failed(bank: usize, reason: &str) -> Self {
        #[cfg(feature = "logging")]
        error!("bank {} initialization failed: {}", bank, reason);

        Self::InitBanksFailed {
            bank,
            reason: reason.to_string(),
        }
    }

    /// Create a manager initialization error
    pub fn init_mgr_failed(reason: &str) -> Self {
        #[cfg(feature = "logging")]
        error!("manager initialization failed: {}", reason);

        Self::InitMgrFailed {
            reason: reason.to_string(),
        }
    }

    /// Create a stack-reservation error
    #[must_use]
    pub fn stack_reserve_failed(requested: usize) -> Self {
        Self::StackReserveFailed { requested }
    }

    /// Create a configuration-unsupported error
    pub fn config_unsupported(reason: &str) -> Self {
        Self::ConfigUnsupported {
            reason: reason.to_string(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: &str) -> Self {
        #[cfg(feature = "logging")]
        error!("internal allocator error: {}", reason);

        Self::Internal {
            reason: reason.to_string(),
        }
    }
}

/// Result type for memory operations
pub type MemResult<T> = core::result::Result<T, MemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let error = MemError::alloc_failed(1024, 8);
        assert!(error.to_string().contains("1024"));
        assert!(error.to_string().contains('8'));

        let error = MemError::ptr_out_of_bounds(0xdead_beef);
        assert!(error.to_string().contains("0xdeadbeef"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(MemError::alloc_failed(16, 4).code(), "XMEM:ALLOC:FAILED");
        assert_eq!(MemError::illegal_align(3).code(), "XMEM:ARGS:ALIGN");
        assert_eq!(MemError::Uninitialized.code(), "XMEM:MGR:UNINIT");
        assert_eq!(
            MemError::stack_reserve_failed(4096).code(),
            "XMEM:MGR:STACK_RESERVE"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(MemError::alloc_failed(64, 8).is_retryable());
        assert!(!MemError::illegal_align(3).is_retryable());
        assert!(!MemError::Uninitialized.is_retryable());
    }

    #[test]
    fn test_convenience_constructors() {
        let error = MemError::init_banks_failed(1, "region exhausted");
        assert!(error.to_string().contains("bank 1"));

        let error = MemError::unsupported("free on stack allocator");
        assert!(error.to_string().contains("free on stack allocator"));

        let error = MemError::pool_too_small(256, 64);
        assert!(error.to_string().contains("256"));
    }
}
