//! Error types
//!
//! Structural faults the allocator reports to callers. Resource exhaustion
//! is not an error: a failed allocation returns `None` and the caller deals
//! with it. The variants here cover misuse and corrupted state.

use core::fmt;

use crate::types::Pfn;

/// Allocator error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Requested or supplied order is outside `0..MAX_ORDER`
    InvalidOrder(usize),
    /// Block start is not aligned to its order
    MisalignedBlock {
        /// First frame of the block
        pfn: Pfn,
        /// Claimed order of the block
        order: usize,
    },
    /// PFN lies outside the frame array or its claimed zone
    OutOfRange(Pfn),
    /// Page descriptor failed an integrity check (flags, refcount, mapcount)
    BadPageState(Pfn),
    /// Compound head/tail relationship is inconsistent
    CompoundMismatch(Pfn),
    /// The supplied memory configuration is unusable
    InvalidConfig(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidOrder(order) => write!(f, "invalid order {}", order),
            Error::MisalignedBlock { pfn, order } => {
                write!(f, "pfn {:#x} not aligned to order {}", pfn, order)
            }
            Error::OutOfRange(pfn) => write!(f, "pfn {:#x} out of range", pfn),
            Error::BadPageState(pfn) => write!(f, "bad page state at pfn {:#x}", pfn),
            Error::CompoundMismatch(pfn) => {
                write!(f, "broken compound page at pfn {:#x}", pfn)
            }
            Error::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

/// Result alias used throughout the allocator
pub type Result<T> = core::result::Result<T, Error>;
