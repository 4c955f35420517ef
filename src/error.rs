//! Unified error type for the kernel.
//!
//! A single closed `Error` enum that every subsystem funnels into, keeping
//! error handling uniform from the allocator up to the scheduler loop.
//! All variants are `Copy` so they can be cheaply passed through
//! ISR-adjacent paths without allocation.
//!
//! Contract violations (`Arg*`) additionally `debug_assert!` at the call
//! site in debug builds; release builds only return the error.

use core::fmt;

/// Every fallible kernel operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Generic timeout. Reserved for ports; unused by the core.
    Timeout,
    /// Operation explicitly aborted.
    OpAbort,
    /// A handle refers to an object that no longer exists.
    ObjectNotFound,
    /// A handle refers to a live slot of the wrong generation or kind.
    ObjectInvalid,
    /// An allocator or a bounded queue is exhausted.
    NoMemory,
    /// No registered event pool can satisfy the requested size.
    NoResource,
    /// The event reference counter would overflow.
    NoReference,
    /// The operation is recognised but not implemented.
    NotImplemented,
    /// The operation is not permitted in the current object state.
    NotPermitted,
    /// The required feature is compiled out or not configured.
    NotEnabled,
    /// A lookup by name or id produced nothing.
    NotFound,
    /// An argument violates the operation's contract.
    ArgInvalid,
    /// A numeric argument is outside its permitted range.
    ArgOutOfRange,
    /// A required argument is absent.
    ArgNull,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "operation timed out"),
            Self::OpAbort => write!(f, "operation aborted"),
            Self::ObjectNotFound => write!(f, "object not found"),
            Self::ObjectInvalid => write!(f, "object invalid"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::NoResource => write!(f, "no suitable resource"),
            Self::NoReference => write!(f, "reference counter exhausted"),
            Self::NotImplemented => write!(f, "not implemented"),
            Self::NotPermitted => write!(f, "not permitted"),
            Self::NotEnabled => write!(f, "feature not enabled"),
            Self::NotFound => write!(f, "not found"),
            Self::ArgInvalid => write!(f, "invalid argument"),
            Self::ArgOutOfRange => write!(f, "argument out of range"),
            Self::ArgNull => write!(f, "null argument"),
        }
    }
}

/// Kernel-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(Error::NoMemory.to_string(), "out of memory");
        assert_eq!(Error::NoReference.to_string(), "reference counter exhausted");
    }

    #[test]
    fn errors_are_copy_and_comparable() {
        let e = Error::ArgOutOfRange;
        let f = e;
        assert_eq!(e, f);
        assert_ne!(e, Error::ArgInvalid);
    }
}
