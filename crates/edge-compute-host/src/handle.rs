//! Typed wrappers around host resource identifiers.
//!
//! Each owning wrapper names exactly one host resource. Wrappers are
//! neither `Clone` nor `Copy`: giving a resource to someone else is a move,
//! and [`BodyHandle::take`] (and friends) leave the invalid sentinel behind
//! as the "used" marker.
//!
//! [`AsyncItemHandle`] is the exception: it is a non-owning readiness key
//! used to ask the host which pending operation can make progress.

use std::fmt;

/// Raw value of a handle that names no resource.
pub const INVALID_HANDLE: u32 = u32::MAX - 1;

macro_rules! owned_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            pub(crate) const fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            /// A handle naming no resource.
            pub const fn invalid() -> Self {
                Self(INVALID_HANDLE)
            }

            pub const fn is_valid(&self) -> bool {
                self.0 != INVALID_HANDLE
            }

            /// Raw identifier, for logging and host bookkeeping.
            pub const fn as_u32(&self) -> u32 {
                self.0
            }

            /// Move the resource out, leaving an invalid handle in place.
            pub fn take(&mut self) -> Self {
                std::mem::replace(self, Self::invalid())
            }

            /// Readiness key for this resource.
            pub const fn async_item(&self) -> AsyncItemHandle {
                AsyncItemHandle(self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::invalid()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                } else {
                    f.write_str(concat!(stringify!($name), "(invalid)"))
                }
            }
        }
    };
}

owned_handle! {
    /// A host-owned byte stream.
    BodyHandle
}

owned_handle! {
    /// A host-side request head (method, URI, headers, options).
    RequestHandle
}

owned_handle! {
    /// A host-side response head (status, headers, options).
    ResponseHandle
}

owned_handle! {
    /// An outbound send whose response has not been collected yet.
    PendingRequestHandle
}

owned_handle! {
    /// A cache lookup result, possibly carrying a transaction obligation.
    CacheHandle
}

/// Non-owning readiness key derived from an owning handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncItemHandle(u32);

impl AsyncItemHandle {
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != INVALID_HANDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle() {
        let handle = BodyHandle::invalid();
        assert!(!handle.is_valid());
        assert_eq!(handle.as_u32(), INVALID_HANDLE);
        assert_eq!(format!("{handle:?}"), "BodyHandle(invalid)");
        assert!(!handle.async_item().is_valid());
    }

    #[test]
    fn test_take_leaves_invalid_marker() {
        let mut handle = BodyHandle::from_raw(7);
        let moved = handle.take();

        assert!(moved.is_valid());
        assert_eq!(moved.as_u32(), 7);
        assert!(!handle.is_valid());
    }

    #[test]
    fn test_async_item_shares_identifier() {
        let pending = PendingRequestHandle::from_raw(42);
        assert_eq!(pending.async_item().as_u32(), 42);
        assert_eq!(format!("{pending:?}"), "PendingRequestHandle(42)");
    }
}
