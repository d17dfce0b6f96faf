//! Index newtypes of a per-request pipeline.
//!
//! `NodeId` indexes `Pipeline::nodes`; `EdgeId` numbers the connections of
//! one pipeline in creation order. Both are plain `u32`s with `u32::MAX`
//! reserved as the unset value.

use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub const INVALID: $name = $name(u32::MAX);

            #[inline]
            pub fn is_valid(self) -> bool {
                self != Self::INVALID
            }

            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, "{}({})", stringify!($name), self.0)
                } else {
                    write!(f, "{}(unset)", stringify!($name))
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

define_id!(
    /// Position of a node in its pipeline, assigned by `Pipeline::add_node`.
    NodeId
);

define_id!(
    /// One dependency -> dependant connection. Every alias of the pair
    /// travels on the same edge, so a node counts edges, not tensors.
    EdgeId
);
