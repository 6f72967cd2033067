//! Strongly-typed identifiers.
//!
//! Each id is a transparent newtype over an integer so that a storage node id
//! can never be passed where a namespace node id is expected.

/// Declare a transparent integer newtype.
///
/// The generated type derefs to the inner integer, converts both ways with
/// `From`, is `Copy + Ord + Hash`, serializes as the bare integer and prints
/// as `<tag>-<n>` (`Debug` adds the type name).
#[macro_export]
macro_rules! strong_type {
    ($name:ident, $inner:ty, $tag:literal) => {
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl ::std::ops::Deref for $name {
            type Target = $inner;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}-{}", $tag, self.0)
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(val: $inner) -> Self {
                Self(val)
            }
        }

        impl From<$name> for $inner {
            #[inline]
            fn from(val: $name) -> Self {
                val.0
            }
        }
    };
}

strong_type!(InodeId, u64, "inode");
strong_type!(StorageId, u32, "storage");
strong_type!(ClientId, u64, "client");

impl InodeId {
    /// The namespace root always has id 0.
    pub const ROOT: InodeId = InodeId(0);

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl ClientId {
    /// Owner of locks the naming server takes on its own behalf.
    pub const SYSTEM: ClientId = ClientId(0);
}
