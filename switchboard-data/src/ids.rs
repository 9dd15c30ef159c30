//! Identity types.
//!
//! Every record that owns flows in the staging table is identified by a
//! stable UUID. Rows, datapaths and datapath groups get their own newtype
//! so the translator cannot mix them up; [`OwnerId`] is the erased form
//! the flow sink keys its ownership links by.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            /// A fresh random identity.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// The low 32 bits of the identity, used as the flow cookie.
            pub fn cookie(&self) -> u32 {
                u32::from_be_bytes(self.0.as_bytes()[..4].try_into().unwrap())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for OwnerId {
            fn from(id: $name) -> OwnerId {
                OwnerId(id.0)
            }
        }
    };
}

uuid_id! {
    /// Identity of one logical pipeline row.
    RowId
}
uuid_id! {
    /// Identity of a datapath binding.
    DpId
}
uuid_id! {
    /// Identity of a datapath group.
    DpGroupId
}

/// The erased identity the flow sink links desired flows to. Rows,
/// port bindings, MAC bindings, FDB entries and load balancers all own
/// flows, so the sink does not distinguish between them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn cookie(&self) -> u32 {
        u32::from_be_bytes(self.0.as_bytes()[..4].try_into().unwrap())
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<OwnerId> for RowId {
    fn from(id: OwnerId) -> RowId {
        RowId(id.0)
    }
}
