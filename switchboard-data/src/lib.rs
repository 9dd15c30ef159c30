//! Data model for the switchboard logical-flow translator.
//!
//! This crate holds the *inputs* of the translation core: the logical
//! pipeline rows, the ancillary binding tables (ports, multicast groups,
//! address sets, port groups, MAC bindings, FDB entries, load balancers),
//! the per-chassis runtime state, and the snapshot bundle that groups a
//! consistent read-only view of all of the above together with its name
//! and datapath indexes.
//!
//! Everything here is plain data: no translation logic lives in this
//! crate.

pub mod addr;
pub mod ids;
pub mod lport;
pub mod records;
pub mod snapshot;

pub use addr::{AddrConstant, AddrFamily, AddrParseError};
pub use ids::{DpGroupId, DpId, OwnerId, RowId};
pub use lport::LportAddresses;
pub use records::*;
pub use snapshot::{LocalState, OptDef, OptionBags, Snapshot};
