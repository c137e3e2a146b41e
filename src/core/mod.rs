//! Value types shared by the sync engine: identities, clocks, changesets.

pub mod error;
pub mod identity;
pub mod record;
pub mod time;

pub use error::CoreError;
pub use identity::NodeId;
pub use record::{COL_MODIFIED, COL_NODE_ID, Changeset, Record, TableChange};
pub use time::{Hlc, now_ms};
