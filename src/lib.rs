pub mod checksum;
pub mod comm;
pub mod constants;
pub mod contact;
pub mod error;
pub mod forest;
pub mod ownership;
pub mod partition;
pub(crate) mod request;
pub mod transfer;
pub mod types;

pub use comm::{ProcessGroup, SyncOp};
pub use error::{ErrorKind, ForestError, Result};
pub use forest::{Forest, LocalTree};
pub use partition::{Partition, PartitionCounts};
