//! Process group handles and the collective utilities built on them.

use std::fmt;

use log::{debug, error};
use mpi::{
    collective::SystemOperation,
    topology::{Rank, SimpleCommunicator},
    traits::*,
};

use crate::{
    checksum::combine_in_rank_order,
    error::{ErrorKind, ForestError, Result},
};

enum Handle<'c> {
    Null,
    Borrowed(&'c SimpleCommunicator),
    Owned(SimpleCommunicator),
}

/// Handle on the communicator a forest or a transfer runs over.
///
/// A handle either borrows a communicator owned by someone else, or owns a
/// duplicate that is released when the handle is freed or dropped.
pub struct ProcessGroup<'c> {
    handle: Handle<'c>,
}

/// Logical operation for [`ProcessGroup::sync_flag`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOp {
    And,
    Or,
}

impl<'c> ProcessGroup<'c> {
    /// A handle that refers to no communicator.
    pub fn null() -> Self {
        ProcessGroup {
            handle: Handle::Null,
        }
    }

    /// A handle owning a fresh duplicate of `comm`.
    pub fn duplicate_of(comm: &SimpleCommunicator) -> Self {
        let mut group = ProcessGroup::null();
        group.create(comm);
        group
    }

    /// A handle borrowing `comm`.
    pub fn borrowed(comm: &'c SimpleCommunicator) -> Self {
        let mut group = ProcessGroup::null();
        group.assign(comm);
        group
    }

    /// Replace the current communicator by an owned duplicate of `comm`.
    pub fn create(&mut self, comm: &SimpleCommunicator) {
        self.free();
        let duplicate = comm.duplicate();
        debug!(
            "process group created, rank {} of {}",
            duplicate.rank(),
            duplicate.size()
        );
        self.handle = Handle::Owned(duplicate);
    }

    /// Replace the current communicator by a borrowed `comm`, without duplication.
    pub fn assign(&mut self, comm: &'c SimpleCommunicator) {
        self.free();
        self.handle = Handle::Borrowed(comm);
    }

    /// Release an owned duplicate and reset to null. Borrowed communicators are left alone.
    pub fn free(&mut self) {
        if let Handle::Owned(_) = self.handle {
            debug!("process group freed");
        }
        // Dropping an owned communicator frees it.
        self.handle = Handle::Null;
    }

    pub fn is_null(&self) -> bool {
        matches!(self.handle, Handle::Null)
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.handle, Handle::Owned(_))
    }

    /// The underlying communicator.
    pub fn comm(&self) -> Result<&SimpleCommunicator> {
        match &self.handle {
            Handle::Null => Err(ForestError::NullProcessGroup),
            Handle::Borrowed(comm) => Ok(*comm),
            Handle::Owned(comm) => Ok(comm),
        }
    }

    pub fn rank(&self) -> Result<Rank> {
        Ok(self.comm()?.rank())
    }

    pub fn size(&self) -> Result<Rank> {
        Ok(self.comm()?.size())
    }

    /// Logical AND or OR of `flag` over all processes. Collective.
    pub fn sync_flag(&self, flag: bool, op: SyncOp) -> Result<bool> {
        let comm = self.comm()?;

        let local = flag as i32;
        let mut global: i32 = 0;
        let operation = match op {
            SyncOp::And => SystemOperation::logical_and(),
            SyncOp::Or => SystemOperation::logical_or(),
        };
        comm.all_reduce_into(&local, &mut global, operation);

        Ok(global != 0)
    }

    /// Combine per-process Adler-32 checksums in rank order. Collective.
    ///
    /// Returns the checksum of the concatenation of all local byte ranges on
    /// rank 0, and 0 everywhere else.
    pub fn checksum(&self, local_crc: u32, local_bytes: u64) -> Result<u32> {
        let comm = self.comm()?;
        let root_rank = 0;
        let root = comm.process_at_rank(root_rank);

        if comm.rank() == root_rank {
            let size = comm.size() as usize;
            let mut crcs = vec![0u32; size];
            let mut bytes = vec![0u64; size];

            root.gather_into_root(&local_crc, &mut crcs[..]);
            root.gather_into_root(&local_bytes, &mut bytes[..]);

            combine_in_rank_order(&crcs, &bytes)
        } else {
            root.gather_into(&local_crc);
            root.gather_into(&local_bytes);

            Ok(0)
        }
    }

    /// Terminate every process of the group after a fatal error.
    pub fn abort(&self, err: &ForestError) -> ! {
        error!("aborting process group: {}", err);

        let code = match err.kind() {
            ErrorKind::PreconditionViolation => 1,
            ErrorKind::TransportFailure => 2,
            ErrorKind::InvariantViolation => 3,
        };

        match self.comm() {
            Ok(comm) => comm.abort(code),
            Err(_) => SimpleCommunicator::world().abort(code),
        }
    }
}

impl<'c> Default for ProcessGroup<'c> {
    fn default() -> Self {
        ProcessGroup::null()
    }
}

impl<'c> fmt::Debug for ProcessGroup<'c> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.handle {
            Handle::Null => "null",
            Handle::Borrowed(_) => "borrowed",
            Handle::Owned(_) => "owned",
        };
        f.debug_struct("ProcessGroup").field("handle", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_group_rejects_communication() {
        let group = ProcessGroup::null();
        assert!(group.is_null());
        assert!(!group.is_owned());
        assert_eq!(group.rank(), Err(ForestError::NullProcessGroup));
        assert_eq!(
            group.sync_flag(true, SyncOp::And),
            Err(ForestError::NullProcessGroup)
        );
        assert_eq!(group.checksum(1, 0), Err(ForestError::NullProcessGroup));
    }

    #[test]
    fn test_free_null_is_noop() {
        let mut group = ProcessGroup::default();
        group.free();
        assert!(group.is_null());
        assert_eq!(format!("{:?}", group), "ProcessGroup { handle: \"null\" }");
    }
}
