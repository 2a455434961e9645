//! Non-blocking point to point requests that outlive the call that posted them.
//!
//! A [`RequestSet`] only holds raw request handles. Whoever posts into it keeps
//! the buffers alive and untouched until the set has been waited on. Dropping a
//! set with outstanding requests waits on them.

use std::{
    mem::MaybeUninit,
    os::raw::{c_int, c_void},
};

use log::{error, trace};
use mpi::{
    datatype::Equivalence,
    ffi,
    raw::AsRaw,
    topology::{Rank, SimpleCommunicator},
};

use crate::{
    error::{ForestError, Result},
    types::Tag,
};

const MPI_SUCCESS: c_int = 0;

fn check(operation: &'static str, code: c_int) -> Result<()> {
    if code == MPI_SUCCESS {
        Ok(())
    } else {
        Err(ForestError::Transport { operation, code })
    }
}

fn message_count(len: usize) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| {
        ForestError::precondition(format!(
            "message of {} bytes exceeds the largest MPI count",
            len
        ))
    })
}

/// Outstanding sends and receives over byte buffers.
pub(crate) struct RequestSet {
    requests: Vec<ffi::MPI_Request>,
}

impl RequestSet {
    pub fn new() -> Self {
        RequestSet {
            requests: Vec::new(),
        }
    }

    /// Post a receive of `buf.len()` bytes from `source`.
    ///
    /// # Safety
    ///
    /// `buf` must stay allocated and must not be read or written until this set
    /// has been waited on.
    pub unsafe fn receive_into(
        &mut self,
        comm: &SimpleCommunicator,
        source: Rank,
        tag: Tag,
        buf: &mut [u8],
    ) -> Result<()> {
        let count = message_count(buf.len())?;
        let mut request = MaybeUninit::<ffi::MPI_Request>::uninit();

        let code = ffi::MPI_Irecv(
            buf.as_mut_ptr() as *mut c_void,
            count,
            u8::equivalent_datatype().as_raw(),
            source,
            tag,
            comm.as_raw(),
            request.as_mut_ptr(),
        );
        check("MPI_Irecv", code)?;
        trace!("posted receive of {} bytes from rank {}", count, source);

        self.requests.push(request.assume_init());
        Ok(())
    }

    /// Post a send of `buf` to `dest`.
    ///
    /// # Safety
    ///
    /// `buf` must stay allocated and must not be written until this set has been
    /// waited on.
    pub unsafe fn send(
        &mut self,
        comm: &SimpleCommunicator,
        dest: Rank,
        tag: Tag,
        buf: &[u8],
    ) -> Result<()> {
        let count = message_count(buf.len())?;
        let mut request = MaybeUninit::<ffi::MPI_Request>::uninit();

        let code = ffi::MPI_Isend(
            buf.as_ptr() as *const c_void,
            count,
            u8::equivalent_datatype().as_raw(),
            dest,
            tag,
            comm.as_raw(),
            request.as_mut_ptr(),
        );
        check("MPI_Isend", code)?;
        trace!("posted send of {} bytes to rank {}", count, dest);

        self.requests.push(request.assume_init());
        Ok(())
    }

    /// Block until every outstanding request has completed.
    pub fn wait_all(&mut self) -> Result<()> {
        if self.requests.is_empty() {
            return Ok(());
        }

        let count = message_count(self.requests.len())?;
        let code = unsafe {
            ffi::MPI_Waitall(
                count,
                self.requests.as_mut_ptr(),
                ffi::RSMPI_STATUSES_IGNORE,
            )
        };
        // Completed requests are reset to the null request, nothing is left to free.
        self.requests.clear();

        check("MPI_Waitall", code)
    }
}

impl Default for RequestSet {
    fn default() -> Self {
        RequestSet::new()
    }
}

impl Drop for RequestSet {
    fn drop(&mut self) {
        if let Err(err) = self.wait_all() {
            error!("outstanding requests failed while being dropped: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_waits_trivially() {
        let mut set = RequestSet::new();
        assert!(set.wait_all().is_ok());
        assert!(set.requests.is_empty());
    }

    #[test]
    fn test_check() {
        assert!(check("MPI_Irecv", MPI_SUCCESS).is_ok());
        assert_eq!(
            check("MPI_Irecv", 5),
            Err(ForestError::Transport {
                operation: "MPI_Irecv",
                code: 5
            })
        );
    }
}
