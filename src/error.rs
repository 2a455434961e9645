//! Error types shared by the partition, ownership and transfer layers.
//!
//! None of these errors are meant to be recovered from. They exist so that a
//! caller sees *why* the group has to stop, and can decide whether to abort the
//! whole process group or only unwind its own rank.
use thiserror::Error;

/// The three fatal categories an operation can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PreconditionViolation,
    TransportFailure,
    InvariantViolation,
}

/// Errors raised by forest partition and communication routines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForestError {
    /// A partition or transfer operation was issued on a null process group.
    #[error("Process group handle is null. Call `create()` or `assign()` before communicating")]
    NullProcessGroup,

    /// The caller broke the contract of an operation.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// A message passing call reported failure.
    #[error("Message passing failed in {operation} with MPI error code {code}")]
    Transport {
        operation: &'static str,
        code: i32,
    },

    /// A replicated table is inconsistent.
    #[error("Partition invariant violated: {0}")]
    Invariant(String),
}

impl ForestError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForestError::NullProcessGroup | ForestError::Precondition(_) => {
                ErrorKind::PreconditionViolation
            }
            ForestError::Transport { .. } => ErrorKind::TransportFailure,
            ForestError::Invariant(_) => ErrorKind::InvariantViolation,
        }
    }

    pub(crate) fn precondition<S: Into<String>>(msg: S) -> Self {
        ForestError::Precondition(msg.into())
    }

    pub(crate) fn invariant<S: Into<String>>(msg: S) -> Self {
        ForestError::Invariant(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ForestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            ForestError::NullProcessGroup.kind(),
            ErrorKind::PreconditionViolation
        );
        assert_eq!(
            ForestError::precondition("guess out of range").kind(),
            ErrorKind::PreconditionViolation
        );
        assert_eq!(
            ForestError::Transport {
                operation: "MPI_Waitall",
                code: 1
            }
            .kind(),
            ErrorKind::TransportFailure
        );
        assert_eq!(
            ForestError::invariant("counts decrease").kind(),
            ErrorKind::InvariantViolation
        );
    }

    #[test]
    fn test_messages() {
        let err = ForestError::Transport {
            operation: "MPI_Isend",
            code: 13,
        };
        assert_eq!(
            err.to_string(),
            "Message passing failed in MPI_Isend with MPI error code 13"
        );
    }
}
