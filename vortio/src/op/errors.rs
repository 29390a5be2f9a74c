use std::io;

/// Errors surfaced at an operation's await site.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    /// The submission ring is full and could not be flushed. The operation
    /// never reached the kernel; retry after yielding.
    #[error("submission queue is full, cannot submit operation")]
    SubmissionFull,

    /// The in-flight tag table is at capacity. Same retry contract as
    /// [`IoError::SubmissionFull`].
    #[error("operation tag table is full, cannot register operation")]
    TagTableFull,

    /// The kernel completed the operation with an error: the negated raw
    /// result, verbatim.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IoError {
    pub(crate) fn from_raw_os_error(errno: i32) -> Self {
        Self::Io(io::Error::from_raw_os_error(errno))
    }

    /// The raw OS error code, if this wraps a kernel result.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// Whether the caller may retry after yielding to the scheduler.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SubmissionFull | Self::TagTableFull)
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SubmissionFull, Self::SubmissionFull) => true,
            (Self::TagTableFull, Self::TagTableFull) => true,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_os_error_round_trip() {
        let err = IoError::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(err.raw_os_error(), Some(libc::ECONNRESET));
        assert!(!err.is_retryable());
        assert!(IoError::SubmissionFull.is_retryable());
        assert!(IoError::TagTableFull.is_retryable());
    }
}
