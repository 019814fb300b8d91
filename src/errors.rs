use crate::ipc::IosError;

#[derive(onlyerror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A fixed-capacity queue had no room for another entry.
    ///
    /// Also returned when a request block is requested while the free list is
    /// exhausted: there is no free block to satisfy a new request.
    #[error("queue is full")]
    QueueFull,
    /// A fixed-capacity queue had nothing to pop.
    #[error("queue is empty")]
    QueueEmpty,
    /// A caller-supplied value was rejected.
    #[error("invalid argument")]
    InvalidArgument,
    /// The driver is not in a state that accepts this operation.
    #[error("driver not ready")]
    NotReady,
    /// A synchronous request did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// A fixed reservation or address window has no room left.
    #[error("out of memory")]
    OutOfMemory,
    /// An address fell outside of the range it was required to be in.
    #[error("invalid address {0}")]
    InvalidAddress(u32),
    /// The emulated microkernel replied with a negative status code.
    #[error("IOS replied with {0}")]
    Ios(IosError),
    /// A host memory management call failed.
    #[error("host memory operation failed: {0}")]
    Host(rustix::io::Errno),
}

impl From<rustix::io::Errno> for Error {
    fn from(value: rustix::io::Errno) -> Self {
        Self::Host(value)
    }
}

impl From<IosError> for Error {
    fn from(value: IosError) -> Self {
        Self::Ios(value)
    }
}

impl From<Error> for IosError {
    fn from(value: Error) -> Self {
        match value {
            Error::QueueFull => IosError::QFULL,
            Error::QueueEmpty => IosError::QEMPTY,
            Error::InvalidArgument => IosError::INVALID_ARG,
            Error::NotReady => IosError::NOT_READY,
            Error::Timeout => IosError::TIMEOUT,
            Error::OutOfMemory => IosError::FAIL_ALLOC,
            Error::InvalidAddress(_) => IosError::INVALID,
            Error::Ios(err) => err,
            Error::Host(_) => IosError::FAIL_INTERNAL,
        }
    }
}
