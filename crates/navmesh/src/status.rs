//! Status codes for navigation mesh operations

use nav_common::Error;

/// Low-level outcome of a navigation mesh operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation was successful
    Success,
    /// Operation failed due to an unknown reason
    Failure,
    /// Provided parameter was invalid
    InvalidParam,
    /// Search ran out of nodes before finishing
    OutOfNodes,
    /// Result did not fit the provided capacity
    BufferTooSmall,
    /// Value already exists
    AlreadyExists,
    /// Value does not exist or is not found
    NotFound,
    /// Operation partially succeeded
    PartialResult,
    /// Input data is corrupted or invalid
    DataCorrupted,
    /// Data has wrong magic number
    WrongMagic,
    /// Data has wrong version
    WrongVersion,
    /// Operation on an invalidated or unusable object
    InvalidHandle,
    /// A fixed-size pool has no free entry
    CapacityExceeded,
}

impl Status {
    /// Checks if the status is a failure
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Checks if the status is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success | Status::PartialResult)
    }

    /// Checks if the status carries the partial flag
    pub fn is_partial(&self) -> bool {
        matches!(self, Status::PartialResult | Status::OutOfNodes)
    }

    /// Converts status to a result
    pub fn to_result<T>(self, value: T) -> nav_common::Result<T> {
        if self.is_success() {
            Ok(value)
        } else {
            Err(self.into())
        }
    }
}

impl std::error::Error for Status {}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::Failure => write!(f, "Failure"),
            Status::InvalidParam => write!(f, "Invalid parameter"),
            Status::OutOfNodes => write!(f, "Out of search nodes"),
            Status::BufferTooSmall => write!(f, "Buffer too small"),
            Status::AlreadyExists => write!(f, "Value already exists"),
            Status::NotFound => write!(f, "Value not found"),
            Status::PartialResult => write!(f, "Partial result"),
            Status::DataCorrupted => write!(f, "Data corrupted"),
            Status::WrongMagic => write!(f, "Wrong magic number"),
            Status::WrongVersion => write!(f, "Wrong version"),
            Status::InvalidHandle => write!(f, "Invalid handle"),
            Status::CapacityExceeded => write!(f, "Capacity exceeded"),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let msg = status.to_string();
        match status {
            Status::InvalidParam => Error::InvalidParam(msg),
            Status::NotFound => Error::NotFound(msg),
            Status::DataCorrupted | Status::WrongMagic | Status::WrongVersion => {
                Error::InvalidTile(msg)
            }
            Status::InvalidHandle => Error::InvalidHandle(msg),
            Status::CapacityExceeded => Error::CapacityExceeded(msg),
            _ => Error::Detour(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_is_success() {
        assert!(Status::PartialResult.is_success());
        assert!(Status::PartialResult.is_partial());
        assert!(Status::NotFound.is_failure());
    }

    #[test]
    fn test_status_to_error() {
        assert!(matches!(Error::from(Status::NotFound), Error::NotFound(_)));
        assert!(matches!(
            Error::from(Status::WrongMagic),
            Error::InvalidTile(_)
        ));
        assert!(Status::InvalidHandle.to_result(()).is_err());
        assert_eq!(Status::Success.to_result(5).ok(), Some(5));
    }
}
