// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::libc::{
    c_int,
    EAGAIN,
    ECANCELED,
    EIO,
    ENODEV,
    ETIMEDOUT,
};
use ::std::{
    error,
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// Failure
///
/// The error code classifies the failure:
///
/// | errno       | condition                                   |
/// |-------------|---------------------------------------------|
/// | `EAGAIN`    | resource exhausted (retry once capacity frees) |
/// | `EINVAL`    | invalid argument                            |
/// | `ETIMEDOUT` | deadline exceeded                           |
/// | `ENOENT`    | not found                                   |
/// | `ENOTSUP`   | unimplemented                               |
/// | `EIO`       | internal                                    |
/// | `ENODEV`    | device lost                                 |
/// | `ECANCELED` | cancelled                                   |
#[derive(Clone)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Checks if the operation that produced this failure may succeed later without any change from the caller, such
    /// as after a pool regains capacity.
    pub fn should_retry(&self) -> bool {
        self.errno == EAGAIN
    }

    /// Checks if this failure reports an expired deadline.
    pub fn is_deadline_exceeded(&self) -> bool {
        self.errno == ETIMEDOUT
    }

    /// Checks if this failure reports a lost device.
    pub fn is_device_lost(&self) -> bool {
        self.errno == ENODEV
    }

    /// Checks if this failure reports a cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.errno == ECANCELED
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Debug trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Conversion Trait Implementation for Fail
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: format!("I/O error: {}", e),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::Fail;
    use ::anyhow::Result;
    use ::std::io;

    #[test]
    fn classifies_errno() -> Result<()> {
        crate::ensure_eq!(Fail::new(libc::EAGAIN, "pool empty").should_retry(), true);
        crate::ensure_eq!(Fail::new(libc::EINVAL, "bad").should_retry(), false);
        crate::ensure_eq!(Fail::new(libc::ETIMEDOUT, "late").is_deadline_exceeded(), true);
        crate::ensure_eq!(Fail::new(libc::ENODEV, "gone").is_device_lost(), true);
        crate::ensure_eq!(Fail::new(libc::ECANCELED, "stop").is_cancelled(), true);
        Ok(())
    }

    #[test]
    fn converts_io_errors() -> Result<()> {
        let fail: Fail = Fail::from(io::Error::from_raw_os_error(libc::EAGAIN));
        crate::ensure_eq!(fail.errno, libc::EAGAIN);

        let fail: Fail = Fail::from(io::Error::new(io::ErrorKind::Other, "opaque"));
        crate::ensure_eq!(fail.errno, libc::EIO);
        Ok(())
    }
}
