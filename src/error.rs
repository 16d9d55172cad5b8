// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the consumer-facing APIs.
///
/// `Timeout` and `Stop` are flow-control conditions rather than failures: a
/// timed `read_data` that found no record returns `Timeout` with no side
/// effects, and a consumer blocked on a stream that ended returns `Stop`
/// exactly once per end-of-stream sentinel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timeout")]
    Timeout,

    #[error("stop of stream")]
    Stop,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid handle: {0:#010x}")]
    InvalidHandle(u32),

    #[error("command error: {0}")]
    Command(String),

    #[error("communication error: {0}")]
    Communication(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("too many devices")]
    TooManyDevices,

    #[error("incompatible server version: {0}")]
    BadLibraryVersion(String),

    /// Decoded read attempted while the raw pipeline is active, or vice versa.
    #[error("not enabled")]
    NotEnabled,

    #[error("not yet implemented: {0}")]
    NotYetImplemented(&'static str),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Stable integer projection for the C ABI shim. 0 is success there; the
    /// codes here are the failure half of that enumeration.
    pub fn code(&self) -> i32 {
        match self {
            Error::Generic(_) => -1,
            Error::InvalidArgument(_) => -2,
            Error::InvalidHandle(_) => -3,
            Error::Timeout => -4,
            Error::Stop => -5,
            Error::Command(_) => -6,
            Error::Communication(_) => -7,
            Error::DeviceNotFound(_) => -8,
            Error::TooManyDevices => -9,
            Error::BadLibraryVersion(_) => -10,
            Error::NotEnabled => -11,
            Error::NotYetImplemented(_) => -12,
            Error::Internal(_) => -13,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Communication(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_maps_to_communication() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "peer gone").into();
        assert!(matches!(err, Error::Communication(_)));
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            Error::Generic("x".into()),
            Error::InvalidArgument("x".into()),
            Error::InvalidHandle(0),
            Error::Timeout,
            Error::Stop,
            Error::Command("x".into()),
            Error::Communication("x".into()),
            Error::DeviceNotFound("x".into()),
            Error::TooManyDevices,
            Error::BadLibraryVersion("x".into()),
            Error::NotEnabled,
            Error::NotYetImplemented("x"),
            Error::Internal("x".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(Error::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
