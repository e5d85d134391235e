use std::{collections::TryReserveError, io, path::PathBuf};

use thiserror::Error;

use crate::engine::WorkerPid;

/// Exit code for configuration and validation errors.
pub const EXIT_CONFIG: i32 = 2;
/// Exit code for any other runtime failure.
pub const EXIT_FAILURE: i32 = 1;

/// Invalid or incomplete configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("must have at least one process")]
    NoProcesses,
    #[error("cannot configure options for process {id}: max processes is {max}")]
    InvalidProcess { id: u64, max: u64 },
    #[error("no URL found for process {id}")]
    MissingUrl { id: u64 },
    #[error("no candidate for positional argument '{url}': process {id} already has a URL")]
    DuplicateUrl { id: u64, url: String },
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported scheme '{scheme}' in URL '{url}': only http is supported")]
    UnsupportedScheme { url: String, scheme: String },
    #[error("invalid header '{header}': {reason}")]
    InvalidHeader { header: String, reason: String },
    #[error("failed to load headers from '{}': {source}", path.display())]
    HeaderFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid delay for process {id}: minimum {min}ms is greater than maximum {max}ms")]
    InvalidDelay { id: u64, min: u64, max: u64 },
    #[error("max time must be positive")]
    InvalidMaxTime,
}

/// Memory exhaustion while building the configuration.
#[derive(Debug, Error)]
#[error("cannot allocate memory for {what}")]
pub struct ResourceError {
    what: &'static str,
    #[source]
    source: TryReserveError,
}

impl ResourceError {
    #[inline]
    pub fn new(what: &'static str, source: TryReserveError) -> Self {
        Self { what, source }
    }
}

/// Failed to bring a single worker slot up.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to build request payload for worker {id}: {source}")]
    Payload {
        id: u64,
        #[source]
        source: http::Error,
    },
    #[error("failed to start thread for worker {id}: {source}")]
    Thread {
        id: u64,
        #[source]
        source: io::Error,
    },
}

/// A worker did not acknowledge forced termination.
#[derive(Debug, Error)]
#[error("worker {id} ({pid}) did not exit after being killed, detaching it")]
pub struct TerminationError {
    pub pid: WorkerPid,
    pub id: u64,
}

/// Errors surfaced to the invoking caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(..) => EXIT_CONFIG,
            Self::Resource(..) => libc::ENOMEM,
            Self::Io(..) => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(2, Error::from(ConfigError::NoProcesses).exit_code());

        let mut v: Vec<u8> = Vec::new();
        let err = v.try_reserve(usize::MAX).unwrap_err();
        assert_eq!(libc::ENOMEM, Error::from(ResourceError::new("headers", err)).exit_code());

        assert_eq!(1, Error::from(io::Error::other("boom")).exit_code());
    }

    #[test]
    fn config_error_names_the_process() {
        let err = ConfigError::MissingUrl { id: 3 };
        assert_eq!("no URL found for process 3", err.to_string());
    }
}
