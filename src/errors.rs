//! Error record shared by all launcher processes
//!
//! A failure in the intermediate or the grandchild is serialized over the
//! spawn pipe and reported verbatim by the supervisor, so the error type
//! carries everything the other side needs: a coarse kind, the errno (when
//! one was involved) and a human-readable message.

use std::io::{self, Read};

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for launcher operations
pub type Result<T> = std::result::Result<T, TaskError>;

/// Coarse failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Argument or policy violation (bad command, escaped bind target,
    /// unexpected fd numbering)
    InvalidValue,
    /// The kernel refused to create the process (clone returning ENOMEM)
    ResourceNotAvailable,
    /// Out of space while preparing the working directory
    NoSpace,
    /// Catch-all wrapping an errno
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidValue => write!(f, "invalid value"),
            ErrorKind::ResourceNotAvailable => write!(f, "resource not available"),
            ErrorKind::NoSpace => write!(f, "no space"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Errors that can occur while starting or managing a task
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}{}", errno_suffix(*.errno))]
pub struct TaskError {
    pub kind: ErrorKind,
    pub errno: i32,
    pub message: String,
}

fn errno_suffix(errno: i32) -> String {
    if errno == 0 {
        String::new()
    } else {
        format!(" ({})", io::Error::from_raw_os_error(errno))
    }
}

impl TaskError {
    pub fn new(kind: ErrorKind, errno: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            errno,
            message: message.into(),
        }
    }

    /// Argument or policy violation without an underlying errno
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValue, 0, message)
    }

    pub fn no_space(errno: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoSpace, errno, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, 0, message)
    }

    /// Wrap the calling thread's current errno, `context` naming the
    /// syscall that failed
    pub fn from_errno(kind: ErrorKind, context: impl Into<String>) -> Self {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::new(kind, errno, context)
    }

    /// Wrap a nix error as `Unknown` with its errno preserved
    pub fn from_nix(context: impl Into<String>, errno: nix::errno::Errno) -> Self {
        Self::new(ErrorKind::Unknown, errno as i32, context)
    }

    pub fn is_no_space(&self) -> bool {
        self.kind == ErrorKind::NoSpace
    }

    /// Serialize onto a pipe fd. Used by the intermediate and the
    /// grandchild to report the first failure to the supervisor.
    pub fn serialize_to<W: io::Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)
            .map_err(|e| TaskError::unknown(format!("serialize error record: {}", e)))
    }

    /// Read an error record from a pipe fd. `Ok(None)` means the writer
    /// closed the pipe without reporting anything, which the protocol
    /// defines as success.
    pub fn deserialize_from<R: Read>(mut reader: R) -> Result<Option<TaskError>> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .map_err(|e| TaskError::unknown(format!("read error record: {}", e)))?;
        if buf.is_empty() {
            return Ok(None);
        }
        match bincode::deserialize(&buf) {
            Ok(error) => Ok(Some(error)),
            Err(e) => {
                warn!("malformed error record on spawn pipe: {}", e);
                Err(TaskError::unknown(format!(
                    "deserialize error record: {}",
                    e
                )))
            }
        }
    }
}

impl From<io::Error> for TaskError {
    fn from(e: io::Error) -> Self {
        Self::new(
            ErrorKind::Unknown,
            e.raw_os_error().unwrap_or(0),
            e.to_string(),
        )
    }
}
