//! The possible error types when running a `workmill` job.

use std::error;
use std::fmt;
use std::io;

/// An enumeration of every error the work-distribution core can surface.
///
/// The variants fall into the buckets that matter operationally:
/// - `Config`/`Io`: startup failures, fatal before any work is issued
/// - `Record`: a per-element application error, logged and swallowed
/// - `TerminateJob`: an application request to abort the entire job
/// - everything else: transport, protocol, and pool failures
#[derive(Debug)]
pub enum Error {
    /// A required property is missing or a property value is malformed
    Config(String),
    /// The input source or a socket could not be read/written
    Io(io::Error),
    /// A message could not be serialized or deserialized
    Serialization(bincode::Error),
    /// The peer closed its stream while a message was expected
    StreamClosed,
    /// A message was addressed to or received from an unknown node id
    UnknownId,
    /// A message of an unexpected variant arrived
    UnexpectedMessage,
    /// A wire-protocol violation, e.g. an oversized MessageCenter frame
    Protocol(String),
    /// A `WorkPackageProcessor` failed on one element; the job continues
    Record(String),
    /// A `WorkPackageProcessor` asked for the entire job to stop now
    TerminateJob(String),
    /// A pool worker exited or panicked while it was still needed
    WorkerGone(usize),
    /// A record value is too large for the element encoding (>= 2^32 octets)
    ValueTooLarge(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Serialization(e) => {
                write!(f, "Serialization error: {}", e)
            }
            Error::StreamClosed => write!(f, "Stream closed by peer"),
            Error::UnknownId => write!(f, "Unknown node id"),
            Error::UnexpectedMessage => {
                write!(f, "Received an unexpected message")
            }
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::Record(msg) => {
                write!(f, "Element processing error: {}", msg)
            }
            Error::TerminateJob(msg) => {
                write!(f, "Job termination requested: {}", msg)
            }
            Error::WorkerGone(id) => {
                write!(f, "Worker {} exited unexpectedly", id)
            }
            Error::ValueTooLarge(size) => write!(
                f,
                "Record value of {} bytes exceeds the encoding limit",
                size
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e)
    }
}

impl Error {
    /// `true` for the errors a worker loop must propagate instead of
    /// swallowing: anything that is not a per-element failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Record(_))
    }
}
