use std::error;
use std::fmt;
use std::io;

use nix::errno::Errno;

/// A Hydra error.
///
/// Most of the library reports problems through the logging layer (a failed
/// read on one connection is that connection's problem, not the caller's),
/// so this covers only the places where the caller can meaningfully act.
#[derive(Debug)]
pub enum Error {
    /// An IO error from the OS.
    Io(io::Error),
    /// A raw errno from a syscall.
    Sys(Errno),
    /// The target event loop no longer exists.
    ///
    /// Returned when submitting work through a [`LoopHandle`](crate::LoopHandle)
    /// whose loop has already been destroyed. Handles are cheap clones and may
    /// outlive their loop, so this is an ordinary condition, not a bug.
    LoopGone,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Sys(e) => write!(f, "syscall error: {}", e),
            Error::LoopGone => write!(f, "the event loop is gone"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Sys(e) => Some(e),
            Error::LoopGone => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Sys(e)
    }
}

/// A result for Hydra operations that may fail
pub type Result<T> = std::result::Result<T, Error>;

// Log and die. For invariant violations only, where limping on would turn a
// localized bug into silent corruption somewhere else.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        std::process::abort();
    }};
}

pub(crate) use fatal;
