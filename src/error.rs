//! Error taxonomy for `meshlink`, surfaced to the application as an
//! enum and logged at the level the caller picks.
//!
//! Mirrors the `Error`/`ErrorKind`/`ResultExt` shape this crate's error
//! handling has always used, minus the build-script code generation:
//! the taxonomy here is small and fixed, so it is written out directly
//! instead of templated from a list at build time.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Wrapper result type used throughout the crate.
pub type Result<T> = result::Result<T, Error>;

/// The error taxonomy exposed to the embedding application.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// No error; only ever produced by conversions, never returned.
    Ok,
    /// Allocation or other resource exhaustion.
    NoMem,
    /// Referenced node, edge, subnet, connection, or file does not exist.
    NoEnt,
    /// Malformed argument.
    Inval,
    /// Another instance holds the config lock, or the operation is not
    /// valid in the handle's current state.
    Busy,
    /// Socket failure or peer unreachable.
    Network,
    /// Malformed meta-protocol line, bad SPTPS tag, or replay.
    Protocol,
    /// Signature verification failed, invitation expired, or name mismatch.
    Auth,
    /// Peer refused: blacklisted, or an incompatible version.
    Peer,
    /// A wait deadline elapsed.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Ok => "OK",
            ErrorKind::NoMem => "NOMEM",
            ErrorKind::NoEnt => "NOENT",
            ErrorKind::Inval => "INVAL",
            ErrorKind::Busy => "BUSY",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Auth => "AUTH",
            ErrorKind::Peer => "PEER",
            ErrorKind::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

impl Error {
    /// Returns an error not wrapping another error implementation.
    pub fn simple(kind: ErrorKind) -> Self {
        Error { inner: ErrorInner::Simple(kind) }
    }

    /// Wraps an arbitrary error, tagging it with `kind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error { inner: ErrorInner::Wrapped(kind, e.into()) }
    }

    /// Returns a copy of this error's `ErrorKind`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Replaces the `ErrorKind` of this error, keeping any wrapped source.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "Error::Simple({:?})", k),
            ErrorInner::Wrapped(k, e) => write!(f, "Error::Wrapped({:?}, {:?})", k, e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "{}", k),
            ErrorInner::Wrapped(k, e) => write!(f, "{}: {}", k, e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.inner {
            ErrorInner::Simple(_) => None,
            ErrorInner::Wrapped(_, e) => Some(e.as_ref()),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::Network, e)
    }
}

/// Extension of `std::result::Result`, wrapping the source error.
pub trait ResultWrappedExt {
    type T;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

/// Extension of `std::result::Result`, dropping the source error.
///
/// Useful when the source error type doesn't implement `Send`/`Sync`,
/// or simply carries no information worth keeping.
pub trait ResultSimpleExt {
    type T;
    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_preserved_through_wrap() {
        let e = Error::wrapped(ErrorKind::Protocol, "bad line");
        assert_eq!(e.kind(), ErrorKind::Protocol);
        assert_eq!(e.to_string(), "PROTOCOL: bad line");
    }

    #[test]
    fn swap_kind_keeps_source() {
        let e = Error::wrapped(ErrorKind::Network, "timed out").swap_kind(ErrorKind::Timeout);
        assert_eq!(e.kind(), ErrorKind::Timeout);
        assert!(e.to_string().starts_with("TIMEOUT"));
    }

    #[test]
    fn io_error_maps_to_network() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let e: Error = io_err.into();
        assert_eq!(e.kind(), ErrorKind::Network);
    }
}
