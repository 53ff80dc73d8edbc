use core::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller passed an invalid argument, buffer, or bitstream.
    InvalidArg,
    /// The requested format or sub-sampling combination is not supported by the hardware.
    NotSupported,
    /// An allocation failed.
    NoMemory,
    /// The hardware reported an error, or a driver object was used in the wrong state.
    InvalidState,
    /// The transaction did not complete within the configured timeout.
    Timeout,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArg => "invalid argument",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::NoMemory => "out of memory",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::Timeout => "timeout",
        }
    }
}

pub struct Error {
    kind: ErrorKind,
    repr: Repr,
}

pub(crate) enum Repr {
    Other(String),
}

impl From<String> for Repr {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}
impl<'a> From<&'a str> for Repr {
    fn from(value: &'a str) -> Self {
        Self::Other(value.into())
    }
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, e: impl Into<Repr>) -> Self {
        Self {
            kind,
            repr: e.into(),
        }
    }

    pub(crate) fn invalid_arg(e: impl Into<Repr>) -> Self {
        Self::new(ErrorKind::InvalidArg, e)
    }

    pub(crate) fn not_supported(e: impl Into<Repr>) -> Self {
        Self::new(ErrorKind::NotSupported, e)
    }

    pub(crate) fn no_memory(e: impl Into<Repr>) -> Self {
        Self::new(ErrorKind::NoMemory, e)
    }

    pub(crate) fn invalid_state(e: impl Into<Repr>) -> Self {
        Self::new(ErrorKind::InvalidState, e)
    }

    pub(crate) fn timeout(e: impl Into<Repr>) -> Self {
        Self::new(ErrorKind::Timeout, e)
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Other(s) => write!(f, "{:?}: {}", self.kind, s),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Other(s) => write!(f, "{}: {}", self.kind.as_str(), s),
        }
    }
}

impl std::error::Error for Error {}
