use std::fmt::Display;

/// Chaindb errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Persisted state that cannot be read back or decoded. Once this
    /// surfaces the index state is unknown and the database must stop.
    Corrupt(String),
    /// Invalid caller input, such as a payload larger than a heap segment.
    InvalidInput(String),
    /// An operation that does not fit the store's current state.
    InvalidState(String),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corrupt(msg) => write!(f, "corrupt state: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// A chaindb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupt(err.to_string())
    }
}
