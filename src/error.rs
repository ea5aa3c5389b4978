use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Malformed bytes at a decode boundary: block, footer, log record or batch.
    DataCorrupted(String),
    /// The database directory or its catalog is structurally invalid.
    DbCorrupted(String),
    /// Another handle already holds the directory lock.
    DbOpenedByOthers(PathBuf),
    InvalidArgument(String),
    InvalidState(String),
    ShuttingDown,
    Io(io::Error),
}

impl Error {
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::DataCorrupted(_) | Error::DbCorrupted(_))
    }
}

// io::Error is not Clone; a group commit failure is fanned out to every waiter.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::DataCorrupted(msg) => Error::DataCorrupted(msg.clone()),
            Error::DbCorrupted(msg) => Error::DbCorrupted(msg.clone()),
            Error::DbOpenedByOthers(path) => Error::DbOpenedByOthers(path.clone()),
            Error::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
            Error::InvalidState(msg) => Error::InvalidState(msg.clone()),
            Error::ShuttingDown => Error::ShuttingDown,
            Error::Io(err) => Error::Io(io::Error::new(err.kind(), err.to_string())),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::DataCorrupted(format!("bincode: {}", err))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::DataCorrupted(msg) => write!(f, "Data corrupted: {}", msg),
            Error::DbCorrupted(msg) => write!(f, "Database corrupted: {}", msg),
            Error::DbOpenedByOthers(path) => {
                write!(f, "Database {} is opened by another handle", path.display())
            }
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::ShuttingDown => write!(f, "Database is shutting down"),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}
