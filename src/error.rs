use crate::request::Direction;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Allocation failure: {0}")]
    Allocation(String),

    #[error("Request not found: {file_id} {direction:?} offset={offset} length={length}")]
    NotFound {
        file_id: String,
        direction: Direction,
        offset: u64,
        length: u64,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No usable processing callback was provided")]
    NoCallback,

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Unknown scheduling policy: {0}")]
    UnknownPolicy(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn not_found(file_id: &str, direction: Direction, offset: u64, length: u64) -> Self {
        Error::NotFound {
            file_id: file_id.to_string(),
            direction,
            offset,
            length,
        }
    }

    pub fn error_code(&self) -> i32 {
        match self {
            Error::Io(_) => -1,
            Error::Allocation(_) => -2,
            Error::NotFound { .. } => -3,
            Error::InvalidConfiguration(_) => -4,
            Error::NoCallback => -5,
            Error::ShuttingDown => -6,
            Error::UnknownPolicy(_) => -7,
            Error::Serialization(_) => -8,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
