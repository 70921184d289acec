use crate::parser::ParseError;
use std::io;

/// Central error type for the satie engine.
#[derive(Debug)]
pub enum SatieError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Error during HTTP request parsing.
    Parse(ParseError),
    /// Connection slab reached its maximum capacity.
    SlabFull,
    /// Invalid or missing configuration.
    Config(String),
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for SatieError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SatieError::Io(e) => write!(f, "I/O error: {}", e),
            SatieError::Parse(e) => write!(f, "Parse error: {:?}", e),
            SatieError::SlabFull => write!(f, "Connection slab is full"),
            SatieError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SatieError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for SatieError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SatieError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SatieError {
    fn from(e: io::Error) -> Self {
        SatieError::Io(e)
    }
}

impl From<ParseError> for SatieError {
    fn from(e: ParseError) -> Self {
        SatieError::Parse(e)
    }
}

pub type SatieResult<T> = Result<T, SatieError>;
