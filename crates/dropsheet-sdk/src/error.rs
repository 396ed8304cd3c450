use std::fmt;

#[derive(Debug)]
pub enum DropsheetSDKError {
    JsonError(String),
    InvalidArgument(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    Transport(String),
    InvalidOperation(String),
    Config(String),
    InvalidData(String),
}

impl fmt::Display for DropsheetSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropsheetSDKError::JsonError(e) => write!(f, "JSON error: {}", e),
            DropsheetSDKError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            DropsheetSDKError::KvStore(e) => write!(f, "KV store error: {}", e),
            DropsheetSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            DropsheetSDKError::IO(e) => write!(f, "IO error: {}", e),
            DropsheetSDKError::Transport(e) => write!(f, "Transport error: {}", e),
            DropsheetSDKError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            DropsheetSDKError::Config(e) => write!(f, "Config error: {}", e),
            DropsheetSDKError::InvalidData(e) => write!(f, "Invalid data: {}", e),
        }
    }
}

impl std::error::Error for DropsheetSDKError {}

impl From<serde_json::Error> for DropsheetSDKError {
    fn from(error: serde_json::Error) -> Self {
        DropsheetSDKError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for DropsheetSDKError {
    fn from(error: std::io::Error) -> Self {
        DropsheetSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for DropsheetSDKError {
    fn from(error: sled::Error) -> Self {
        DropsheetSDKError::KvStore(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DropsheetSDKError>;
