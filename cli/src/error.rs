use syncstores::{AdapterError, StorageError};

/// Everything that can end a command line run
#[derive(Debug)]
pub enum CliError {
    Database(rusqlite::Error),
    Config(String),
    Adapter(AdapterError),
    Storage(StorageError),
    /// The value argument of `set` is not JSON
    Value(serde_json::Error),
    /// The key is not among the configured keys
    UnknownKey(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "Database error: {e}"),
            Self::Config(msg) => write!(f, "Bad configuration: {msg}"),
            Self::Adapter(e) => write!(f, "{e}"),
            Self::Storage(e) => write!(f, "Storage error: {e}"),
            Self::Value(e) => write!(f, "Value is not valid JSON: {e}"),
            Self::UnknownKey(key) => write!(f, "Key is not configured: {key}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Database(e) => Some(e),
            Self::Adapter(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Value(e) => Some(e),
            Self::Config(_) | Self::UnknownKey(_) => None,
        }
    }
}

impl From<rusqlite::Error> for CliError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e)
    }
}

impl From<AdapterError> for CliError {
    fn from(e: AdapterError) -> Self {
        Self::Adapter(e)
    }
}

impl From<StorageError> for CliError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}
