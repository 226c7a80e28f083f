use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssetPulseError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into AssetPulseError automatically

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error), // Converts serde_json::Error automatically

    #[error("Storage error: {0}")]
    Storage(String), // Object-store lookup failures (network, permission)

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}
