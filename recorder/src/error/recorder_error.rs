use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Node error: {0}")]
    Node(String),

    #[error("Stat decoding error: {0}")]
    Decode(#[from] common::CommonError),
}
