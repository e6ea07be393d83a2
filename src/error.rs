use tokio::task::JoinError;
use exif::Error as ExifError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("EXIF error: {0}")]
    Exif(#[from] ExifError),

    #[error("JSON error: {0}")]
    Json(#[from] SerdeJsonError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Tokio join error: {0}")]
    Join(#[from] JoinError),

    #[error("Track error: {0}")]
    Track(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Channel send error")]
    SendError,

    #[error("Generic error: {0}")]
    Generic(String),
}

impl<T> From<crossbeam_channel::SendError<T>> for AppError {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        AppError::SendError
    }
}

impl From<quick_xml::events::attributes::AttrError> for AppError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        AppError::Xml(quick_xml::Error::from(e))
    }
}
