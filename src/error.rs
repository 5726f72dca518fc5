//! Error types for the pcb_inspect library

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pcb_inspect operations
pub type Result<T> = std::result::Result<T, InspectError>;

/// Comprehensive error types for inspection operations
#[derive(Error, Debug)]
pub enum InspectError {
    /// Image file could not be loaded or decoded
    #[error("Failed to load image {path}: {message}")]
    ImageLoad {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Registration confidence stayed below the floor after exhausting fallbacks
    #[error("Registration failed: confidence {confidence:.3} below floor {floor:.3} (method: {method})")]
    RegistrationFailed {
        method: String,
        confidence: f64,
        floor: f64,
    },

    /// No valid regions found by any segmentation strategy
    #[error("Segmentation failed: {reason}")]
    SegmentationFailed { reason: String },

    /// Generic processing error
    #[error("Processing error: {0}")]
    Processing(String),

    /// Invalid input parameters
    #[error("Invalid parameter: {parameter} = {value}")]
    InvalidParameter { parameter: String, value: String },

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// OpenCV operation failed
    #[error("OpenCV error during {operation}")]
    OpenCv {
        operation: String,
        #[source]
        source: opencv::Error,
    },
}

impl InspectError {
    /// Create an image load error with context
    pub fn image_load<E>(path: impl Into<PathBuf>, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ImageLoad {
            path: path.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an OpenCV error with context
    pub fn opencv(operation: impl Into<String>, source: opencv::Error) -> Self {
        Self::OpenCv {
            operation: operation.into(),
            source,
        }
    }

    /// Create a config error with context
    pub fn config<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check whether this error maps to a per-item Error verdict rather
    /// than aborting the batch
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            InspectError::ImageLoad { .. }
                | InspectError::RegistrationFailed { .. }
                | InspectError::SegmentationFailed { .. }
        )
    }

    /// User-friendly error description for operator display
    pub fn user_message(&self) -> String {
        match self {
            InspectError::ImageLoad { path, .. } => {
                format!(
                    "Could not load the image {}. Please check the file format and try again.",
                    path.display()
                )
            }
            InspectError::RegistrationFailed { .. } => {
                "Could not align the test image to the golden sample. Please check camera positioning.".to_string()
            }
            InspectError::SegmentationFailed { .. } => {
                "Could not locate any inspectable regions on the panel. Please check lighting and panel placement.".to_string()
            }
            InspectError::Config { .. } => {
                "Could not read the inspection configuration file.".to_string()
            }
            _ => "Inspection failed. Please retry with a different image.".to_string(),
        }
    }
}

/// Wrap an OpenCV call result with an operation label
pub(crate) fn cv<T>(operation: &str, res: opencv::Result<T>) -> Result<T> {
    res.map_err(|e| InspectError::opencv(operation, e))
}
