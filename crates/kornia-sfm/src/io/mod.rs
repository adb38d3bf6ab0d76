/// Camera intrinsics files.
pub mod intrinsics;

/// Per-image feature files.
pub mod features;

/// PLY point-cloud writer.
pub mod ply;

/// Camera pose export.
pub mod poses;

pub use features::*;
pub use intrinsics::*;
pub use ply::*;
pub use poses::*;

/// Error types for the io module.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Error reading or writing a file.
    #[error("error reading or writing file")]
    Io(#[from] std::io::Error),

    /// Malformed JSON content.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed text content.
    #[error("parse error: {0}")]
    Parse(String),

    /// The loaded features do not form a valid view.
    #[error(transparent)]
    View(#[from] crate::features::ViewError),
}
