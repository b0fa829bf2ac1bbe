//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::ApiError;

/// Map domain errors to a string for CLI output. Capture failures lead with
/// the error kind and the device or object path.
pub fn map_error(e: &ApiError) -> String {
    match e {
        ApiError::Capture(capture) => {
            format!("{} at {}: {}", capture.kind(), capture.location(), capture)
        }
        other => other.to_string(),
    }
}
