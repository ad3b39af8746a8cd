//! Error envelope returned by the API server, shared by the watch protocol
//! and the admission response.

use serde::{Deserialize, Serialize};

/// An error response from the API.
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error, e.g. "Expired" or "Conflict"
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} ({})",
            self.reason, self.message, self.code
        )
    }
}

impl std::error::Error for ErrorResponse {}

impl ErrorResponse {
    /// Whether this response signals that the supplied resourceVersion has
    /// fallen out of the server's watch window and a relist is required.
    pub fn is_expired(&self) -> bool {
        self.code == 410 || self.reason == "Expired"
    }
}

/// A minimal `Status` object, carried in admission responses.
#[derive(Deserialize, Serialize, Clone, Debug, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Status of the operation; "Success" or "Failure"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Suggested HTTP return code (0 if unset)
    #[serde(default, skip_serializing_if = "is_u16_zero")]
    pub code: u16,
    /// A human-readable description of the status of this operation
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// A machine-readable description of why this operation is in the
    /// "Failure" status
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

fn is_u16_zero(&v: &u16) -> bool {
    v == 0
}

impl Status {
    /// A failure status with a message and reason
    pub fn failure(message: &str, reason: &str) -> Self {
        Status {
            status: "Failure".to_string(),
            code: 0,
            message: message.to_string(),
            reason: reason.to_string(),
        }
    }
}
