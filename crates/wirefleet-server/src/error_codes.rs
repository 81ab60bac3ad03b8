//! Standardized error codes for the Wirefleet API
//!
//! Error codes provide machine-readable error identification
//! in addition to human-readable error messages.

use axum::http::StatusCode;
use serde::Serialize;
use wirefleet_core::FleetError;

/// API error response with standardized error code
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    /// Human-readable error message
    pub error: String,
    /// Machine-readable error code
    pub code: u32,
    /// Additional details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.as_u32(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Standardized error codes
///
/// Error code ranges:
/// - 1100-1199: Authorization errors
/// - 1200-1299: Validation errors
/// - 1300-1399: Resource errors
/// - 1500-1599: Server errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    // Authorization (1100-1199)
    /// Missing device api key
    MissingAuthorization = 1101,
    /// API key is invalid, foreign or its device is disabled
    InvalidApiKey = 1104,

    // Validation (1200-1299)
    /// Field value is invalid
    InvalidField = 1202,

    // Resource errors (1300-1399)
    /// Requested resource was not found
    NotFound = 1301,
    /// Resource conflict (e.g., id mismatch)
    ResourceConflict = 1303,
    /// No available resources (e.g., IP addresses exhausted)
    ResourceExhausted = 1304,

    // Server errors (1500-1599)
    /// Internal server error
    InternalError = 1501,
    /// The record store did not answer in time
    StoreUnavailable = 1502,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::MissingAuthorization => "Authorization required",
            ErrorCode::InvalidApiKey => "Invalid or revoked API key",
            ErrorCode::InvalidField => "Invalid field value",
            ErrorCode::NotFound => "Requested resource not found",
            ErrorCode::ResourceConflict => "Resource conflict",
            ErrorCode::ResourceExhausted => "No available resources",
            ErrorCode::InternalError => "An internal error occurred",
            ErrorCode::StoreUnavailable => "Store temporarily unavailable. Please retry",
        }
    }

    /// HTTP status and code for an engine error
    pub fn classify(err: &FleetError) -> (StatusCode, ErrorCode) {
        match err {
            FleetError::NotFound { .. } => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
            FleetError::ExhaustedPool(_) => (StatusCode::CONFLICT, ErrorCode::ResourceExhausted),
            FleetError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, ErrorCode::InvalidField),
            FleetError::Conflict(_) => (StatusCode::CONFLICT, ErrorCode::ResourceConflict),
            FleetError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, ErrorCode::InvalidApiKey),
            FleetError::Timeout(_) => (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::StoreUnavailable),
            FleetError::Database(_) | FleetError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError)
            }
        }
    }
}
