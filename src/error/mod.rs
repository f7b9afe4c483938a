//! Error module for feedrelay
//!
//! Every failure the relay can report carries an [`ErrorCode`]. Codes are
//! grouped by category so callers can tell "nothing to show" apart from
//! "something is broken" without matching on message text.

use thiserror::Error;
use std::fmt;

/// Error code reported by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Data errors (0x0101-0x0200)
    NotFound = 0x0101,
    UnknownTopic = 0x0102,
    MalformedMessage = 0x0103,

    // Source errors (0x0201-0x0300)
    SourceUnavailable = 0x0201,
    CacheUnavailable = 0x0202,

    // Provider errors (0x0301-0x0400)
    ProviderConnectionLost = 0x0301,

    // Transport errors (0x0401-0x0500)
    TransportClosed = 0x0401,

    // System errors (0x0501-0x0600)
    InternalServerError = 0x0501,
    ConfigInvalid = 0x0502,
}

impl ErrorCode {
    /// Get the numeric value of the code
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the error code category
    pub fn category(&self) -> ErrorCategory {
        match *self as u16 {
            0x0101..=0x0200 => ErrorCategory::Data,
            0x0201..=0x0300 => ErrorCategory::Source,
            0x0301..=0x0400 => ErrorCategory::Provider,
            0x0401..=0x0500 => ErrorCategory::Transport,
            0x0501..=0x0600 => ErrorCategory::System,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Try to convert a u16 to an ErrorCode
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0x0101 => Some(Self::NotFound),
            0x0102 => Some(Self::UnknownTopic),
            0x0103 => Some(Self::MalformedMessage),
            0x0201 => Some(Self::SourceUnavailable),
            0x0202 => Some(Self::CacheUnavailable),
            0x0301 => Some(Self::ProviderConnectionLost),
            0x0401 => Some(Self::TransportClosed),
            0x0501 => Some(Self::InternalServerError),
            0x0502 => Some(Self::ConfigInvalid),
            _ => None,
        }
    }

    /// Get a human-readable description of the error code
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotFound => "No data available yet",
            Self::UnknownTopic => "Topic is not configured",
            Self::MalformedMessage => "Pub/sub payload could not be parsed",
            Self::SourceUnavailable => "Cache and durable store both failed",
            Self::CacheUnavailable => "Cache could not be reached",
            Self::ProviderConnectionLost => "Connection to the pub/sub provider dropped",
            Self::TransportClosed => "Viewer disconnected",
            Self::InternalServerError => "Unexpected server error",
            Self::ConfigInvalid => "Invalid configuration",
        }
    }

    /// Whether a viewer may reasonably retry after seeing this code
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable | Self::CacheUnavailable | Self::ProviderConnectionLost
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "NOT_FOUND",
            Self::UnknownTopic => "UNKNOWN_TOPIC",
            Self::MalformedMessage => "MALFORMED_MESSAGE",
            Self::SourceUnavailable => "SOURCE_UNAVAILABLE",
            Self::CacheUnavailable => "CACHE_UNAVAILABLE",
            Self::ProviderConnectionLost => "PROVIDER_CONNECTION_LOST",
            Self::TransportClosed => "TRANSPORT_CLOSED",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::ConfigInvalid => "CONFIG_INVALID",
        };
        write!(f, "{} (0x{:04X})", name, *self as u16)
    }
}

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Data,
    Source,
    Provider,
    Transport,
    System,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "Data"),
            Self::Source => write!(f, "Source"),
            Self::Provider => write!(f, "Provider"),
            Self::Transport => write!(f, "Transport"),
            Self::System => write!(f, "System"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Main error type for feedrelay
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("{code}: {message}")]
    Standard {
        code: ErrorCode,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl FeedError {
    /// Create a new standard error with the given code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Standard {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SourceUnavailable, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProviderConnectionLost, message)
    }

    /// Get the error code if this is a standard error
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Standard { code, .. } => Some(*code),
            Self::Config(_) => Some(ErrorCode::ConfigInvalid),
            _ => None,
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::Standard { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(ErrorCode::NotFound)
    }

    /// HTTP-equivalent status for the non-streaming snapshot fetch
    pub fn http_status(&self) -> u16 {
        match self.code() {
            Some(ErrorCode::NotFound) | Some(ErrorCode::UnknownTopic) => 404,
            Some(ErrorCode::MalformedMessage) => 400,
            _ => 500,
        }
    }
}

/// Result type alias for feedrelay operations
pub type Result<T> = std::result::Result<T, FeedError>;

impl From<String> for FeedError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

impl From<&str> for FeedError {
    fn from(message: &str) -> Self {
        Self::Other(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_u16() {
        for code in [
            ErrorCode::NotFound,
            ErrorCode::SourceUnavailable,
            ErrorCode::ProviderConnectionLost,
            ErrorCode::TransportClosed,
            ErrorCode::ConfigInvalid,
        ] {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(0xFFFF), None);
    }

    #[test]
    fn categories_follow_code_ranges() {
        assert_eq!(ErrorCode::NotFound.category(), ErrorCategory::Data);
        assert_eq!(ErrorCode::SourceUnavailable.category(), ErrorCategory::Source);
        assert_eq!(ErrorCode::ProviderConnectionLost.category(), ErrorCategory::Provider);
        assert_eq!(ErrorCode::TransportClosed.category(), ErrorCategory::Transport);
        assert_eq!(ErrorCode::ConfigInvalid.category(), ErrorCategory::System);
    }

    #[test]
    fn display_includes_name_and_hex() {
        let err = FeedError::not_found("No data found for movers:sensex");
        assert_eq!(
            err.to_string(),
            "NOT_FOUND (0x0101): No data found for movers:sensex"
        );
        assert_eq!(err.message(), "No data found for movers:sensex");
    }

    #[test]
    fn http_status_separates_empty_from_broken() {
        assert_eq!(FeedError::not_found("x").http_status(), 404);
        assert_eq!(FeedError::new(ErrorCode::UnknownTopic, "x").http_status(), 404);
        assert_eq!(FeedError::new(ErrorCode::MalformedMessage, "x").http_status(), 400);
        assert_eq!(FeedError::source_unavailable("x").http_status(), 500);
        assert_eq!(FeedError::from("boom").http_status(), 500);
    }
}
