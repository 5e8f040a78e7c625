use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Platform capability a permission prompt was shown for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Location,
    BackgroundLocation,
    Microphone,
    Notifications,
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Capability::Location => write!(f, "location"),
            Capability::BackgroundLocation => write!(f, "background location"),
            Capability::Microphone => write!(f, "microphone"),
            Capability::Notifications => write!(f, "notifications"),
        }
    }
}

/// Safety monitor error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafetyError {
    #[error("Permission denied: {0}")]
    PermissionDenied(Capability),

    /// Request failed before a response arrived (`status` is `None`) or the
    /// server answered with a non-2xx status.
    #[error("Network error: {message}")]
    Network {
        status: Option<u16>,
        message: String,
    },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{0} is already active")]
    ResourceBusy(&'static str),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The owning session was torn down while the call was in progress
    #[error("{0} has been shut down")]
    ShutDown(&'static str),
}

impl SafetyError {
    pub fn network(message: impl Into<String>) -> Self {
        SafetyError::Network {
            status: None,
            message: message.into(),
        }
    }

    /// Message the server put in its `{msg}` body, if the failure carried one
    pub fn server_message(&self) -> Option<&str> {
        match self {
            SafetyError::Network {
                status: Some(_),
                message,
            } => Some(message.as_str()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SafetyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return SafetyError::network("request timed out");
        }
        SafetyError::network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SafetyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_only_for_http_failures() {
        let rejected = SafetyError::Network {
            status: Some(400),
            message: "No trusted contacts".to_string(),
        };
        assert_eq!(rejected.server_message(), Some("No trusted contacts"));

        let unreachable = SafetyError::network("connection refused");
        assert_eq!(unreachable.server_message(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            SafetyError::PermissionDenied(Capability::Microphone).to_string(),
            "Permission denied: microphone"
        );
        assert_eq!(
            SafetyError::ResourceBusy("Audio recording").to_string(),
            "Audio recording is already active"
        );
        assert_eq!(
            SafetyError::ShutDown("Recording").to_string(),
            "Recording has been shut down"
        );
    }
}
