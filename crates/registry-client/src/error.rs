//! Error types for registry operations.

use thiserror::Error;

/// Errors surfaced by the registry client.
///
/// Callers are expected to branch on the kind where it changes control
/// flow: a [`RegistryError::NotFound`] from discovery means "zero
/// instances", not a fatal condition.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No transport is bound to the client or namespace handle.
    #[error("not found, registry not connected")]
    NotConnected,

    /// Empty query result, absent key or absent value, or a session the
    /// registry no longer knows. Other 404 answers arrive as
    /// [`RegistryError::Http`].
    #[error("not found: {0}")]
    NotFound(String),

    /// Network or registry-side failure, passed through unchanged.
    #[error("transport error: {0}")]
    Transport(String),

    /// The registry answered with a non-success status.
    #[error("registry returned {status}: {body}")]
    Http { status: u16, body: String },

    /// Malformed structured payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// A value could not be serialized before writing.
    #[error("encode error: {0}")]
    Encode(String),

    /// Local instance state rejected before any transport call.
    #[error("invalid instance: {0}")]
    InvalidInstance(String),

    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RegistryError {
    /// True for [`RegistryError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }

    /// True for [`RegistryError::NotConnected`].
    pub fn is_not_connected(&self) -> bool {
        matches!(self, RegistryError::NotConnected)
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RegistryError::Decode(e.to_string())
        } else {
            RegistryError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Decode(e.to_string())
    }
}

impl From<toml::de::Error> for RegistryError {
    fn from(e: toml::de::Error) -> Self {
        RegistryError::Decode(e.to_string())
    }
}

impl From<toml::ser::Error> for RegistryError {
    fn from(e: toml::ser::Error) -> Self {
        RegistryError::Encode(e.to_string())
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            RegistryError::NotConnected.to_string(),
            "not found, registry not connected"
        );
        assert_eq!(
            RegistryError::NotFound("orders".into()).to_string(),
            "not found: orders"
        );
        assert_eq!(
            RegistryError::Http {
                status: 500,
                body: "rpc error".into()
            }
            .to_string(),
            "registry returned 500: rpc error"
        );
    }

    #[test]
    fn kind_helpers() {
        assert!(RegistryError::NotFound("x".into()).is_not_found());
        assert!(!RegistryError::NotConnected.is_not_found());
        assert!(RegistryError::NotConnected.is_not_connected());
    }

    #[test]
    fn json_errors_map_to_decode() {
        let err: RegistryError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, RegistryError::Decode(_)));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RegistryError>();
    }
}
