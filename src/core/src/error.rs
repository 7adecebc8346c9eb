use thiserror::Error;

/// Why an authentication step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// The `WWW-Authenticate` challenge was missing or could not be parsed
    MalformedChallenge,
    /// The registry or token service rejected the credentials
    Unauthorized,
    /// The token service answered without a usable token
    InvalidTokenResponse,
}

impl std::fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedChallenge => write!(f, "malformed challenge"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::InvalidTokenResponse => write!(f, "invalid token response"),
        }
    }
}

/// Hoist error types
#[derive(Error, Debug)]
pub enum HoistError {
    /// Authentication handshake failed
    #[error("Auth error ({kind}): {message}")]
    Auth { kind: AuthErrorKind, message: String },

    /// Unknown repository, tag, manifest or blob
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Manifest media type or platform this client cannot handle
    #[error("Unsupported manifest: {0}")]
    UnsupportedFormat(String),

    /// Manifest could not be decoded or is internally inconsistent
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Downloaded content does not match its declared digest or size
    #[error("Integrity error: {digest} (expected {expected}, got {actual})")]
    Integrity {
        digest: String,
        expected: String,
        actual: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level failure, considered transient
    #[error("Network error: {url} - {message}")]
    Network { url: String, message: String },

    /// Malformed image reference
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Assembly attempted with missing or unverified inputs
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl HoistError {
    /// Build an authentication error.
    pub fn auth(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self::Auth {
            kind,
            message: message.into(),
        }
    }

    /// Build a not-found error for the given identifier.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Build a network error for the given URL.
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Whether a caller may retry the whole operation.
    ///
    /// Only transport failures qualify. Integrity failures always surface.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

impl From<serde_json::Error> for HoistError {
    fn from(err: serde_json::Error) -> Self {
        HoistError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for HoistError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        HoistError::Network {
            url,
            message: err.to_string(),
        }
    }
}

/// Result type alias for hoist operations
pub type Result<T> = std::result::Result<T, HoistError>;
