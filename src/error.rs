#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Integrity failure for {artifact}: {reason}")]
    Integrity { artifact: String, reason: String },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt artifact: {0}")]
    Corrupt(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid attestation token: {0}")]
    InvalidToken(String),

    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl VaultError {
    /// Shorthand for an integrity failure on a named artifact.
    pub fn integrity(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        VaultError::Integrity {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }

    /// Only transport failures may be retried, and only by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Transport(_))
    }

    /// Taxonomy name used in batch summaries and readiness details.
    pub fn category(&self) -> &'static str {
        match self {
            VaultError::Config(_) | VaultError::TomlDe(_) | VaultError::TomlSer(_) => {
                "ConfigurationError"
            }
            VaultError::Transport(_) => "TransportError",
            VaultError::AccessDenied(_)
            | VaultError::PolicyViolation(_)
            | VaultError::InvalidToken(_) => "AccessDenied",
            VaultError::Integrity { .. } => "IntegrityFailure",
            VaultError::UnsupportedFormat(_) | VaultError::Corrupt(_) => "UnsupportedFormat",
            VaultError::ResourceExhausted(_) => "ResourceExhausted",
            VaultError::NotFound(_) => "NotFound",
            VaultError::Crypto(_) => "CryptoFailure",
            VaultError::Io(_) | VaultError::Serialization(_) => "IOFailure",
        }
    }
}
